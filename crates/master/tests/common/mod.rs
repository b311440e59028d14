//! 集成测试公共设施
//!
//! 内存存储 + 内存队列 + 脚本化 Worker 模拟器：模拟器消费派发队列，
//! 按节点名的预设结果推进任务状态，Hang 表示 Worker 在执行途中失联。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use flowmaster_config::MasterConfig;
use flowmaster_domain::entities::{Command, ProcessDefinition, ProcessInstance};
use flowmaster_domain::enums::{CommandType, ExecutionStatus, FailureStrategy};
use flowmaster_domain::repositories::{ProcessStore, TaskDispatchQueue};
use flowmaster_master::{CollectingAlerter, DagEngine, StopFlag};
use flowmaster_storage::{InMemoryProcessStore, InMemoryTaskDispatchQueue};

pub const MASTER_HOST: &str = "10.0.0.1:5678";
pub const WORKER_HOST: &str = "10.0.0.9:1234";

/// 测试用快节拍配置
pub fn fast_master_config() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.host = "10.0.0.1".to_string();
    config.port = 5678;
    config.tick_interval_ms = 10;
    config.task_poll_interval_ms = 5;
    config.max_cpu_load_avg = 1_000_000.0;
    config.reserved_memory = 0.0;
    config.develop_mode = true;
    config
}

pub struct TestContext {
    pub store: Arc<InMemoryProcessStore>,
    pub queue: Arc<InMemoryTaskDispatchQueue>,
    pub alerter: Arc<CollectingAlerter>,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryProcessStore::new()),
            queue: Arc::new(InMemoryTaskDispatchQueue::new()),
            alerter: Arc::new(CollectingAlerter::new()),
        }
    }

    pub fn dyn_store(&self) -> Arc<dyn ProcessStore> {
        Arc::clone(&self.store) as Arc<dyn ProcessStore>
    }

    pub fn dyn_queue(&self) -> Arc<dyn TaskDispatchQueue> {
        Arc::clone(&self.queue) as Arc<dyn TaskDispatchQueue>
    }

    pub fn engine(&self, instance: ProcessInstance) -> DagEngine {
        DagEngine::new(
            instance,
            self.dyn_store(),
            self.dyn_queue(),
            Arc::clone(&self.alerter) as _,
            fast_master_config(),
            StopFlag::new(),
            Arc::new(Semaphore::new(20)),
        )
    }
}

/// 构造流程定义 JSON：(节点名, 依赖, 最大重试, 重试间隔分钟)
pub fn definition_json(tasks: &[(&str, &[&str], i32, i32)]) -> String {
    let tasks: Vec<serde_json::Value> = tasks
        .iter()
        .map(|(name, deps, max_retry, retry_interval)| {
            serde_json::json!({
                "name": name,
                "type": "SHELL",
                "deps": deps,
                "maxRetryTimes": max_retry,
                "retryInterval": retry_interval,
            })
        })
        .collect();
    serde_json::json!({ "globalParams": [], "tasks": tasks, "timeout": 0 }).to_string()
}

pub async fn seed_definition(store: &Arc<InMemoryProcessStore>, json: &str) -> ProcessDefinition {
    let now = Utc::now();
    store
        .save_process_definition(&ProcessDefinition {
            id: 0,
            name: "测试流程".to_string(),
            process_definition_json: json.to_string(),
            global_params: None,
            timeout: 0,
            create_time: now,
            update_time: now,
        })
        .await
        .unwrap()
}

/// 下发启动指令并以 MASTER_HOST 认领
pub async fn claim_instance(
    store: &Arc<InMemoryProcessStore>,
    definition_id: i64,
    command_type: CommandType,
    command_param: Option<String>,
    failure_strategy: FailureStrategy,
) -> ProcessInstance {
    let mut command = Command::new(command_type, definition_id);
    command.command_param = command_param;
    command.failure_strategy = failure_strategy;
    store.create_command(&command).await.unwrap();

    let polled = store.poll_command().await.unwrap().expect("应有待处理指令");
    store
        .handle_command(&polled, MASTER_HOST)
        .await
        .unwrap()
        .expect("指令应构造出流程实例")
}

/// Worker 行为脚本
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Finish(ExecutionStatus),
    /// 置为运行中后失联
    Hang,
}

pub struct WorkerSim {
    stop: StopFlag,
    handle: JoinHandle<()>,
}

impl WorkerSim {
    pub async fn shutdown(self) {
        self.stop.stop();
        let _ = self.handle.await;
    }
}

/// 启动 Worker 模拟器
///
/// `script` 按节点名给出每次尝试的结果，耗尽（或未指定）后默认成功。
pub fn spawn_worker(
    store: Arc<InMemoryProcessStore>,
    queue: Arc<InMemoryTaskDispatchQueue>,
    host: &str,
    script: &[(&str, &[Outcome])],
) -> WorkerSim {
    let outcomes: Arc<Mutex<HashMap<String, VecDeque<Outcome>>>> = Arc::new(Mutex::new(
        script
            .iter()
            .map(|(name, outcomes)| {
                (name.to_string(), outcomes.iter().copied().collect())
            })
            .collect(),
    ));
    let stop = StopFlag::new();
    let worker_stop = stop.clone();
    let host = host.to_string();

    let handle = tokio::spawn(async move {
        while worker_stop.is_running() {
            let dispatch = match queue.take().await {
                Ok(Some(dispatch)) => dispatch,
                _ => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }
            };
            let mut task = match store
                .find_task_instance_by_id(dispatch.task_instance_id)
                .await
            {
                Ok(Some(task)) => task,
                _ => continue,
            };

            let outcome = outcomes
                .lock()
                .unwrap()
                .get_mut(&task.name)
                .and_then(|q| q.pop_front())
                .unwrap_or(Outcome::Finish(ExecutionStatus::Success));

            // Worker 认领
            task.host = Some(host.clone());
            task.state = ExecutionStatus::RunningExecution;
            task.start_time = Some(Utc::now());
            store.update_task_instance(&task).await.unwrap();

            match outcome {
                Outcome::Hang => {
                    // 失联：保持运行中
                }
                Outcome::Finish(state) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    // 引擎可能已把任务改写为 KILL，让终态保持原样
                    let current = store
                        .find_task_instance_by_id(task.id)
                        .await
                        .unwrap()
                        .unwrap();
                    if current.state.is_finished() {
                        continue;
                    }
                    task.state = state;
                    task.end_time = Some(Utc::now());
                    store.update_task_instance(&task).await.unwrap();
                }
            }
        }
    });

    WorkerSim { stop, handle }
}

/// 轮询等待条件满足
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("等待条件超时");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
