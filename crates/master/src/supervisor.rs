//! 任务监督器
//!
//! Master 视角的单任务生命周期：持久化任务实例、入队给 Worker、
//! 轮询存储中的终态、响应 kill。子流程任务不经 Worker，改为创建并
//! 等待子流程实例。监督器完成时返回终态任务实例，提交失败返回 `None`。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use flowmaster_domain::command_params::{
    CommandParams, CMD_PARAM_PARENT_PROCESS_ID, CMD_PARAM_PARENT_TASK_ID,
};
use flowmaster_domain::dag::TaskNode;
use flowmaster_domain::entities::{Command, ProcessInstance, TaskInstance};
use flowmaster_domain::enums::{CommandType, ExecutionStatus, Flag};
use flowmaster_domain::repositories::{ProcessStore, TaskDispatch, TaskDispatchQueue};
use flowmaster_errors::{MasterError, MasterResult};

use crate::cancel::StopFlag;

/// 监督器形态：普通任务走 Worker，子流程任务等待子实例
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorKind {
    Task,
    SubProcess,
}

impl SupervisorKind {
    pub fn for_task(task: &TaskInstance) -> Self {
        if task.is_sub_process() {
            SupervisorKind::SubProcess
        } else {
            SupervisorKind::Task
        }
    }
}

/// 引擎侧持有的监督器句柄
#[derive(Clone)]
pub struct SupervisorHandle {
    name: String,
    killed: Arc<AtomicBool>,
    kill_notify: Arc<Notify>,
    snapshot: Arc<RwLock<TaskInstance>>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 协作式终止：置位并唤醒监督循环
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.kill_notify.notify_waiters();
    }

    /// 监督器最近一次看到的任务实例
    pub fn task_snapshot(&self) -> TaskInstance {
        self.snapshot.read().unwrap().clone()
    }
}

pub struct TaskSupervisor {
    kind: SupervisorKind,
    task: TaskInstance,
    process_instance: ProcessInstance,
    store: Arc<dyn ProcessStore>,
    queue: Arc<dyn TaskDispatchQueue>,
    poll_interval: Duration,
    stop: StopFlag,
    killed: Arc<AtomicBool>,
    kill_notify: Arc<Notify>,
    snapshot: Arc<RwLock<TaskInstance>>,
}

impl TaskSupervisor {
    pub fn new(
        task: TaskInstance,
        process_instance: ProcessInstance,
        store: Arc<dyn ProcessStore>,
        queue: Arc<dyn TaskDispatchQueue>,
        poll_interval: Duration,
        stop: StopFlag,
    ) -> (Self, SupervisorHandle) {
        let killed = Arc::new(AtomicBool::new(false));
        let kill_notify = Arc::new(Notify::new());
        let snapshot = Arc::new(RwLock::new(task.clone()));
        let handle = SupervisorHandle {
            name: task.name.clone(),
            killed: Arc::clone(&killed),
            kill_notify: Arc::clone(&kill_notify),
            snapshot: Arc::clone(&snapshot),
        };
        let supervisor = Self {
            kind: SupervisorKind::for_task(&task),
            task,
            process_instance,
            store,
            queue,
            poll_interval,
            stop,
            killed,
            kill_notify,
            snapshot,
        };
        (supervisor, handle)
    }

    /// 监督任务直到终态；提交失败返回 `None`
    pub async fn run(mut self) -> Option<TaskInstance> {
        let result = match self.kind {
            SupervisorKind::Task => self.run_task().await,
            SupervisorKind::SubProcess => self.run_sub_process().await,
        };
        match result {
            Ok(task) => Some(task),
            Err(e) => {
                if self.stop.is_stopped() {
                    info!(
                        "任务 {} (流程实例 {}) 监督随停止信号退出",
                        self.task.name, self.process_instance.id
                    );
                } else {
                    error!(
                        "任务 {} (流程实例 {}) 监督失败: {}",
                        self.task.name, self.process_instance.id, e
                    );
                }
                None
            }
        }
    }

    fn update_snapshot(&self, task: &TaskInstance) {
        *self.snapshot.write().unwrap() = task.clone();
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// 持久化并入队
    ///
    /// 三种入口：全新任务、失败/容错重试（作废旧实例并产生新实例）、
    /// 接管恢复中的任务（已在 Worker 侧，不重复入队）。
    async fn submit(&mut self) -> MasterResult<()> {
        let now = Utc::now();
        if self.task.id == 0 {
            self.task.state = ExecutionStatus::SubmittedSuccess;
            self.task.submit_time = Some(now);
            self.task.start_time = Some(now);
            self.task.flag = Flag::Yes;
            self.task = self.store.save_task_instance(&self.task).await?;
            self.enqueue_dispatch().await?;
            info!(
                "任务 {} (id {}) 已提交入队",
                self.task.name, self.task.id
            );
        } else if self.task.state.is_failure() {
            // 重试：旧实例作废，容错重试不消耗重试配额
            let mut stale = self.task.clone();
            stale.flag = Flag::No;
            self.store.update_task_instance(&stale).await?;

            let retry_times = if self.task.state == ExecutionStatus::NeedFaultTolerance {
                self.task.retry_times
            } else {
                self.task.retry_times + 1
            };
            let mut attempt = self.task.clone();
            attempt.id = 0;
            attempt.state = ExecutionStatus::SubmittedSuccess;
            attempt.submit_time = Some(now);
            attempt.start_time = Some(now);
            attempt.end_time = None;
            attempt.host = None;
            attempt.retry_times = retry_times;
            attempt.flag = Flag::Yes;
            attempt.app_links = None;
            self.task = self.store.save_task_instance(&attempt).await?;
            self.enqueue_dispatch().await?;
            info!(
                "任务 {} 重试实例 (id {}) 已提交入队，重试次数 {}",
                self.task.name, self.task.id, self.task.retry_times
            );
        } else if self.task.state == ExecutionStatus::SubmittedSuccess {
            // 恢复接管：重新入队（先撤回避免重复条目）
            self.queue.remove(self.task.id).await?;
            self.enqueue_dispatch().await?;
            info!("任务 {} (id {}) 重新入队", self.task.name, self.task.id);
        } else {
            info!(
                "任务 {} (id {}) 状态 {:?}，直接接管监督",
                self.task.name, self.task.id, self.task.state
            );
        }
        self.update_snapshot(&self.task.clone());
        Ok(())
    }

    async fn enqueue_dispatch(&self) -> MasterResult<()> {
        self.queue
            .enqueue(TaskDispatch {
                task_instance_id: self.task.id,
                process_instance_id: self.process_instance.id,
                priority: self.task.task_instance_priority,
                worker_group_id: self.task.worker_group_id,
            })
            .await
    }

    async fn run_task(&mut self) -> MasterResult<TaskInstance> {
        self.submit().await?;

        loop {
            if self.stop.is_stopped() {
                return Err(MasterError::Internal("收到停止信号".to_string()));
            }
            if self.is_killed() {
                self.cancel_task().await?;
            }

            match self.store.find_task_instance_by_id(self.task.id).await {
                Ok(Some(current)) => {
                    self.update_snapshot(&current);
                    if current.state.is_finished() {
                        info!(
                            "任务 {} (id {}) 到达终态 {:?}",
                            current.name, current.id, current.state
                        );
                        return Ok(current);
                    }
                    self.task = current;
                }
                Ok(None) => {
                    return Err(MasterError::task_instance_not_found(self.task.id));
                }
                Err(e) => {
                    // 瞬时存储错误下一轮重查
                    warn!("查询任务实例 {} 失败: {}", self.task.id, e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.kill_notify.notified() => {}
            }
        }
    }

    /// 终止任务
    ///
    /// 尚未被 Worker 取走的条目先从队列撤回；随后把任务实例盖为 KILL，
    /// 已在执行的由 Worker 观察到该状态后终止本地进程。
    async fn cancel_task(&mut self) -> MasterResult<()> {
        let withdrawn = self.queue.remove(self.task.id).await?;
        let mut task = match self.store.find_task_instance_by_id(self.task.id).await? {
            Some(task) => task,
            None => self.task.clone(),
        };
        if task.state.is_finished() {
            return Ok(());
        }
        task.state = ExecutionStatus::Kill;
        task.end_time = Some(Utc::now());
        self.store.update_task_instance(&task).await?;
        if withdrawn {
            info!("任务 {} (id {}) 已从队列撤回并终止", task.name, task.id);
        } else {
            info!("任务 {} (id {}) 已标记终止，等待 Worker 响应", task.name, task.id);
        }
        Ok(())
    }

    // ---- 子流程 ----

    /// 子流程定义 id 取自节点参数
    fn sub_process_definition_id(&self) -> MasterResult<i64> {
        let node: TaskNode = serde_json::from_str(&self.task.task_json)?;
        node.params
            .get("processDefinitionId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                MasterError::TaskSubmit(format!(
                    "子流程任务 {} 缺少 processDefinitionId 参数",
                    self.task.name
                ))
            })
    }

    async fn run_sub_process(&mut self) -> MasterResult<TaskInstance> {
        let definition_id = self.sub_process_definition_id()?;
        let now = Utc::now();

        if self.task.id == 0 {
            self.task.state = ExecutionStatus::SubmittedSuccess;
            self.task.submit_time = Some(now);
            self.task.start_time = Some(now);
            self.task.flag = Flag::Yes;
            self.task = self.store.save_task_instance(&self.task).await?;
        }
        self.update_snapshot(&self.task.clone());

        // 尚无子实例则写入启动指令，由某个 Master 的指令循环接手
        let existing = self
            .store
            .find_sub_process_instance(self.process_instance.id, self.task.id)
            .await?;
        if existing.is_none() {
            let mut params = CommandParams::default();
            params.set(
                CMD_PARAM_PARENT_PROCESS_ID,
                self.process_instance.id.to_string(),
            );
            params.set(CMD_PARAM_PARENT_TASK_ID, self.task.id.to_string());
            let mut command = Command::new(CommandType::StartProcess, definition_id);
            command.command_param = Some(params.to_json()?);
            command.failure_strategy = self.process_instance.failure_strategy;
            command.worker_group_id = self.task.worker_group_id;
            self.store.create_command(&command).await?;
            info!(
                "子流程任务 {} (id {}) 已写入启动指令，定义 {}",
                self.task.name, self.task.id, definition_id
            );
        }

        loop {
            if self.stop.is_stopped() {
                return Err(MasterError::Internal("收到停止信号".to_string()));
            }
            let sub_instance = self
                .store
                .find_sub_process_instance(self.process_instance.id, self.task.id)
                .await?;

            if let Some(sub) = &sub_instance {
                if self.task.state == ExecutionStatus::SubmittedSuccess {
                    self.task.state = ExecutionStatus::RunningExecution;
                    self.store.update_task_instance(&self.task).await?;
                    self.update_snapshot(&self.task.clone());
                }
                if sub.state.is_finished() {
                    let mut task = self.task.clone();
                    task.state = map_sub_process_state(sub.state);
                    task.end_time = Some(Utc::now());
                    self.store.update_task_instance(&task).await?;
                    self.update_snapshot(&task);
                    info!(
                        "子流程任务 {} 结束，子实例 {} 状态 {:?}",
                        task.name, sub.id, sub.state
                    );
                    return Ok(task);
                }
                if self.is_killed() && !sub.state.is_finished() {
                    // 向子实例传播停止
                    let mut sub = sub.clone();
                    if sub.state != ExecutionStatus::ReadyStop {
                        sub.state = ExecutionStatus::ReadyStop;
                        self.store.update_process_instance(&sub).await?;
                        info!("子流程实例 {} 已标记停止", sub.id);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.kill_notify.notified() => {}
            }
        }
    }
}

/// 子实例终态映射回任务态
fn map_sub_process_state(state: ExecutionStatus) -> ExecutionStatus {
    match state {
        ExecutionStatus::Success => ExecutionStatus::Success,
        ExecutionStatus::Stop | ExecutionStatus::Kill => ExecutionStatus::Kill,
        ExecutionStatus::Pause => ExecutionStatus::Pause,
        ExecutionStatus::WaitingThread => ExecutionStatus::WaitingThread,
        _ => ExecutionStatus::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_kind_by_task_type() {
        let mut task = TaskInstance {
            id: 0,
            name: "A".to_string(),
            task_type: "SHELL".to_string(),
            process_definition_id: 1,
            process_instance_id: 1,
            task_json: "{}".to_string(),
            state: ExecutionStatus::SubmittedSuccess,
            submit_time: None,
            start_time: None,
            end_time: None,
            host: None,
            retry_times: 0,
            max_retry_times: 0,
            retry_interval: 0,
            flag: Flag::Yes,
            alert_flag: Flag::No,
            task_instance_priority: Default::default(),
            worker_group_id: -1,
            app_links: None,
        };
        assert_eq!(SupervisorKind::for_task(&task), SupervisorKind::Task);

        task.task_type = "SUB_PROCESS".to_string();
        assert_eq!(SupervisorKind::for_task(&task), SupervisorKind::SubProcess);
    }

    #[test]
    fn test_sub_process_state_mapping() {
        assert_eq!(
            map_sub_process_state(ExecutionStatus::Success),
            ExecutionStatus::Success
        );
        assert_eq!(
            map_sub_process_state(ExecutionStatus::Stop),
            ExecutionStatus::Kill
        );
        assert_eq!(
            map_sub_process_state(ExecutionStatus::Failure),
            ExecutionStatus::Failure
        );
        assert_eq!(
            map_sub_process_state(ExecutionStatus::Pause),
            ExecutionStatus::Pause
        );
    }
}
