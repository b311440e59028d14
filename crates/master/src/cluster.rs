//! 集群协调与失效转移
//!
//! 通过协调存储维护 Master/Worker 成员关系：启动时在互斥锁内注册自身并
//! 安装子节点监听；观察到节点移除后，在对应的失效转移锁内记录宕机标记、
//! 发送告警并回收孤儿任务。监听回调从不阻塞，事件在单消费者循环中顺序处理。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowmaster_config::MasterConfig;
use flowmaster_coordination::{
    ChildEvent, CoordPaths, CoordRegistry, EphemeralHandle, HeartbeatInfo, NodeType,
};
use flowmaster_domain::entities::TaskInstance;
use flowmaster_domain::enums::ExecutionStatus;
use flowmaster_domain::repositories::ProcessStore;
use flowmaster_errors::MasterResult;

use crate::alerter::Alerter;
use crate::cancel::StopFlag;
use crate::resource;

pub struct ClusterController {
    registry: Arc<dyn CoordRegistry>,
    store: Arc<dyn ProcessStore>,
    alerter: Arc<dyn Alerter>,
    paths: CoordPaths,
    config: MasterConfig,
    stop: StopFlag,
    self_node: Mutex<Option<EphemeralHandle>>,
    heartbeat: Mutex<HeartbeatInfo>,
}

impl ClusterController {
    pub fn new(
        registry: Arc<dyn CoordRegistry>,
        store: Arc<dyn ProcessStore>,
        alerter: Arc<dyn Alerter>,
        namespace: &str,
        config: MasterConfig,
        stop: StopFlag,
    ) -> Self {
        let heartbeat = HeartbeatInfo::new(&config.host, config.port);
        Self {
            registry,
            store,
            alerter,
            paths: CoordPaths::new(namespace),
            config,
            stop,
            self_node: Mutex::new(None),
            heartbeat: Mutex::new(heartbeat),
        }
    }

    pub fn paths(&self) -> &CoordPaths {
        &self.paths
    }

    /// 启动：在启动互斥锁内完成父节点创建、监听安装、自身注册，
    /// 以及"唯一 Master"场景下对无主期间孤儿任务的清扫。
    pub async fn start(self: Arc<Self>) -> MasterResult<JoinHandle<()>> {
        let (master_rx, worker_rx) = {
            let _lock = self
                .registry
                .acquire_lock(&self.paths.startup_failover_lock())
                .await?;

            self.registry
                .create_parents(&self.paths.parent_paths())
                .await?;

            let master_rx = self.registry.watch_children(&self.paths.masters()).await?;
            let worker_rx = self.registry.watch_children(&self.paths.workers()).await?;

            self.register_master().await?;

            let masters = self.registry.list_children(&self.paths.masters()).await?;
            if masters.len() == 1 {
                info!("当前为唯一 Master，清扫无主期间的孤儿任务");
                self.failover_worker(None, true).await?;
                self.failover_master(None).await?;
            }
            (master_rx, worker_rx)
        };

        Ok(tokio::spawn(async move {
            self.event_loop(master_rx, worker_rx).await;
        }))
    }

    async fn register_master(&self) -> MasterResult<()> {
        let wire = {
            let mut heartbeat = self.heartbeat.lock().unwrap();
            heartbeat.refresh(
                resource::cpu_usage_percent(),
                resource::memory_usage_percent(),
                resource::current_load_average().unwrap_or(0.0),
            );
            heartbeat.to_wire()
        };
        let path = self.paths.master_node(&self.config.address());
        let handle = self.registry.register_ephemeral(&path, &wire).await?;
        info!("Master 注册完成: {}", handle.path());
        *self.self_node.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// 自身注册的临时节点路径
    pub fn master_node_path(&self) -> String {
        self.paths.master_node(&self.config.address())
    }

    /// 心跳：刷新资源指标并写回自身节点
    pub async fn beat(&self) -> MasterResult<()> {
        if self.self_node.lock().unwrap().is_none() {
            warn!("心跳失败: 尚未注册 Master 节点");
            return Ok(());
        }
        let wire = {
            let mut heartbeat = self.heartbeat.lock().unwrap();
            heartbeat.refresh(
                resource::cpu_usage_percent(),
                resource::memory_usage_percent(),
                resource::current_load_average().unwrap_or(0.0),
            );
            heartbeat.to_wire()
        };
        self.registry
            .update_data(&self.master_node_path(), &wire)
            .await
    }

    /// 存活 Master 数
    pub async fn active_master_count(&self) -> MasterResult<usize> {
        Ok(self
            .registry
            .list_children(&self.paths.masters())
            .await?
            .len())
    }

    /// 注销自身并停止事件处理
    pub fn close(&self) {
        self.self_node.lock().unwrap().take();
    }

    async fn event_loop(
        self: Arc<Self>,
        mut master_rx: mpsc::UnboundedReceiver<ChildEvent>,
        mut worker_rx: mpsc::UnboundedReceiver<ChildEvent>,
    ) {
        info!("集群事件循环启动");
        let mut stop_check = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                event = master_rx.recv() => match event {
                    Some(event) => self.handle_master_event(event).await,
                    None => break,
                },
                event = worker_rx.recv() => match event {
                    Some(event) => self.handle_worker_event(event).await,
                    None => break,
                },
                _ = stop_check.tick() => {
                    if self.stop.is_stopped() {
                        break;
                    }
                }
            }
        }
        info!("集群事件循环退出");
    }

    async fn handle_master_event(&self, event: ChildEvent) {
        match event {
            ChildEvent::Added { path, .. } => {
                info!("Master 节点上线: {}", path);
            }
            ChildEvent::Updated { .. } => {}
            ChildEvent::Removed { path, .. } => {
                let host = CoordPaths::host_from_path(&path);
                if host == self.config.address() {
                    // 会话闪断时会观察到自身节点消失
                    warn!("观察到自身 Master 节点消失: {}，忽略", path);
                    return;
                }
                self.remove_node(&path, NodeType::Master).await;
            }
        }
    }

    async fn handle_worker_event(&self, event: ChildEvent) {
        match event {
            ChildEvent::Added { path, .. } => {
                info!("Worker 节点上线: {}", path);
            }
            ChildEvent::Updated { .. } => {}
            ChildEvent::Removed { path, .. } => {
                info!("Worker 节点下线: {}", path);
                self.remove_node(&path, NodeType::Worker).await;
            }
        }
    }

    /// 节点移除处理：失效转移锁内记录宕机、告警、回收
    async fn remove_node(&self, path: &str, node_type: NodeType) {
        info!("{} 节点已删除: {}", node_type.as_str(), path);
        let lock_path = match self.paths.failover_lock_path(node_type) {
            Some(lock_path) => lock_path,
            None => {
                warn!("节点类型 {:?} 没有失效转移锁路径，跳过", node_type);
                return;
            }
        };

        let host = CoordPaths::host_from_path(path);
        let result: MasterResult<()> = async {
            let _lock = self.registry.acquire_lock(&lock_path).await?;

            self.registry
                .record_dead_server(&self.paths.dead_server_node(node_type, &host))
                .await?;
            for _ in 0..self.config.failover_warn_times {
                self.alerter.server_down(&host, node_type.as_str()).await;
            }
            match node_type {
                NodeType::Master => self.failover_master(Some(&host)).await,
                NodeType::Worker => self.failover_worker(Some(&host), true).await,
            }
        }
        .await;

        if let Err(e) = result {
            error!("{} [{}] 失效转移失败: {}", node_type.as_str(), host, e);
        }
    }

    /// Master 失效转移：孤儿流程实例清空 host 并写入恢复指令
    ///
    /// 重复调用安全：恢复指令按实例幂等写入。
    pub async fn failover_master(&self, host: Option<&str>) -> MasterResult<()> {
        info!("开始 Master [{}] 失效转移", host.unwrap_or("*"));
        let instances = self
            .store
            .query_need_failover_process_instances(host)
            .await?;
        let count = instances.len();
        for instance in instances {
            self.store
                .process_need_failover_process_instance(&instance)
                .await?;
        }
        info!(
            "Master [{}] 失效转移结束，处理 {} 个流程实例",
            host.unwrap_or("*"),
            count
        );
        Ok(())
    }

    /// Worker 失效转移：未终止的任务实例置为容错态
    ///
    /// `check_alive` 时跳过未分派的任务，以及在该 Worker 新世代启动之后
    /// 才开始的任务（属于新进程，不需要转移）。
    pub async fn failover_worker(
        &self,
        host: Option<&str>,
        check_alive: bool,
    ) -> MasterResult<()> {
        info!("开始 Worker [{}] 失效转移", host.unwrap_or("*"));
        let tasks = self.store.query_need_failover_task_instances(host).await?;
        let mut count = 0usize;
        for task in tasks {
            if check_alive && !self.task_needs_failover(&task).await? {
                continue;
            }

            let mut task = task;
            self.kill_external_job(&mut task);
            task.state = ExecutionStatus::NeedFaultTolerance;
            self.store.update_task_instance(&task).await?;
            count += 1;
        }
        info!(
            "Worker [{}] 失效转移结束，处理 {} 个任务实例",
            host.unwrap_or("*"),
            count
        );
        Ok(())
    }

    /// 判断任务是否需要转移
    async fn task_needs_failover(&self, task: &TaskInstance) -> MasterResult<bool> {
        // 尚未分派到任何 Worker 的任务不需要转移
        let host = match task.host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => return Ok(false),
        };

        // Worker 节点仍然在线时，晚于其启动时间的任务属于新世代
        if let Some(worker_path) = self.find_worker_path(host).await? {
            if let Some(data) = self.registry.get_data(&worker_path).await? {
                if let Some(heartbeat) = HeartbeatInfo::parse_wire(&data) {
                    if let Some(start_time) = task.start_time {
                        if start_time > heartbeat.start_time {
                            debug!(
                                "任务 {} 在 Worker {} 重启之后提交，无需转移",
                                task.name, host
                            );
                            return Ok(false);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// 按主机标识在各 worker 分组下定位节点路径
    async fn find_worker_path(&self, host: &str) -> MasterResult<Option<String>> {
        let groups = self.registry.list_children(&self.paths.workers()).await?;
        for group in groups {
            let group_path = self.paths.worker_group(&group);
            let workers = self.registry.list_children(&group_path).await?;
            if workers.iter().any(|w| w == host) {
                return Ok(Some(format!("{group_path}/{host}")));
            }
        }
        Ok(None)
    }

    /// 清理任务关联的外部作业句柄（如 YARN application）
    ///
    /// 实际的作业终止由外部执行面完成，这里记录意图并摘除句柄，
    /// 避免重试实例继承失效的外部引用。
    fn kill_external_job(&self, task: &mut TaskInstance) {
        if let Some(links) = task.app_links.take() {
            if !links.is_empty() {
                warn!("任务 {} (id {}) 关联外部作业 {}，发起清理", task.name, task.id, links);
            }
        }
    }
}
