//! Master 服务进程
//!
//! 装配集群控制器、心跳循环与指令消费循环。指令在 `/lock/masters`
//! 互斥锁内认领，流程实例在有界引擎池上驱动；收到关闭信号后按
//! 心跳 -> 指令循环 -> 引擎池 -> 协调客户端 的顺序停止。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use flowmaster_config::AppConfig;
use flowmaster_coordination::CoordRegistry;
use flowmaster_domain::repositories::{ProcessStore, TaskDispatchQueue};
use flowmaster_errors::MasterResult;

use crate::alerter::Alerter;
use crate::cancel::StopFlag;
use crate::cluster::ClusterController;
use crate::dag_engine::DagEngine;
use crate::resource;

pub struct MasterServer {
    config: AppConfig,
    store: Arc<dyn ProcessStore>,
    queue: Arc<dyn TaskDispatchQueue>,
    registry: Arc<dyn CoordRegistry>,
    alerter: Arc<dyn Alerter>,
    stop: StopFlag,
}

impl MasterServer {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ProcessStore>,
        queue: Arc<dyn TaskDispatchQueue>,
        registry: Arc<dyn CoordRegistry>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            registry,
            alerter,
            stop: StopFlag::new(),
        }
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// 运行 Master 直到收到关闭信号
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> MasterResult<()> {
        info!("Master 服务启动: {}", self.config.master.address());

        let controller = Arc::new(ClusterController::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.alerter),
            &self.config.coordination.namespace,
            self.config.master.clone(),
            self.stop.clone(),
        ));
        let event_handle = Arc::clone(&controller).start().await?;
        let heartbeat_handle = self.spawn_heartbeat(Arc::clone(&controller));

        let engine_permits = Arc::new(Semaphore::new(self.config.master.exec_threads));
        let supervisor_permits =
            Arc::new(Semaphore::new(self.config.master.exec_task_threads));
        let mut engines: JoinSet<()> = JoinSet::new();

        // 指令节拍运行到完成再检查关闭，避免认领到一半被取消
        loop {
            if self.stop.is_stopped() {
                break;
            }
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!("收到关闭信号");
                    break;
                }
                Err(_) => {}
            }
            self.command_tick(&controller, &engine_permits, &supervisor_permits, &mut engines)
                .await;
        }

        self.shutdown(controller, heartbeat_handle, event_handle, engines)
            .await;
        Ok(())
    }

    fn spawn_heartbeat(&self, controller: Arc<ClusterController>) -> JoinHandle<()> {
        let interval_seconds = self.config.master.heartbeat_interval_seconds;
        let stop = self.stop.clone();
        tokio::spawn(async move {
            // 延迟 5 秒后按配置间隔发送
            let start = tokio::time::Instant::now() + Duration::from_secs(5);
            let mut interval =
                tokio::time::interval_at(start, Duration::from_secs(interval_seconds));
            loop {
                interval.tick().await;
                if stop.is_stopped() {
                    break;
                }
                if let Err(e) = controller.beat().await {
                    error!("发送心跳失败: {}", e);
                }
            }
            info!("心跳循环退出");
        })
    }

    /// 指令消费的单次节拍：认领一条指令并在引擎池上启动执行
    ///
    /// 瞬时错误记录日志后等待下一拍，不使服务退出。
    async fn command_tick(
        &self,
        controller: &Arc<ClusterController>,
        engine_permits: &Arc<Semaphore>,
        supervisor_permits: &Arc<Semaphore>,
        engines: &mut JoinSet<()>,
    ) {
        let tick = Duration::from_millis(self.config.master.tick_interval_ms);

        // 回收已结束的引擎
        while engines.try_join_next().is_some() {}

        if engine_permits.available_permits() == 0 {
            tokio::time::sleep(tick).await;
            return;
        }
        if !resource::check_resource(&self.config.master) {
            tokio::time::sleep(tick).await;
            return;
        }

        let claimed = async {
            let _lock = self
                .registry
                .acquire_lock(&controller.paths().masters_lock())
                .await?;
            match self.store.poll_command().await? {
                Some(command) => {
                    self.store
                        .handle_command(&command, &self.config.master.address())
                        .await
                }
                None => Ok(None),
            }
        }
        .await;

        match claimed {
            Ok(Some(instance)) => {
                let permit = match Arc::clone(engine_permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                info!("启动流程实例 {} 的执行引擎", instance.id);
                let engine = DagEngine::new(
                    instance,
                    Arc::clone(&self.store),
                    Arc::clone(&self.queue),
                    Arc::clone(&self.alerter),
                    self.config.master.clone(),
                    self.stop.clone(),
                    Arc::clone(supervisor_permits),
                );
                engines.spawn(async move {
                    let _permit = permit;
                    engine.run().await;
                });
            }
            Ok(None) => {
                tokio::time::sleep(tick).await;
            }
            Err(e) => {
                error!("指令消费失败: {}，下一拍重试", e);
                tokio::time::sleep(tick).await;
            }
        }
    }

    /// 有序停机
    async fn shutdown(
        &self,
        controller: Arc<ClusterController>,
        heartbeat_handle: JoinHandle<()>,
        event_handle: JoinHandle<()>,
        mut engines: JoinSet<()>,
    ) {
        info!("Master 服务停止中...");

        // 最后一个 Master 下线要重复告警
        let remaining = controller.active_master_count().await.unwrap_or(usize::MAX);
        if remaining <= 1 {
            for _ in 0..self.config.master.failover_warn_times {
                self.alerter
                    .server_down(&self.config.master.address(), "master")
                    .await;
            }
        }

        self.stop.stop();
        // 给监督器与引擎一点时间安静退出
        tokio::time::sleep(Duration::from_secs(3)).await;

        heartbeat_handle.abort();
        info!("心跳服务已停止");

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while engines.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("引擎池停止超时，强制中断");
            engines.abort_all();
        }
        info!("执行引擎池已停止");

        controller.close();
        event_handle.abort();
        info!("协调客户端已停止");

        info!("Master 服务已停止");
    }
}
