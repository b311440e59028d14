//! 告警发送
//!
//! 即发即弃的通知出口：流程结束、Worker 容错、服务下线、流程超时。
//! 告警传输在核心之外，这里只定义出口与两个内建实现。

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{info, warn};

use flowmaster_domain::entities::{ProcessInstance, TaskInstance};

#[async_trait]
pub trait Alerter: Send + Sync {
    /// 流程实例到达终态
    async fn process_result(&self, process_instance: &ProcessInstance, tasks: &[TaskInstance]);

    /// 任务因 Worker 宕机进入容错
    async fn worker_tolerance_fault(
        &self,
        process_instance: &ProcessInstance,
        tasks: &[TaskInstance],
    );

    /// 服务节点下线
    async fn server_down(&self, host: &str, server_type: &str);

    /// 流程运行超时
    async fn process_timeout(&self, process_instance: &ProcessInstance);
}

/// 日志告警器，生产部署默认出口
#[derive(Debug, Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn process_result(&self, process_instance: &ProcessInstance, tasks: &[TaskInstance]) {
        info!(
            "流程实例 {} [{}] 结束，状态 {:?}，任务数 {}",
            process_instance.id,
            process_instance.name,
            process_instance.state,
            tasks.len()
        );
    }

    async fn worker_tolerance_fault(
        &self,
        process_instance: &ProcessInstance,
        tasks: &[TaskInstance],
    ) {
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        warn!(
            "流程实例 {} 发生 Worker 容错，受影响任务: {:?}",
            process_instance.id, names
        );
    }

    async fn server_down(&self, host: &str, server_type: &str) {
        warn!("服务节点下线: {} [{}]", host, server_type);
    }

    async fn process_timeout(&self, process_instance: &ProcessInstance) {
        warn!(
            "流程实例 {} [{}] 运行超时（配置 {} 分钟）",
            process_instance.id, process_instance.name, process_instance.timeout
        );
    }
}

/// 测试用的告警记录
#[derive(Debug, Clone, PartialEq)]
pub enum AlertRecord {
    ProcessResult {
        process_instance_id: i64,
        state: flowmaster_domain::enums::ExecutionStatus,
    },
    ToleranceFault {
        process_instance_id: i64,
        task_names: Vec<String>,
    },
    ServerDown {
        host: String,
        server_type: String,
    },
    ProcessTimeout {
        process_instance_id: i64,
    },
}

/// 收集告警到内存的实现，供测试断言
#[derive(Debug, Default)]
pub struct CollectingAlerter {
    records: Mutex<Vec<AlertRecord>>,
}

impl CollectingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AlertRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn tolerance_fault_count(&self) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, AlertRecord::ToleranceFault { .. }))
            .count()
    }

    pub fn server_down_count(&self) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, AlertRecord::ServerDown { .. }))
            .count()
    }
}

#[async_trait]
impl Alerter for CollectingAlerter {
    async fn process_result(&self, process_instance: &ProcessInstance, _tasks: &[TaskInstance]) {
        self.records.lock().unwrap().push(AlertRecord::ProcessResult {
            process_instance_id: process_instance.id,
            state: process_instance.state,
        });
    }

    async fn worker_tolerance_fault(
        &self,
        process_instance: &ProcessInstance,
        tasks: &[TaskInstance],
    ) {
        self.records
            .lock()
            .unwrap()
            .push(AlertRecord::ToleranceFault {
                process_instance_id: process_instance.id,
                task_names: tasks.iter().map(|t| t.name.clone()).collect(),
            });
    }

    async fn server_down(&self, host: &str, server_type: &str) {
        self.records.lock().unwrap().push(AlertRecord::ServerDown {
            host: host.to_string(),
            server_type: server_type.to_string(),
        });
    }

    async fn process_timeout(&self, process_instance: &ProcessInstance) {
        self.records
            .lock()
            .unwrap()
            .push(AlertRecord::ProcessTimeout {
                process_instance_id: process_instance.id,
            });
    }
}
