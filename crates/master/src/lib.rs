//! Master 执行核心
//!
//! 每个流程实例由一个 [`dag_engine::DagEngine`] 驱动：按依赖遍历 DAG、
//! 派发任务监督器、处理重试/暂停/停止/补数。[`cluster::ClusterController`]
//! 维护集群成员关系并在 Master/Worker 宕机时执行失效转移。
//! [`server::MasterServer`] 把两者和心跳、指令消费循环装配成进程。

pub mod alerter;
pub mod cancel;
pub mod cluster;
pub mod dag_engine;
pub mod resource;
pub mod server;
pub mod supervisor;

pub use alerter::{Alerter, CollectingAlerter, LogAlerter};
pub use cancel::StopFlag;
pub use cluster::ClusterController;
pub use dag_engine::DagEngine;
pub use server::MasterServer;
pub use supervisor::{SupervisorHandle, TaskSupervisor};
