//! 领域模型
//!
//! 工作流调度核心的业务实体：流程实例、任务实例、DAG以及数据访问抽象。
//! 实体不依赖具体的存储与协调实现。

pub mod command_params;
pub mod dag;
pub mod entities;
pub mod enums;
pub mod repositories;

pub use command_params::CommandParams;
pub use dag::{generate_flow_dag, ProcessDag, TaskNode, WorkflowDefinition, WorkflowGraph};
pub use entities::{Command, ProcessDefinition, ProcessInstance, TaskInstance, TaskWithProcess};
pub use enums::{
    CommandType, DependResult, ExecutionStatus, FailureStrategy, Flag, Priority, RunFlag,
    TaskDependType,
};
