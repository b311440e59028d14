//! 存储抽象
//!
//! 定义流程持久化与任务派发队列的抽象接口，遵循依赖倒置原则。
//! 关系存储是跨 Master 的唯一事实来源。

use async_trait::async_trait;

use flowmaster_errors::MasterResult;

use crate::entities::{Command, ProcessDefinition, ProcessInstance, TaskInstance};
use crate::enums::Priority;

/// 流程存储抽象
///
/// 失效转移相关查询的语义：`host` 为 `Some` 时只匹配该主机，
/// 为 `None` 时匹配所有已被认领（host 非空）的记录。
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ---- 流程定义 ----
    async fn save_process_definition(
        &self,
        definition: &ProcessDefinition,
    ) -> MasterResult<ProcessDefinition>;
    async fn find_process_definition_by_id(
        &self,
        id: i64,
    ) -> MasterResult<Option<ProcessDefinition>>;

    // ---- 流程实例 ----
    async fn save_process_instance(
        &self,
        process_instance: &ProcessInstance,
    ) -> MasterResult<ProcessInstance>;
    async fn update_process_instance(
        &self,
        process_instance: &ProcessInstance,
    ) -> MasterResult<()>;
    async fn find_process_instance_by_id(
        &self,
        id: i64,
    ) -> MasterResult<Option<ProcessInstance>>;
    /// 查询子流程实例（按父流程实例与父任务实例回溯）
    async fn find_sub_process_instance(
        &self,
        parent_process_instance_id: i64,
        parent_task_instance_id: i64,
    ) -> MasterResult<Option<ProcessInstance>>;

    // ---- 任务实例 ----
    /// flag = YES 的任务实例列表
    async fn find_valid_task_list_by_process_id(
        &self,
        process_instance_id: i64,
    ) -> MasterResult<Vec<TaskInstance>>;
    async fn find_task_instance_by_id(&self, id: i64) -> MasterResult<Option<TaskInstance>>;
    async fn save_task_instance(&self, task_instance: &TaskInstance)
        -> MasterResult<TaskInstance>;
    async fn update_task_instance(&self, task_instance: &TaskInstance) -> MasterResult<()>;

    // ---- 失效转移 ----
    /// 属于给定 Master、状态未终止的流程实例
    async fn query_need_failover_process_instances(
        &self,
        host: Option<&str>,
    ) -> MasterResult<Vec<ProcessInstance>>;
    /// 属于给定 Worker、状态未终止的任务实例
    async fn query_need_failover_task_instances(
        &self,
        host: Option<&str>,
    ) -> MasterResult<Vec<TaskInstance>>;
    /// 清空 host 并写入容错恢复指令，可重复调用
    async fn process_need_failover_process_instance(
        &self,
        process_instance: &ProcessInstance,
    ) -> MasterResult<()>;

    // ---- 指令队列 ----
    async fn create_command(&self, command: &Command) -> MasterResult<Command>;
    /// 取走最早的一条待处理指令
    async fn poll_command(&self) -> MasterResult<Option<Command>>;
    /// 消费指令：构造或恢复流程实例并以给定 host 认领
    async fn handle_command(
        &self,
        command: &Command,
        host: &str,
    ) -> MasterResult<Option<ProcessInstance>>;
    /// 为 WAITING_THREAD 终态的流程实例写入恢复指令
    async fn create_recovery_waiting_thread_command(
        &self,
        origin: Option<&Command>,
        process_instance: &ProcessInstance,
    ) -> MasterResult<()>;
}

/// 一次任务派发的队列条目
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDispatch {
    pub task_instance_id: i64,
    pub process_instance_id: i64,
    pub priority: Priority,
    pub worker_group_id: i64,
}

/// 任务派发队列抽象
///
/// Master 侧只负责入队与撤回；消费端是 Worker，实现机制在核心之外。
/// 出队顺序：优先级高者先出，同优先级按入队顺序。
#[async_trait]
pub trait TaskDispatchQueue: Send + Sync {
    async fn enqueue(&self, dispatch: TaskDispatch) -> MasterResult<()>;
    /// 取走下一个待执行条目，队列为空返回 `None`
    async fn take(&self) -> MasterResult<Option<TaskDispatch>>;
    /// 撤回尚未被 Worker 取走的条目，成功撤回返回 `true`
    async fn remove(&self, task_instance_id: i64) -> MasterResult<bool>;
    async fn len(&self) -> MasterResult<usize>;
}
