//! 核心领域实体
//!
//! 流程实例、任务实例、流程定义与指令记录。任务实例只持有
//! `process_instance_id` 单向引用，两者同时需要时使用 [`TaskWithProcess`] 承载。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{
    CommandType, ExecutionStatus, FailureStrategy, Flag, Priority, TaskDependType,
};

/// 流程定义
///
/// 上游控制面管理的静态工作流，Master 只读。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: i64,
    pub name: String,
    /// DAG 定义 JSON，见 [`crate::dag::WorkflowDefinition`]
    pub process_definition_json: String,
    pub global_params: Option<String>,
    /// 流程超时（分钟），0 表示不限
    pub timeout: i32,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// 流程实例
///
/// 一次工作流运行。由调度器创建，被某个 Master 认领（host = 本机）后驱动，
/// 容错即清空 host 并重新入队。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: i64,
    pub name: String,
    pub process_definition_id: i64,
    /// 定义 JSON 在运行开始时冻结的快照
    pub process_instance_json: String,
    pub state: ExecutionStatus,
    pub command_type: CommandType,
    pub command_param: Option<String>,
    pub task_depend_type: TaskDependType,
    /// 当前持有该实例的 Master，未认领时为空
    pub host: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub run_times: i32,
    /// 超时（分钟），0 表示不限
    pub timeout: i32,
    pub failure_strategy: FailureStrategy,
    pub is_sub_process: Flag,
    /// 运行开始时固化的全局参数
    pub global_params: Option<String>,
    pub worker_group_id: i64,
    /// 子流程回溯：父流程实例与父任务实例
    pub parent_process_instance_id: Option<i64>,
    pub parent_task_instance_id: Option<i64>,
}

impl ProcessInstance {
    pub fn new(definition: &ProcessDefinition, command_type: CommandType) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由存储层生成
            name: definition.name.clone(),
            process_definition_id: definition.id,
            process_instance_json: definition.process_definition_json.clone(),
            state: ExecutionStatus::SubmittedSuccess,
            command_type,
            command_param: None,
            task_depend_type: TaskDependType::default(),
            host: None,
            start_time: now,
            end_time: None,
            schedule_time: None,
            run_times: 1,
            timeout: definition.timeout,
            failure_strategy: FailureStrategy::Continue,
            is_sub_process: Flag::No,
            global_params: definition.global_params.clone(),
            worker_group_id: -1,
            parent_process_instance_id: None,
            parent_task_instance_id: None,
        }
    }

    /// 流程是否已停止（终止态）
    pub fn is_process_instance_stop(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_complement_data(&self) -> bool {
        self.command_type == CommandType::ComplementData
    }

    pub fn is_sub_process(&self) -> bool {
        self.is_sub_process == Flag::Yes
    }

    /// 流程是否超时：超时配置按分钟与启动时间比较
    pub fn check_process_timeout(&self, now: DateTime<Utc>) -> bool {
        if self.timeout == 0 {
            return false;
        }
        let running_minutes = (now - self.start_time).num_minutes();
        running_minutes > self.timeout as i64
    }
}

/// 任务实例
///
/// DAG 某个节点的一次执行尝试。重试会产生新的任务实例，
/// 旧实例置 flag = NO；任意时刻每个 (流程实例, 节点名) 至多一条 flag = YES。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: i64,
    pub name: String,
    pub task_type: String,
    pub process_definition_id: i64,
    pub process_instance_id: i64,
    /// 提交时冻结的节点定义 JSON
    pub task_json: String,
    pub state: ExecutionStatus,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 执行该任务的 Worker，未分派时为空
    pub host: Option<String>,
    pub retry_times: i32,
    pub max_retry_times: i32,
    /// 重试间隔（分钟）
    pub retry_interval: i32,
    pub flag: Flag,
    pub alert_flag: Flag,
    pub task_instance_priority: Priority,
    pub worker_group_id: i64,
    /// 外部作业句柄（如 YARN application id），容错时据此清理
    pub app_links: Option<String>,
}

pub const TASK_TYPE_SUB_PROCESS: &str = "SUB_PROCESS";

impl TaskInstance {
    /// 任务是否已完成
    ///
    /// 仍可重试的失败（含容错失败）不算完成，恢复执行时这类任务
    /// 重新进入就绪队列派发。
    pub fn is_task_complete(&self) -> bool {
        self.state.is_success()
            || self.state.is_pause()
            || self.state.is_cancel()
            || self.state.is_waiting_thread()
            || (self.state.is_failure() && !self.task_can_retry())
    }

    pub fn is_sub_process(&self) -> bool {
        self.task_type == TASK_TYPE_SUB_PROCESS
    }

    /// 任务是否可以重试
    ///
    /// 容错失败总是追加一次重试，不消耗重试次数配额。
    pub fn task_can_retry(&self) -> bool {
        if self.is_sub_process() {
            return false;
        }
        if self.state == ExecutionStatus::NeedFaultTolerance {
            return true;
        }
        self.state == ExecutionStatus::Failure && self.retry_times < self.max_retry_times
    }

    /// 失败重试的退避是否已过期
    ///
    /// 重试间隔按分钟配置、按秒比较；非失败态或未配置重试的任务直接可派发。
    pub fn retry_interval_elapsed(&self, now: DateTime<Utc>) -> bool {
        if self.state != ExecutionStatus::Failure {
            return true;
        }
        if self.id == 0 || self.max_retry_times == 0 || self.retry_interval == 0 {
            return true;
        }
        let end_time = match self.end_time {
            Some(t) => t,
            None => return true,
        };
        let failed_seconds = (now - end_time).num_seconds();
        (self.retry_interval as i64) * 60 < failed_seconds
    }
}

/// 任务实例与其所属流程实例的承载结构
#[derive(Debug, Clone)]
pub struct TaskWithProcess {
    pub task: TaskInstance,
    pub process: ProcessInstance,
}

/// 指令记录
///
/// 请求（重新）启动某个流程实例的持久化队列记录，由调度循环消费。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub command_type: CommandType,
    pub process_definition_id: i64,
    pub command_param: Option<String>,
    pub task_depend_type: TaskDependType,
    pub failure_strategy: FailureStrategy,
    pub schedule_time: Option<DateTime<Utc>>,
    pub worker_group_id: i64,
    pub process_instance_priority: Priority,
    pub create_time: DateTime<Utc>,
}

impl Command {
    pub fn new(command_type: CommandType, process_definition_id: i64) -> Self {
        Self {
            id: 0,
            command_type,
            process_definition_id,
            command_param: None,
            task_depend_type: TaskDependType::default(),
            failure_strategy: FailureStrategy::Continue,
            schedule_time: None,
            worker_group_id: -1,
            process_instance_priority: Priority::default(),
            create_time: Utc::now(),
        }
    }
}

/// 按天推进调度时间，补数循环使用
pub fn next_schedule_day(date: DateTime<Utc>) -> DateTime<Utc> {
    date + Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_state(state: ExecutionStatus) -> TaskInstance {
        TaskInstance {
            id: 1,
            name: "A".to_string(),
            task_type: "SHELL".to_string(),
            process_definition_id: 1,
            process_instance_id: 1,
            task_json: "{}".to_string(),
            state,
            submit_time: Some(Utc::now()),
            start_time: Some(Utc::now()),
            end_time: None,
            host: None,
            retry_times: 0,
            max_retry_times: 0,
            retry_interval: 0,
            flag: Flag::Yes,
            alert_flag: Flag::No,
            task_instance_priority: Priority::Medium,
            worker_group_id: -1,
            app_links: None,
        }
    }

    #[test]
    fn test_task_can_retry() {
        let mut task = task_with_state(ExecutionStatus::Failure);
        task.max_retry_times = 2;
        task.retry_times = 0;
        assert!(task.task_can_retry());

        task.retry_times = 2;
        assert!(!task.task_can_retry());

        // 容错失败不消耗重试配额
        task.state = ExecutionStatus::NeedFaultTolerance;
        assert!(task.task_can_retry());

        // 子流程任务不重试
        task.task_type = TASK_TYPE_SUB_PROCESS.to_string();
        task.state = ExecutionStatus::Failure;
        task.retry_times = 0;
        assert!(!task.task_can_retry());
    }

    #[test]
    fn test_retry_interval_elapsed() {
        let now = Utc::now();
        let mut task = task_with_state(ExecutionStatus::Failure);
        task.max_retry_times = 3;
        task.retry_interval = 1; // 1 分钟

        task.end_time = Some(now - Duration::seconds(30));
        assert!(!task.retry_interval_elapsed(now));

        task.end_time = Some(now - Duration::seconds(61));
        assert!(task.retry_interval_elapsed(now));

        // 非失败态不受退避约束
        task.state = ExecutionStatus::NeedFaultTolerance;
        task.end_time = Some(now);
        assert!(task.retry_interval_elapsed(now));
    }

    #[test]
    fn test_process_timeout_minutes() {
        let now = Utc::now();
        let def = ProcessDefinition {
            id: 1,
            name: "p".to_string(),
            process_definition_json: "{}".to_string(),
            global_params: None,
            timeout: 10,
            create_time: now,
            update_time: now,
        };
        let mut pi = ProcessInstance::new(&def, CommandType::StartProcess);
        pi.start_time = now - Duration::minutes(11);
        assert!(pi.check_process_timeout(now));

        pi.start_time = now - Duration::minutes(9);
        assert!(!pi.check_process_timeout(now));

        pi.timeout = 0;
        pi.start_time = now - Duration::days(2);
        assert!(!pi.check_process_timeout(now));
    }

    #[test]
    fn test_process_instance_stop() {
        let now = Utc::now();
        let def = ProcessDefinition {
            id: 1,
            name: "p".to_string(),
            process_definition_json: "{}".to_string(),
            global_params: None,
            timeout: 0,
            create_time: now,
            update_time: now,
        };
        let mut pi = ProcessInstance::new(&def, CommandType::StartProcess);
        pi.state = ExecutionStatus::RunningExecution;
        assert!(!pi.is_process_instance_stop());
        pi.state = ExecutionStatus::Stop;
        assert!(pi.is_process_instance_stop());
    }
}
