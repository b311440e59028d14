//! 调度核心枚举定义
//!
//! 状态枚举与数据库之间以 SCREAMING_SNAKE 字符串互转，与持久化层保持一致。

use serde::{Deserialize, Serialize};

/// 执行状态
///
/// 流程实例与任务实例共用的状态机。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    #[serde(rename = "SUBMITTED_SUCCESS")]
    SubmittedSuccess,
    #[serde(rename = "RUNNING_EXECUTION")]
    RunningExecution,
    #[serde(rename = "READY_PAUSE")]
    ReadyPause,
    #[serde(rename = "PAUSE")]
    Pause,
    #[serde(rename = "READY_STOP")]
    ReadyStop,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "NEED_FAULT_TOLERANCE")]
    NeedFaultTolerance,
    #[serde(rename = "KILL")]
    Kill,
    #[serde(rename = "WAITING_THREAD")]
    WaitingThread,
    #[serde(rename = "DELAY_EXECUTION")]
    DelayExecution,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }

    /// 失败态包含容错失败，容错失败同样走失败分支处理
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failure | ExecutionStatus::NeedFaultTolerance
        )
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, ExecutionStatus::Pause)
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, ExecutionStatus::Kill | ExecutionStatus::Stop)
    }

    pub fn is_waiting_thread(&self) -> bool {
        matches!(self, ExecutionStatus::WaitingThread)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::RunningExecution)
    }

    /// 是否已到达终止态
    pub fn is_finished(&self) -> bool {
        self.is_success()
            || self.is_failure()
            || self.is_cancel()
            || self.is_pause()
            || self.is_waiting_thread()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::SubmittedSuccess => "SUBMITTED_SUCCESS",
            ExecutionStatus::RunningExecution => "RUNNING_EXECUTION",
            ExecutionStatus::ReadyPause => "READY_PAUSE",
            ExecutionStatus::Pause => "PAUSE",
            ExecutionStatus::ReadyStop => "READY_STOP",
            ExecutionStatus::Stop => "STOP",
            ExecutionStatus::Failure => "FAILURE",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::NeedFaultTolerance => "NEED_FAULT_TOLERANCE",
            ExecutionStatus::Kill => "KILL",
            ExecutionStatus::WaitingThread => "WAITING_THREAD",
            ExecutionStatus::DelayExecution => "DELAY_EXECUTION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "SUBMITTED_SUCCESS" => ExecutionStatus::SubmittedSuccess,
            "RUNNING_EXECUTION" => ExecutionStatus::RunningExecution,
            "READY_PAUSE" => ExecutionStatus::ReadyPause,
            "PAUSE" => ExecutionStatus::Pause,
            "READY_STOP" => ExecutionStatus::ReadyStop,
            "STOP" => ExecutionStatus::Stop,
            "FAILURE" => ExecutionStatus::Failure,
            "SUCCESS" => ExecutionStatus::Success,
            "NEED_FAULT_TOLERANCE" => ExecutionStatus::NeedFaultTolerance,
            "KILL" => ExecutionStatus::Kill,
            "WAITING_THREAD" => ExecutionStatus::WaitingThread,
            "DELAY_EXECUTION" => ExecutionStatus::DelayExecution,
            _ => return None,
        };
        Some(status)
    }
}

// SQLx 数据库类型支持 - ExecutionStatus
impl sqlx::Type<sqlx::Postgres> for ExecutionStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for ExecutionStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        ExecutionStatus::parse(s).ok_or_else(|| format!("Invalid execution status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for ExecutionStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 有效标记
///
/// NO 表示该记录对当前执行轮次逻辑删除（例如重试产生新任务实例之后的旧实例）。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Flag {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::Yes => "YES",
            Flag::No => "NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "YES" => Some(Flag::Yes),
            "NO" => Some(Flag::No),
            _ => None,
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for Flag {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for Flag {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Flag::parse(s).ok_or_else(|| format!("Invalid flag: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for Flag {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 失败策略
///
/// END: 任一任务失败后终止整个流程；CONTINUE: 不受失败任务影响的分支继续执行。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureStrategy {
    #[serde(rename = "END")]
    End,
    #[serde(rename = "CONTINUE")]
    Continue,
}

impl FailureStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStrategy::End => "END",
            FailureStrategy::Continue => "CONTINUE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "END" => Some(FailureStrategy::End),
            "CONTINUE" => Some(FailureStrategy::Continue),
            _ => None,
        }
    }
}

/// 任务优先级
///
/// 优先级只影响 Worker 侧出队顺序，不影响 Master 的 DAG 遍历顺序。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    #[serde(rename = "HIGHEST")]
    Highest,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "LOWEST")]
    Lowest,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Highest => "HIGHEST",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
            Priority::Lowest => "LOWEST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HIGHEST" => Some(Priority::Highest),
            "HIGH" => Some(Priority::High),
            "MEDIUM" => Some(Priority::Medium),
            "LOW" => Some(Priority::Low),
            "LOWEST" => Some(Priority::Lowest),
            _ => None,
        }
    }
}

/// 依赖裁剪方式
///
/// 按起始节点切分 DAG 时的方向：仅向后继、仅向前驱、双向全部。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskDependType {
    #[serde(rename = "TASK_ALL")]
    All,
    #[serde(rename = "TASK_POST")]
    Forward,
    #[serde(rename = "TASK_PRE")]
    Backward,
}

impl Default for TaskDependType {
    fn default() -> Self {
        TaskDependType::All
    }
}

impl TaskDependType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskDependType::All => "TASK_ALL",
            TaskDependType::Forward => "TASK_POST",
            TaskDependType::Backward => "TASK_PRE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TASK_ALL" => Some(TaskDependType::All),
            "TASK_POST" => Some(TaskDependType::Forward),
            "TASK_PRE" => Some(TaskDependType::Backward),
            _ => None,
        }
    }
}

/// 指令类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "START_PROCESS")]
    StartProcess,
    #[serde(rename = "START_FAILURE_TASK_PROCESS")]
    StartFailureTaskProcess,
    #[serde(rename = "RECOVER_SUSPENDED_PROCESS")]
    RecoverSuspendedProcess,
    #[serde(rename = "RECOVER_TOLERANCE_FAULT_PROCESS")]
    RecoverToleranceFaultProcess,
    #[serde(rename = "RECOVER_WAITING_THREAD")]
    RecoverWaitingThread,
    #[serde(rename = "COMPLEMENT_DATA")]
    ComplementData,
    #[serde(rename = "REPEAT_RUNNING")]
    RepeatRunning,
    #[serde(rename = "SCHEDULER")]
    Scheduler,
    #[serde(rename = "PAUSE")]
    Pause,
    #[serde(rename = "STOP")]
    Stop,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::StartProcess => "START_PROCESS",
            CommandType::StartFailureTaskProcess => "START_FAILURE_TASK_PROCESS",
            CommandType::RecoverSuspendedProcess => "RECOVER_SUSPENDED_PROCESS",
            CommandType::RecoverToleranceFaultProcess => "RECOVER_TOLERANCE_FAULT_PROCESS",
            CommandType::RecoverWaitingThread => "RECOVER_WAITING_THREAD",
            CommandType::ComplementData => "COMPLEMENT_DATA",
            CommandType::RepeatRunning => "REPEAT_RUNNING",
            CommandType::Scheduler => "SCHEDULER",
            CommandType::Pause => "PAUSE",
            CommandType::Stop => "STOP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let t = match s {
            "START_PROCESS" => CommandType::StartProcess,
            "START_FAILURE_TASK_PROCESS" => CommandType::StartFailureTaskProcess,
            "RECOVER_SUSPENDED_PROCESS" => CommandType::RecoverSuspendedProcess,
            "RECOVER_TOLERANCE_FAULT_PROCESS" => CommandType::RecoverToleranceFaultProcess,
            "RECOVER_WAITING_THREAD" => CommandType::RecoverWaitingThread,
            "COMPLEMENT_DATA" => CommandType::ComplementData,
            "REPEAT_RUNNING" => CommandType::RepeatRunning,
            "SCHEDULER" => CommandType::Scheduler,
            "PAUSE" => CommandType::Pause,
            "STOP" => CommandType::Stop,
            _ => return None,
        };
        Some(t)
    }

    /// 是否为恢复既有流程实例的指令
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            CommandType::StartFailureTaskProcess
                | CommandType::RecoverSuspendedProcess
                | CommandType::RecoverToleranceFaultProcess
                | CommandType::RecoverWaitingThread
                | CommandType::RepeatRunning
        )
    }
}

/// 依赖判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependResult {
    Success,
    Waiting,
    Failed,
}

/// 节点运行标记，FORBIDDEN 节点在执行前被从 DAG 剪除
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunFlag {
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,
}

impl Default for RunFlag {
    fn default() -> Self {
        RunFlag::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_finished() {
        assert!(ExecutionStatus::Success.is_finished());
        assert!(ExecutionStatus::Failure.is_finished());
        assert!(ExecutionStatus::Kill.is_finished());
        assert!(ExecutionStatus::Stop.is_finished());
        assert!(ExecutionStatus::Pause.is_finished());
        assert!(ExecutionStatus::WaitingThread.is_finished());

        assert!(!ExecutionStatus::SubmittedSuccess.is_finished());
        assert!(!ExecutionStatus::RunningExecution.is_finished());
        assert!(!ExecutionStatus::ReadyPause.is_finished());
        assert!(!ExecutionStatus::ReadyStop.is_finished());
        assert!(!ExecutionStatus::DelayExecution.is_finished());
    }

    #[test]
    fn test_execution_status_failure_contains_tolerance() {
        assert!(ExecutionStatus::NeedFaultTolerance.is_failure());
        assert!(ExecutionStatus::Failure.is_failure());
        assert!(!ExecutionStatus::Kill.is_failure());
    }

    #[test]
    fn test_execution_status_roundtrip() {
        let all = [
            ExecutionStatus::SubmittedSuccess,
            ExecutionStatus::RunningExecution,
            ExecutionStatus::ReadyPause,
            ExecutionStatus::Pause,
            ExecutionStatus::ReadyStop,
            ExecutionStatus::Stop,
            ExecutionStatus::Failure,
            ExecutionStatus::Success,
            ExecutionStatus::NeedFaultTolerance,
            ExecutionStatus::Kill,
            ExecutionStatus::WaitingThread,
            ExecutionStatus::DelayExecution,
        ];
        for status in all {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_priority_default_medium() {
        assert_eq!(Priority::default(), Priority::Medium);
        assert!(Priority::Highest < Priority::Medium);
        assert!(Priority::Medium < Priority::Lowest);
    }

    #[test]
    fn test_command_type_recovery() {
        assert!(CommandType::RecoverToleranceFaultProcess.is_recovery());
        assert!(CommandType::StartFailureTaskProcess.is_recovery());
        assert!(!CommandType::StartProcess.is_recovery());
        assert!(!CommandType::ComplementData.is_recovery());
    }
}
