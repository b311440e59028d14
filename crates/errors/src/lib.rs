use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("流程实例未找到: {id}")]
    ProcessInstanceNotFound { id: i64 },
    #[error("流程定义未找到: {id}")]
    ProcessDefinitionNotFound { id: i64 },
    #[error("任务实例未找到: {id}")]
    TaskInstanceNotFound { id: i64 },
    #[error("DAG非法: {0}")]
    InvalidDag(String),
    #[error("检测到循环依赖")]
    CyclicDag,
    #[error("协调服务错误: {0}")]
    Coordination(String),
    #[error("获取分布式锁失败: {path}")]
    LockUnavailable { path: String },
    #[error("任务提交失败: {0}")]
    TaskSubmit(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("资源不足: {0}")]
    ResourceExhausted(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type MasterResult<T> = Result<T, MasterError>;

impl MasterError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn coordination_error<S: Into<String>>(msg: S) -> Self {
        Self::Coordination(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn process_instance_not_found(id: i64) -> Self {
        Self::ProcessInstanceNotFound { id }
    }
    pub fn task_instance_not_found(id: i64) -> Self {
        Self::TaskInstanceNotFound { id }
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MasterError::Internal(_)
                | MasterError::Configuration(_)
                | MasterError::ResourceExhausted(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MasterError::Database(_)
                | MasterError::DatabaseOperation(_)
                | MasterError::Coordination(_)
                | MasterError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for MasterError {
    fn from(err: serde_json::Error) -> Self {
        MasterError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for MasterError {
    fn from(err: anyhow::Error) -> Self {
        MasterError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(MasterError::Configuration("bad".to_string()).is_fatal());
        assert!(MasterError::Internal("oops".to_string()).is_fatal());
        assert!(!MasterError::Timeout("slow".to_string()).is_fatal());

        assert!(MasterError::DatabaseOperation("conn".to_string()).is_retryable());
        assert!(MasterError::Coordination("session".to_string()).is_retryable());
        assert!(!MasterError::CyclicDag.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = MasterError::ProcessInstanceNotFound { id: 42 };
        assert_eq!(err.to_string(), "流程实例未找到: 42");

        let err = MasterError::LockUnavailable {
            path: "/flowmaster/lock/failover/master".to_string(),
        };
        assert!(err.to_string().contains("/flowmaster/lock/failover/master"));
    }

    #[test]
    fn test_from_serde_json() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: MasterError = json_err.into();
        assert!(matches!(err, MasterError::Serialization(_)));
    }
}
