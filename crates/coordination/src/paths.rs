//! 协调命名空间路径
//!
//! 布局：
//! ```text
//! {namespace}/masters/{host:port}            临时节点，值为心跳
//! {namespace}/workers/{group}/{host:port}    临时节点，值为心跳
//! {namespace}/dead-servers/{type}_{host}     持久宕机标记
//! {namespace}/lock/failover/{startup|master|worker}
//! {namespace}/lock/masters                   指令认领互斥
//! ```

/// 协调节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Master,
    Worker,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Master => "master",
            NodeType::Worker => "worker",
        }
    }
}

/// 命名空间下的路径构造
#[derive(Debug, Clone)]
pub struct CoordPaths {
    namespace: String,
}

impl CoordPaths {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
        }
    }

    pub fn masters(&self) -> String {
        format!("{}/masters", self.namespace)
    }

    pub fn workers(&self) -> String {
        format!("{}/workers", self.namespace)
    }

    pub fn dead_servers(&self) -> String {
        format!("{}/dead-servers", self.namespace)
    }

    pub fn master_node(&self, address: &str) -> String {
        format!("{}/masters/{}", self.namespace, address)
    }

    pub fn worker_group(&self, group: &str) -> String {
        format!("{}/workers/{}", self.namespace, group)
    }

    pub fn worker_node(&self, group: &str, address: &str) -> String {
        format!("{}/workers/{}/{}", self.namespace, group, address)
    }

    pub fn dead_server_node(&self, node_type: NodeType, host: &str) -> String {
        format!(
            "{}/dead-servers/{}_{}",
            self.namespace,
            node_type.as_str(),
            host
        )
    }

    pub fn startup_failover_lock(&self) -> String {
        format!("{}/lock/failover/startup", self.namespace)
    }

    /// 按节点类型取失效转移锁路径
    ///
    /// 调用方必须先判空再加锁，空路径上的互斥行为未定义。
    pub fn failover_lock_path(&self, node_type: NodeType) -> Option<String> {
        match node_type {
            NodeType::Master => Some(format!("{}/lock/failover/master", self.namespace)),
            NodeType::Worker => Some(format!("{}/lock/failover/worker", self.namespace)),
        }
    }

    /// 流程实例认领的互斥锁路径
    pub fn masters_lock(&self) -> String {
        format!("{}/lock/masters", self.namespace)
    }

    /// 所有需要预创建的父节点
    pub fn parent_paths(&self) -> Vec<String> {
        vec![self.masters(), self.workers(), self.dead_servers()]
    }

    /// 从节点路径取出主机标识（最后一段）
    pub fn host_from_path(path: &str) -> String {
        path.rsplit('/').next().unwrap_or_default().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_layout() {
        let paths = CoordPaths::new("/flowmaster");
        assert_eq!(paths.masters(), "/flowmaster/masters");
        assert_eq!(
            paths.master_node("10.0.0.1:5678"),
            "/flowmaster/masters/10.0.0.1:5678"
        );
        assert_eq!(
            paths.worker_node("default", "10.0.0.2:1234"),
            "/flowmaster/workers/default/10.0.0.2:1234"
        );
        assert_eq!(
            paths.dead_server_node(NodeType::Worker, "10.0.0.2:1234"),
            "/flowmaster/dead-servers/worker_10.0.0.2:1234"
        );
        assert_eq!(
            paths.failover_lock_path(NodeType::Master).unwrap(),
            "/flowmaster/lock/failover/master"
        );
        assert_eq!(paths.masters_lock(), "/flowmaster/lock/masters");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let paths = CoordPaths::new("/flowmaster/");
        assert_eq!(paths.masters(), "/flowmaster/masters");
    }

    #[test]
    fn test_host_from_path() {
        assert_eq!(
            CoordPaths::host_from_path("/flowmaster/masters/10.0.0.1:5678"),
            "10.0.0.1:5678"
        );
    }
}
