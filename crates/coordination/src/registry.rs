//! 协调存储抽象
//!
//! 监听语义：`watch_children` 返回事件接收端，事件在专用通道上投递，
//! 发送侧永不阻塞；接收方在单消费者循环中顺序处理。

use async_trait::async_trait;
use tokio::sync::mpsc;

use flowmaster_errors::MasterResult;

/// 子节点变更事件，路径为完整节点路径
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Added { path: String, data: String },
    Removed { path: String, data: String },
    Updated { path: String, data: String },
}

/// 临时节点句柄
///
/// 句柄被丢弃即视为会话结束，节点删除并向监听方投递 Removed 事件。
pub struct EphemeralHandle {
    path: String,
    releaser: Option<Box<dyn FnOnce() + Send>>,
}

impl EphemeralHandle {
    pub fn new(path: String, releaser: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            path,
            releaser: Some(releaser),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for EphemeralHandle {
    fn drop(&mut self) {
        if let Some(release) = self.releaser.take() {
            release();
        }
    }
}

impl std::fmt::Debug for EphemeralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralHandle")
            .field("path", &self.path)
            .finish()
    }
}

/// 分布式互斥锁的租约句柄，丢弃即释放
pub struct LockGuard {
    _lease: Box<dyn Send>,
}

impl LockGuard {
    pub fn new(lease: Box<dyn Send>) -> Self {
        Self { _lease: lease }
    }
}

/// 协调存储客户端
#[async_trait]
pub trait CoordRegistry: Send + Sync {
    /// 创建缺失的持久父节点
    async fn create_parents(&self, paths: &[String]) -> MasterResult<()>;

    /// 注册临时节点
    async fn register_ephemeral(&self, path: &str, data: &str) -> MasterResult<EphemeralHandle>;

    /// 更新节点数据（心跳刷新）
    async fn update_data(&self, path: &str, data: &str) -> MasterResult<()>;

    async fn exists(&self, path: &str) -> MasterResult<bool>;

    async fn get_data(&self, path: &str) -> MasterResult<Option<String>>;

    /// 直接子节点名列表
    async fn list_children(&self, parent: &str) -> MasterResult<Vec<String>>;

    /// 监听父节点下所有后代节点的增删改
    async fn watch_children(
        &self,
        parent: &str,
    ) -> MasterResult<mpsc::UnboundedReceiver<ChildEvent>>;

    /// 写入持久宕机标记
    async fn record_dead_server(&self, path: &str) -> MasterResult<()>;

    async fn is_dead_server(&self, path: &str) -> MasterResult<bool>;

    /// 获取分布式互斥锁，阻塞直到获得
    async fn acquire_lock(&self, path: &str) -> MasterResult<LockGuard>;
}
