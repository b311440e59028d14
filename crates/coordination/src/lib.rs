//! 协调服务客户端
//!
//! 对层级化、可监听、支持临时节点的协调存储（ZooKeeper 一类）的类型化封装：
//! 成员注册、子节点监听、宕机标记与分布式互斥锁。生产部署通过
//! [`registry::CoordRegistry`] 接入真实后端，内存实现用于测试与单机嵌入。

pub mod heartbeat;
pub mod memory;
pub mod paths;
pub mod registry;

pub use heartbeat::HeartbeatInfo;
pub use memory::InMemoryCoordRegistry;
pub use paths::{CoordPaths, NodeType};
pub use registry::{ChildEvent, CoordRegistry, EphemeralHandle, LockGuard};
