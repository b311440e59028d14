//! 流程存储实现
//!
//! PostgreSQL 为生产后端，内存实现供测试与单机嵌入部署。
//! 两者共享指令消费语义（见 [`command_handler`]）。

pub mod command_handler;
pub mod memory;
pub mod postgres;

pub use memory::{InMemoryProcessStore, InMemoryTaskDispatchQueue};
pub use postgres::PostgresProcessStore;
