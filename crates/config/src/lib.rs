//! 配置加载
//!
//! TOML 配置文件 + `FLOWMASTER_` 前缀环境变量覆盖，全部键都有默认值，
//! 缺省配置文件时可直接以默认值启动。

pub mod models;

pub use models::{AppConfig, CoordinationConfig, DatabaseConfig, MasterConfig};
