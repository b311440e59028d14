use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub coordination: CoordinationConfig,
    pub master: MasterConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

/// 协调服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// 命名空间根路径
    pub namespace: String,
    /// 会话超时（秒）
    pub session_timeout_seconds: u64,
}

/// Master 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// 本机标识，形如 host:port
    pub host: String,
    pub port: u16,
    /// 并发执行的流程实例上限
    pub exec_threads: usize,
    /// 单流程实例的任务监督并发上限
    pub exec_task_threads: usize,
    /// 心跳间隔（秒）
    pub heartbeat_interval_seconds: u64,
    /// DAG 主循环的轮询间隔（毫秒）
    pub tick_interval_ms: u64,
    /// 任务监督器查询任务状态的间隔（毫秒）
    pub task_poll_interval_ms: u64,
    /// 准入控制：系统负载上限，0 表示按 CPU 核数推算
    pub max_cpu_load_avg: f64,
    /// 准入控制：可用内存占比下限
    pub reserved_memory: f64,
    /// 服务下线告警的重复次数
    pub failover_warn_times: u32,
    /// 开发模式下保留执行目录
    pub develop_mode: bool,
    /// 任务执行目录根
    pub exec_base_dir: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/flowmaster".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            namespace: "/flowmaster".to_string(),
            session_timeout_seconds: 30,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5678,
            exec_threads: 100,
            exec_task_threads: 20,
            heartbeat_interval_seconds: 10,
            tick_interval_ms: 1000,
            task_poll_interval_ms: 500,
            max_cpu_load_avg: 0.0,
            reserved_memory: 0.1,
            failover_warn_times: 3,
            develop_mode: false,
            exec_base_dir: "/tmp/flowmaster/exec".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            coordination: CoordinationConfig::default(),
            master: MasterConfig::default(),
        }
    }
}

impl MasterConfig {
    /// 本机地址，注册到协调服务的标识
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// 指定路径时文件必须存在；未指定时按默认路径查找，找不到则使用默认值。
    /// 环境变量 `FLOWMASTER_MASTER__EXEC_THREADS=200` 形式的覆盖最后生效。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/master.toml",
                "master.toml",
                "/etc/flowmaster/master.toml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        let defaults = AppConfig::default();
        builder = builder
            .set_default("database.url", defaults.database.url.clone())?
            .set_default(
                "database.max_connections",
                defaults.database.max_connections as i64,
            )?
            .set_default(
                "database.min_connections",
                defaults.database.min_connections as i64,
            )?
            .set_default(
                "database.connection_timeout_seconds",
                defaults.database.connection_timeout_seconds as i64,
            )?
            .set_default("coordination.namespace", defaults.coordination.namespace.clone())?
            .set_default(
                "coordination.session_timeout_seconds",
                defaults.coordination.session_timeout_seconds as i64,
            )?
            .set_default("master.host", defaults.master.host.clone())?
            .set_default("master.port", defaults.master.port as i64)?
            .set_default("master.exec_threads", defaults.master.exec_threads as i64)?
            .set_default(
                "master.exec_task_threads",
                defaults.master.exec_task_threads as i64,
            )?
            .set_default(
                "master.heartbeat_interval_seconds",
                defaults.master.heartbeat_interval_seconds as i64,
            )?
            .set_default(
                "master.tick_interval_ms",
                defaults.master.tick_interval_ms as i64,
            )?
            .set_default(
                "master.task_poll_interval_ms",
                defaults.master.task_poll_interval_ms as i64,
            )?
            .set_default("master.max_cpu_load_avg", defaults.master.max_cpu_load_avg)?
            .set_default("master.reserved_memory", defaults.master.reserved_memory)?
            .set_default(
                "master.failover_warn_times",
                defaults.master.failover_warn_times as i64,
            )?
            .set_default("master.develop_mode", defaults.master.develop_mode)?
            .set_default("master.exec_base_dir", defaults.master.exec_base_dir.clone())?;

        let config = builder
            .add_source(Environment::with_prefix("FLOWMASTER").separator("__"))
            .build()
            .context("构建配置失败")?;

        let app_config: AppConfig = config.try_deserialize().context("解析配置失败")?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.master.exec_threads == 0 {
            return Err(anyhow::anyhow!("master.exec_threads 必须大于 0"));
        }
        if self.master.exec_task_threads == 0 {
            return Err(anyhow::anyhow!("master.exec_task_threads 必须大于 0"));
        }
        if self.master.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("master.tick_interval_ms 必须大于 0"));
        }
        if !(0.0..1.0).contains(&self.master.reserved_memory) {
            return Err(anyhow::anyhow!("master.reserved_memory 必须位于 [0, 1) 区间"));
        }
        if !self.coordination.namespace.starts_with('/') {
            return Err(anyhow::anyhow!("coordination.namespace 必须以 / 开头"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.master.exec_threads, 100);
        assert_eq!(config.master.exec_task_threads, 20);
        assert_eq!(config.master.heartbeat_interval_seconds, 10);
        assert_eq!(config.master.failover_warn_times, 3);
        assert_eq!(config.coordination.namespace, "/flowmaster");
    }

    #[test]
    fn test_validation_rejects_zero_threads() {
        let mut config = AppConfig::default();
        config.master.exec_threads = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.master.reserved_memory = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.coordination.namespace = "flowmaster".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let result = AppConfig::load(Some("/nonexistent/master.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_master_address() {
        let config = MasterConfig::default();
        assert_eq!(config.address(), "127.0.0.1:5678");
    }
}
