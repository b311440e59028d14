use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowmaster_config::AppConfig;
use flowmaster_coordination::InMemoryCoordRegistry;
use flowmaster_master::{LogAlerter, MasterServer};
use flowmaster_storage::{InMemoryProcessStore, InMemoryTaskDispatchQueue, PostgresProcessStore};

mod shutdown;

use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("flowmaster-master")
        .version("1.0.0")
        .about("分布式工作流调度系统 Master 节点")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("embedded")
                .long("embedded")
                .help("嵌入式单机模式：内存存储与内存协调")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let embedded = matches.get_flag("embedded");
    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();

    init_logging(log_level, log_format)?;

    info!("启动工作流调度 Master");
    if let Some(path) = config_path {
        info!("配置文件: {}", path);
    }

    // 加载配置，失败即退出非零
    let config = AppConfig::load(config_path.map(|s| s.as_str())).context("加载配置失败")?;

    // 装配存储与协调后端
    let registry = Arc::new(InMemoryCoordRegistry::new());
    let queue = Arc::new(InMemoryTaskDispatchQueue::new());
    let alerter = Arc::new(LogAlerter);

    let server = if embedded {
        info!("嵌入式模式：使用内存存储");
        MasterServer::new(
            config,
            Arc::new(InMemoryProcessStore::new()),
            queue,
            registry,
            alerter,
        )
    } else {
        let store = PostgresProcessStore::connect(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .context("连接数据库失败")?;
        MasterServer::new(config, Arc::new(store), queue, registry, alerter)
    };

    let shutdown_manager = ShutdownManager::new();

    // 启动服务
    let server_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_rx).await {
                error!("Master 服务运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), server_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                error!("服务关闭时发生错误: {e}");
            } else {
                info!("服务已优雅关闭");
            }
        }
        Err(_) => {
            warn!("服务关闭超时，强制退出");
        }
    }

    info!("工作流调度 Master 已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
