//! 心跳信息
//!
//! 写入临时节点的服务器状态，线格式为冒号分隔的定长字段，
//! 时间取 epoch 秒避免与分隔符冲突。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatInfo {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    /// CPU 使用率（0-100）
    pub cpu_usage: f64,
    /// 内存使用率（0-100）
    pub memory_usage: f64,
    pub load_average: f64,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl HeartbeatInfo {
    pub fn new(host: &str, port: u16) -> Self {
        let now = Utc::now();
        Self {
            host: host.to_string(),
            port,
            pid: std::process::id(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            load_average: 0.0,
            start_time: now,
            last_heartbeat: now,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 刷新心跳时间与资源指标
    pub fn refresh(&mut self, cpu_usage: f64, memory_usage: f64, load_average: f64) {
        self.cpu_usage = cpu_usage;
        self.memory_usage = memory_usage;
        self.load_average = load_average;
        self.last_heartbeat = Utc::now();
    }

    /// 线格式: host:port:pid:cpu:mem:load:start_epoch:beat_epoch
    pub fn to_wire(&self) -> String {
        format!(
            "{}:{}:{}:{:.2}:{:.2}:{:.2}:{}:{}",
            self.host,
            self.port,
            self.pid,
            self.cpu_usage,
            self.memory_usage,
            self.load_average,
            self.start_time.timestamp(),
            self.last_heartbeat.timestamp()
        )
    }

    pub fn parse_wire(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 8 {
            return None;
        }
        Some(Self {
            host: parts[0].to_string(),
            port: parts[1].parse().ok()?,
            pid: parts[2].parse().ok()?,
            cpu_usage: parts[3].parse().ok()?,
            memory_usage: parts[4].parse().ok()?,
            load_average: parts[5].parse().ok()?,
            start_time: DateTime::from_timestamp(parts[6].parse().ok()?, 0)?,
            last_heartbeat: DateTime::from_timestamp(parts[7].parse().ok()?, 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let mut info = HeartbeatInfo::new("10.0.0.1", 5678);
        info.refresh(12.5, 40.0, 1.25);

        let wire = info.to_wire();
        let parsed = HeartbeatInfo::parse_wire(&wire).unwrap();

        assert_eq!(parsed.host, "10.0.0.1");
        assert_eq!(parsed.port, 5678);
        assert_eq!(parsed.pid, info.pid);
        assert!((parsed.cpu_usage - 12.5).abs() < f64::EPSILON);
        assert_eq!(parsed.start_time.timestamp(), info.start_time.timestamp());
        assert_eq!(parsed.address(), "10.0.0.1:5678");
    }

    #[test]
    fn test_parse_wire_rejects_garbage() {
        assert!(HeartbeatInfo::parse_wire("").is_none());
        assert!(HeartbeatInfo::parse_wire("a:b:c").is_none());
        assert!(HeartbeatInfo::parse_wire("h:x:1:0:0:0:0:0").is_none());
    }
}
