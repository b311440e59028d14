//! 主机资源探测与准入控制
//!
//! 派发前检查本机负载与可用内存，越过阈值即暂缓派发（背压），
//! 下一轮询再试。Linux 之外的平台不做限制。

use tracing::warn;

use flowmaster_config::MasterConfig;

/// 派发准入：负载与可用内存都在阈值内才放行
pub fn check_resource(config: &MasterConfig) -> bool {
    let max_load = if config.max_cpu_load_avg > 0.0 {
        config.max_cpu_load_avg
    } else {
        // 未配置时按核数的两倍推算
        (cpu_count() * 2) as f64
    };

    if let Some(load) = current_load_average() {
        if load > max_load {
            warn!("系统负载 {:.2} 超过阈值 {:.2}，暂缓任务派发", load, max_load);
            return false;
        }
    }

    if let Some(available) = available_memory_ratio() {
        if available < config.reserved_memory {
            warn!(
                "可用内存占比 {:.2} 低于阈值 {:.2}，暂缓任务派发",
                available, config.reserved_memory
            );
            return false;
        }
    }

    true
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// 近一分钟平均负载
#[cfg(target_os = "linux")]
pub fn current_load_average() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    content.split_whitespace().next()?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn current_load_average() -> Option<f64> {
    None
}

/// 可用内存占比（0-1）
#[cfg(target_os = "linux")]
pub fn available_memory_ratio() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.split_whitespace().next()?.parse::<f64>().ok();
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }
    match (total_kb, available_kb) {
        (Some(total), Some(available)) if total > 0.0 => Some(available / total),
        _ => None,
    }
}

#[cfg(not(target_os = "linux"))]
pub fn available_memory_ratio() -> Option<f64> {
    None
}

/// 心跳上报的 CPU 使用率估算（0-100）
pub fn cpu_usage_percent() -> f64 {
    match current_load_average() {
        Some(load) => ((load / cpu_count() as f64) * 100.0).min(100.0),
        None => 0.0,
    }
}

/// 心跳上报的内存使用率（0-100）
pub fn memory_usage_percent() -> f64 {
    match available_memory_ratio() {
        Some(available) => ((1.0 - available) * 100.0).clamp(0.0, 100.0),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_resource_with_generous_thresholds() {
        let mut config = MasterConfig::default();
        config.max_cpu_load_avg = 10_000.0;
        config.reserved_memory = 0.0;
        assert!(check_resource(&config));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_probes_return_values() {
        assert!(current_load_average().is_some());
        let ratio = available_memory_ratio().unwrap();
        assert!(ratio > 0.0 && ratio <= 1.0);

        let cpu = cpu_usage_percent();
        assert!((0.0..=100.0).contains(&cpu));
        let mem = memory_usage_percent();
        assert!((0.0..=100.0).contains(&mem));
    }
}
