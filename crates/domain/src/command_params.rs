//! 指令参数
//!
//! `command_param` 字段为键值均为字符串的 JSON 对象，这里提供类型化视图。
//! 未识别的键原样保留，回写时不丢失。

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use flowmaster_errors::{MasterError, MasterResult};

/// 容错/失败恢复的起始任务实例 id 列表，逗号分隔
pub const CMD_PARAM_RECOVERY_START_NODE_IDS: &str = "StartNodeIdList";
/// 指定起始节点名列表，逗号分隔
pub const CMD_PARAM_START_NODE_NAMES: &str = "StartNodeNameList";
/// 补数起始日期
pub const CMD_PARAM_COMPLEMENT_START_DATE: &str = "complementStartDate";
/// 补数结束日期
pub const CMD_PARAM_COMPLEMENT_END_DATE: &str = "complementEndDate";
/// 恢复指令指向的既有流程实例 id
pub const CMD_PARAM_RECOVER_PROCESS_ID: &str = "ProcessInstanceId";
/// 子流程回溯：父流程实例 id / 父任务实例 id
pub const CMD_PARAM_PARENT_PROCESS_ID: &str = "ParentProcessInstanceId";
pub const CMD_PARAM_PARENT_TASK_ID: &str = "ParentTaskInstanceId";

/// 指令参数的类型化视图
#[derive(Debug, Clone, Default)]
pub struct CommandParams {
    params: BTreeMap<String, String>,
}

impl CommandParams {
    /// 解析 `command_param` JSON；`None` 或空串视为空参数
    pub fn parse(command_param: Option<&str>) -> MasterResult<Self> {
        let raw = match command_param {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Ok(Self::default()),
        };
        let params: BTreeMap<String, String> = serde_json::from_str(raw)?;
        Ok(Self { params })
    }

    pub fn to_json(&self) -> MasterResult<String> {
        serde_json::to_string(&self.params).map_err(MasterError::from)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: &str, value: String) {
        self.params.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.params.remove(key).is_some()
    }

    /// 容错恢复的起始任务实例 id 列表
    pub fn recovery_start_node_ids(&self) -> Vec<i64> {
        self.get(CMD_PARAM_RECOVERY_START_NODE_IDS)
            .map(|s| {
                s.split(',')
                    .filter_map(|part| part.trim().parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_recovery_start_node_ids(&mut self, ids: &[i64]) {
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.set(CMD_PARAM_RECOVERY_START_NODE_IDS, joined);
    }

    /// 指定起始节点名列表
    pub fn start_node_names(&self) -> Vec<String> {
        self.get(CMD_PARAM_START_NODE_NAMES)
            .map(|s| {
                s.split(',')
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn complement_start_date(&self) -> Option<DateTime<Utc>> {
        self.get(CMD_PARAM_COMPLEMENT_START_DATE)
            .and_then(parse_schedule_date)
    }

    pub fn complement_end_date(&self) -> Option<DateTime<Utc>> {
        self.get(CMD_PARAM_COMPLEMENT_END_DATE)
            .and_then(parse_schedule_date)
    }

    pub fn recover_process_instance_id(&self) -> Option<i64> {
        self.get(CMD_PARAM_RECOVER_PROCESS_ID)
            .and_then(|s| s.parse::<i64>().ok())
    }

    pub fn parent_process_instance_id(&self) -> Option<i64> {
        self.get(CMD_PARAM_PARENT_PROCESS_ID)
            .and_then(|s| s.parse::<i64>().ok())
    }

    pub fn parent_task_instance_id(&self) -> Option<i64> {
        self.get(CMD_PARAM_PARENT_TASK_ID)
            .and_then(|s| s.parse::<i64>().ok())
    }
}

/// 解析调度日期，兼容 `yyyy-MM-dd HH:mm:ss` 与 `yyyy-MM-dd`
pub fn parse_schedule_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert!(CommandParams::parse(None).unwrap().is_empty());
        assert!(CommandParams::parse(Some("")).unwrap().is_empty());
        assert!(CommandParams::parse(Some("{}")).unwrap().is_empty());
    }

    #[test]
    fn test_recovery_node_ids() {
        let params =
            CommandParams::parse(Some(r#"{"StartNodeIdList": "3,7, 11"}"#)).unwrap();
        assert_eq!(params.recovery_start_node_ids(), vec![3, 7, 11]);
    }

    #[test]
    fn test_start_node_names() {
        let params =
            CommandParams::parse(Some(r#"{"StartNodeNameList": "A, B"}"#)).unwrap();
        assert_eq!(params.start_node_names(), vec!["A", "B"]);
    }

    #[test]
    fn test_complement_dates() {
        let params = CommandParams::parse(Some(
            r#"{"complementStartDate": "2024-01-01", "complementEndDate": "2024-01-03 00:00:00"}"#,
        ))
        .unwrap();
        let start = params.complement_start_date().unwrap();
        let end = params.complement_end_date().unwrap();
        assert_eq!(start.format("%Y-%m-%d").to_string(), "2024-01-01");
        assert_eq!(end.format("%Y-%m-%d").to_string(), "2024-01-03");
        assert!(start < end);
    }

    #[test]
    fn test_roundtrip_preserves_unknown_keys() {
        let mut params = CommandParams::parse(Some(r#"{"custom": "x"}"#)).unwrap();
        params.set_recovery_start_node_ids(&[5]);
        let json = params.to_json().unwrap();
        let reparsed = CommandParams::parse(Some(&json)).unwrap();
        assert_eq!(reparsed.get("custom"), Some("x"));
        assert_eq!(reparsed.recovery_start_node_ids(), vec![5]);

        // 补数翻页时移除恢复节点参数
        let mut params = reparsed;
        assert!(params.remove(CMD_PARAM_RECOVERY_START_NODE_IDS));
        assert!(params.recovery_start_node_ids().is_empty());
    }
}
