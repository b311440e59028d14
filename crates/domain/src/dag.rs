//! DAG 构建与裁剪
//!
//! 从流程定义 JSON 解析任务节点，按起始/恢复节点与依赖方向切分出
//! 本次执行的子图（[`ProcessDag`]），剪除 FORBIDDEN 节点并桥接其前后依赖，
//! 最终构建出双向邻接的内存图（[`WorkflowGraph`]）。

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use flowmaster_errors::{MasterError, MasterResult};

use crate::enums::{Priority, RunFlag, TaskDependType};

fn default_worker_group_id() -> i64 {
    -1
}

/// DAG 静态节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    /// 父节点名列表
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub run_flag: RunFlag,
    #[serde(default)]
    pub max_retry_times: i32,
    /// 重试间隔（分钟）
    #[serde(default)]
    pub retry_interval: i32,
    #[serde(default)]
    pub task_instance_priority: Option<Priority>,
    #[serde(default = "default_worker_group_id")]
    pub worker_group_id: i64,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskNode {
    pub fn is_forbidden(&self) -> bool {
        self.run_flag == RunFlag::Forbidden
    }
}

/// 流程定义 JSON 的反序列化形态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub global_params: serde_json::Value,
    pub tasks: Vec<TaskNode>,
    #[serde(default)]
    pub timeout: i32,
}

/// 切分后的执行子图
///
/// 节点的 `deps` 已改写为桥接 FORBIDDEN 节点之后的有效依赖。
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDag {
    pub nodes: Vec<TaskNode>,
    pub edges: Vec<(String, String)>,
}

/// 以节点名为键、双向邻接的内存 DAG
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    nodes: HashMap<String, TaskNode>,
    forward: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
}

impl WorkflowGraph {
    /// 由执行子图构建，同时校验无环
    pub fn build(process_dag: &ProcessDag) -> MasterResult<Self> {
        let mut graph = WorkflowGraph::default();
        for node in &process_dag.nodes {
            graph.nodes.insert(node.name.clone(), node.clone());
            graph.forward.entry(node.name.clone()).or_default();
            graph.reverse.entry(node.name.clone()).or_default();
        }
        for (parent, child) in &process_dag.edges {
            if !graph.nodes.contains_key(parent) || !graph.nodes.contains_key(child) {
                return Err(MasterError::InvalidDag(format!(
                    "边引用了不存在的节点: {parent} -> {child}"
                )));
            }
            graph
                .forward
                .get_mut(parent)
                .expect("节点已插入")
                .push(child.clone());
            graph
                .reverse
                .get_mut(child)
                .expect("节点已插入")
                .push(parent.clone());
        }
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&TaskNode> {
        self.nodes.get(name)
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for (parent, children) in &self.forward {
            for child in children {
                edges.push((parent.clone(), child.clone()));
            }
        }
        edges.sort();
        edges
    }

    /// 无前驱的起始节点，按名称排序保证遍历顺序稳定
    pub fn source_nodes(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .reverse
            .iter()
            .filter(|(_, parents)| parents.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        sources.sort();
        sources
    }

    pub fn successors(&self, name: &str) -> Vec<String> {
        let mut result = self.forward.get(name).cloned().unwrap_or_default();
        result.sort();
        result
    }

    pub fn predecessors(&self, name: &str) -> Vec<String> {
        let mut result = self.reverse.get(name).cloned().unwrap_or_default();
        result.sort();
        result
    }

    /// Kahn 拓扑检查
    fn check_acyclic(&self) -> MasterResult<()> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|name| (name.as_str(), self.reverse[name].len()))
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut processed = 0usize;
        while let Some(name) = queue.pop_front() {
            processed += 1;
            if let Some(children) = self.forward.get(name) {
                for child in children {
                    let degree = in_degree
                        .get_mut(child.as_str())
                        .expect("子节点必然在图中");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }
        if processed < self.nodes.len() {
            return Err(MasterError::CyclicDag);
        }
        Ok(())
    }
}

/// 解析定义中的 FORBIDDEN 节点
pub fn get_forbidden_task_nodes(definition_json: &str) -> MasterResult<HashMap<String, TaskNode>> {
    let definition: WorkflowDefinition = serde_json::from_str(definition_json)?;
    Ok(definition
        .tasks
        .into_iter()
        .filter(|node| node.is_forbidden())
        .map(|node| (node.name.clone(), node))
        .collect())
}

/// 按起始节点与依赖方向切分执行子图
///
/// 起始节点列表为空时回退到恢复节点列表，两者皆空则取整图。
/// FORBIDDEN 节点从结果中剪除，其上下游依赖桥接相连。
/// 定义为空返回 `None`。
pub fn generate_flow_dag(
    definition_json: &str,
    start_node_names: &[String],
    recovery_node_names: &[String],
    depend_type: TaskDependType,
) -> MasterResult<Option<ProcessDag>> {
    let definition: WorkflowDefinition = serde_json::from_str(definition_json)?;
    if definition.tasks.is_empty() {
        return Ok(None);
    }

    let all_nodes: HashMap<String, TaskNode> = definition
        .tasks
        .iter()
        .map(|node| (node.name.clone(), node.clone()))
        .collect();
    if all_nodes.len() != definition.tasks.len() {
        return Err(MasterError::InvalidDag("节点名称重复".to_string()));
    }

    // 全量双向邻接，FORBIDDEN 节点参与可达性计算
    let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &definition.tasks {
        forward.entry(node.name.as_str()).or_default();
        reverse.entry(node.name.as_str()).or_default();
    }
    for node in &definition.tasks {
        for dep in &node.deps {
            if !all_nodes.contains_key(dep) {
                return Err(MasterError::InvalidDag(format!(
                    "节点 {} 依赖了不存在的节点 {}",
                    node.name, dep
                )));
            }
            forward.entry(dep.as_str()).or_default().push(&node.name);
            reverse.entry(node.name.as_str()).or_default().push(dep);
        }
    }

    let starts: &[String] = if !start_node_names.is_empty() {
        start_node_names
    } else {
        recovery_node_names
    };
    for start in starts {
        if !all_nodes.contains_key(start) {
            return Err(MasterError::InvalidDag(format!("起始节点 {start} 不存在")));
        }
    }

    let selected: HashSet<String> = if starts.is_empty() {
        all_nodes.keys().cloned().collect()
    } else {
        let mut selected: HashSet<String> = starts.iter().cloned().collect();
        match depend_type {
            TaskDependType::Forward => {
                selected.extend(reachable(starts, &forward));
            }
            TaskDependType::Backward => {
                selected.extend(reachable(starts, &reverse));
            }
            TaskDependType::All => {
                selected.extend(reachable(starts, &forward));
                selected.extend(reachable(starts, &reverse));
            }
        }
        selected
    };

    let forbidden: HashSet<String> = all_nodes
        .values()
        .filter(|node| node.is_forbidden())
        .map(|node| node.name.clone())
        .collect();

    let mut kept_names: Vec<String> = selected
        .iter()
        .filter(|name| !forbidden.contains(*name))
        .cloned()
        .collect();
    kept_names.sort();

    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for name in &kept_names {
        let mut node = all_nodes[name].clone();
        let mut effective = Vec::new();
        let mut visited = HashSet::new();
        collect_effective_deps(
            &node.deps,
            &all_nodes,
            &forbidden,
            &selected,
            &mut visited,
            &mut effective,
        );
        for dep in &effective {
            edges.push((dep.clone(), name.clone()));
        }
        node.deps = effective;
        nodes.push(node);
    }

    let process_dag = ProcessDag { nodes, edges };
    // 切分结果必须仍然无环
    WorkflowGraph::build(&process_dag)?;
    Ok(Some(process_dag))
}

/// 沿给定邻接方向收集可达节点
fn reachable(starts: &[String], adjacency: &HashMap<&str, Vec<&str>>) -> HashSet<String> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<&str> = starts.iter().map(|s| s.as_str()).collect();
    while let Some(name) = queue.pop_front() {
        if let Some(nexts) = adjacency.get(name) {
            for next in nexts {
                if visited.insert((*next).to_string()) {
                    queue.push_back(next);
                }
            }
        }
    }
    visited
}

/// 展开依赖：FORBIDDEN 依赖用其自身依赖替代，子图之外的依赖丢弃
fn collect_effective_deps(
    deps: &[String],
    all_nodes: &HashMap<String, TaskNode>,
    forbidden: &HashSet<String>,
    selected: &HashSet<String>,
    visited: &mut HashSet<String>,
    result: &mut Vec<String>,
) {
    for dep in deps {
        if !visited.insert(dep.clone()) {
            continue;
        }
        if forbidden.contains(dep) {
            collect_effective_deps(
                &all_nodes[dep].deps,
                all_nodes,
                forbidden,
                selected,
                visited,
                result,
            );
        } else if selected.contains(dep) && !result.contains(dep) {
            result.push(dep.clone());
        }
    }
}
