//! 流程实例 DAG 执行引擎
//!
//! 单个流程实例的驱动者：就绪队列/活跃集合驱动的 DAG 遍历、依赖判定、
//! 失败重试与退避、暂停/停止状态机、补数循环。引擎内状态单线程顺序更新，
//! 跨 Master 以存储为准；引擎从不向上抛错，一切异常折算为流程终态。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowmaster_config::MasterConfig;
use flowmaster_domain::command_params::{
    CommandParams, CMD_PARAM_RECOVERY_START_NODE_IDS,
};
use flowmaster_domain::dag::{generate_flow_dag, TaskNode, WorkflowGraph};
use flowmaster_domain::entities::{next_schedule_day, ProcessInstance, TaskInstance};
use flowmaster_domain::enums::{
    DependResult, ExecutionStatus, FailureStrategy, Flag, Priority,
};
use flowmaster_domain::repositories::{ProcessStore, TaskDispatchQueue};
use flowmaster_errors::{MasterError, MasterResult};

use crate::alerter::Alerter;
use crate::cancel::StopFlag;
use crate::supervisor::{SupervisorHandle, TaskSupervisor};

struct ActiveTask {
    handle: JoinHandle<Option<TaskInstance>>,
    supervisor: SupervisorHandle,
}

pub struct DagEngine {
    process_instance: ProcessInstance,
    store: Arc<dyn ProcessStore>,
    queue: Arc<dyn TaskDispatchQueue>,
    alerter: Arc<dyn Alerter>,
    config: MasterConfig,
    stop: StopFlag,
    /// 任务监督器的有界执行池（Master 级共享）
    supervisor_permits: Arc<Semaphore>,

    dag: WorkflowGraph,
    complete_task_list: HashMap<String, TaskInstance>,
    error_task_list: HashMap<String, TaskInstance>,
    /// 依赖满足、等待派发（或重试退避中）的任务，保持插入顺序
    ready_to_submit: Vec<TaskInstance>,
    depend_failed_task: HashMap<String, TaskInstance>,
    forbidden_task_list: HashMap<String, TaskNode>,
    recover_tolerance_fault_tasks: Vec<TaskInstance>,
    active: HashMap<String, ActiveTask>,
    recover_node_list: Vec<TaskInstance>,
    task_failed_submit: bool,
}

impl DagEngine {
    pub fn new(
        process_instance: ProcessInstance,
        store: Arc<dyn ProcessStore>,
        queue: Arc<dyn TaskDispatchQueue>,
        alerter: Arc<dyn Alerter>,
        config: MasterConfig,
        stop: StopFlag,
        supervisor_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            process_instance,
            store,
            queue,
            alerter,
            config,
            stop,
            supervisor_permits,
            dag: WorkflowGraph::default(),
            complete_task_list: HashMap::new(),
            error_task_list: HashMap::new(),
            ready_to_submit: Vec::new(),
            depend_failed_task: HashMap::new(),
            forbidden_task_list: HashMap::new(),
            recover_tolerance_fault_tasks: Vec::new(),
            active: HashMap::new(),
            recover_node_list: Vec::new(),
            task_failed_submit: false,
        }
    }

    /// 驱动流程实例到终态
    ///
    /// 从不向调用方抛错：致命异常把实例置为 FAILURE 并持久化。
    pub async fn run(mut self) -> ExecutionStatus {
        if self.process_instance.state.is_finished() {
            info!("流程实例 {} 已结束，跳过执行", self.process_instance.id);
            return self.process_instance.state;
        }

        let result = if self.process_instance.is_complement_data()
            && !self.process_instance.is_sub_process()
        {
            self.execute_complement().await
        } else {
            self.execute().await
        };

        if let Err(e) = result {
            error!(
                "流程实例 {} 执行异常: {}，置为失败",
                self.process_instance.id, e
            );
            self.process_instance.state = ExecutionStatus::Failure;
            self.process_instance.end_time = Some(Utc::now());
            if let Err(update_err) = self
                .store
                .update_process_instance(&self.process_instance)
                .await
            {
                error!(
                    "持久化流程实例 {} 失败态时出错: {}",
                    self.process_instance.id, update_err
                );
            }
            let tasks = self
                .store
                .find_valid_task_list_by_process_id(self.process_instance.id)
                .await
                .unwrap_or_default();
            self.alerter
                .process_result(&self.process_instance, &tasks)
                .await;
        }

        self.post_handle();
        self.process_instance.state
    }

    async fn execute(&mut self) -> MasterResult<()> {
        self.prepare_process().await?;
        if self.dag.node_count() == 0 {
            warn!(
                "流程实例 {} 的 DAG 为空，直接置为成功",
                self.process_instance.id
            );
            self.process_instance.state = ExecutionStatus::Success;
            self.store
                .update_process_instance(&self.process_instance)
                .await?;
            return self.end_process().await;
        }
        self.run_process().await?;

        if self.stop.is_stopped() && !self.process_instance.is_process_instance_stop() {
            info!(
                "收到停止信号，流程实例 {} 保持状态 {:?} 等待接管",
                self.process_instance.id, self.process_instance.state
            );
            return Ok(());
        }
        self.end_process().await
    }

    /// 补数循环：按天推进调度时间，逐日重跑 DAG，任一日失败即终止
    async fn execute_complement(&mut self) -> MasterResult<()> {
        let params = CommandParams::parse(self.process_instance.command_param.as_deref())?;
        let start_date = params.complement_start_date();
        let end_date = params.complement_end_date();

        let mut schedule_date = match self.process_instance.schedule_time.or(start_date) {
            Some(date) => date,
            None => {
                return Err(MasterError::Internal(format!(
                    "流程实例 {} 补数缺少起始日期",
                    self.process_instance.id
                )))
            }
        };
        let end_date = match end_date {
            Some(date) => date,
            None => {
                return Err(MasterError::Internal(format!(
                    "流程实例 {} 补数缺少结束日期",
                    self.process_instance.id
                )))
            }
        };
        self.process_instance.schedule_time = Some(schedule_date);
        self.store
            .update_process_instance(&self.process_instance)
            .await?;

        while self.stop.is_running() {
            self.prepare_process().await?;
            if self.dag.node_count() == 0 {
                warn!(
                    "流程实例 {} 补数 DAG 为空，置为成功",
                    self.process_instance.id
                );
                self.process_instance.state = ExecutionStatus::Success;
                self.store
                    .update_process_instance(&self.process_instance)
                    .await?;
                break;
            }

            self.run_process().await?;

            if !self.process_instance.state.is_success() {
                info!(
                    "流程实例 {} 状态 {:?}，补数中止",
                    self.process_instance.id, self.process_instance.state
                );
                break;
            }

            let next_date = next_schedule_day(schedule_date);
            if next_date > end_date {
                info!("流程实例 {} 补数完成", self.process_instance.id);
                break;
            }
            schedule_date = next_date;
            info!(
                "流程实例 {} 开始补数 {}",
                self.process_instance.id,
                schedule_date.format("%Y-%m-%d")
            );

            // 上一轮任务实例作废，状态复位后执行下一个逻辑日期
            let mut params =
                CommandParams::parse(self.process_instance.command_param.as_deref())?;
            if params.remove(CMD_PARAM_RECOVERY_START_NODE_IDS) {
                self.process_instance.command_param = Some(params.to_json()?);
            }
            let tasks = self
                .store
                .find_valid_task_list_by_process_id(self.process_instance.id)
                .await?;
            for task in tasks {
                let mut stale = task;
                stale.flag = Flag::No;
                self.store.update_task_instance(&stale).await?;
            }
            self.process_instance.schedule_time = Some(schedule_date);
            self.process_instance.state = ExecutionStatus::RunningExecution;
            self.store
                .update_process_instance(&self.process_instance)
                .await?;
        }

        if self.stop.is_stopped() && !self.process_instance.is_process_instance_stop() {
            info!(
                "收到停止信号，补数流程实例 {} 保持状态等待接管",
                self.process_instance.id
            );
            return Ok(());
        }
        self.end_process().await
    }

    /// 装载执行上下文：回放已持久化的任务实例、解析指令参数、构建裁剪后 DAG
    async fn prepare_process(&mut self) -> MasterResult<()> {
        self.init_task_queue().await?;
        self.build_flow_dag().await?;
        info!("流程实例 {} 准备完成", self.process_instance.id);
        Ok(())
    }

    async fn init_task_queue(&mut self) -> MasterResult<()> {
        self.task_failed_submit = false;
        self.active.clear();
        self.ready_to_submit.clear();
        self.depend_failed_task.clear();
        self.complete_task_list.clear();
        self.error_task_list.clear();
        self.recover_tolerance_fault_tasks.clear();

        let tasks = self
            .store
            .find_valid_task_list_by_process_id(self.process_instance.id)
            .await?;
        for task in tasks {
            if task.is_task_complete() {
                self.complete_task_list.insert(task.name.clone(), task.clone());
            }
            if task.state.is_failure() && !task.task_can_retry() {
                self.error_task_list.insert(task.name.clone(), task);
            }
        }
        Ok(())
    }

    async fn build_flow_dag(&mut self) -> MasterResult<()> {
        let params = CommandParams::parse(self.process_instance.command_param.as_deref())?;

        self.recover_node_list.clear();
        for task_id in params.recovery_start_node_ids() {
            match self.store.find_task_instance_by_id(task_id).await? {
                Some(task) => self.recover_node_list.push(task),
                None => warn!("恢复起始任务实例 {} 不存在", task_id),
            }
        }
        let recovery_names: Vec<String> = self
            .recover_node_list
            .iter()
            .map(|t| t.name.clone())
            .collect();
        let start_names = params.start_node_names();

        self.forbidden_task_list = flowmaster_domain::dag::get_forbidden_task_nodes(
            &self.process_instance.process_instance_json,
        )?;

        let process_dag = generate_flow_dag(
            &self.process_instance.process_instance_json,
            &start_names,
            &recovery_names,
            self.process_instance.task_depend_type,
        )?;
        self.dag = match process_dag {
            Some(dag) => WorkflowGraph::build(&dag)?,
            None => WorkflowGraph::default(),
        };
        Ok(())
    }

    /// 主循环：提交起始边界后按固定节拍轮询，直到流程停止
    async fn run_process(&mut self) -> MasterResult<()> {
        self.submit_post_node(None).await?;
        let mut sent_timeout_warning = false;
        let tick = Duration::from_millis(self.config.tick_interval_ms);

        while !self.process_instance.is_process_instance_stop() && self.stop.is_running() {
            // 超时告警只发一次
            if !sent_timeout_warning
                && self.process_instance.check_process_timeout(Utc::now())
            {
                self.alerter.process_timeout(&self.process_instance).await;
                sent_timeout_warning = true;
            }

            self.drain_finished_supervisors().await?;

            // 失败优先于暂停：出现失败后把已暂停的任务改写为 KILL
            if !self.error_task_list.is_empty() {
                let paused: Vec<String> = self
                    .complete_task_list
                    .iter()
                    .filter(|(_, t)| t.state == ExecutionStatus::Pause)
                    .map(|(name, _)| name.clone())
                    .collect();
                for name in paused {
                    if let Some(task) = self.complete_task_list.get_mut(&name) {
                        task.state = ExecutionStatus::Kill;
                        let task = task.clone();
                        self.store.update_task_instance(&task).await?;
                    }
                }
            }

            // 本轮容错告警统一冲刷
            if !self.recover_tolerance_fault_tasks.is_empty() {
                self.alerter
                    .worker_tolerance_fault(
                        &self.process_instance,
                        &self.recover_tolerance_fault_tasks,
                    )
                    .await;
                self.recover_tolerance_fault_tasks.clear();
            }

            // 主机资源越限时暂缓派发（背压）
            if crate::resource::check_resource(&self.config) {
                self.submit_standby_tasks().await?;
            }

            tokio::time::sleep(tick).await;
            self.update_process_instance_state().await?;
        }

        info!(
            "流程实例 {} 执行循环结束，状态 {:?}",
            self.process_instance.id, self.process_instance.state
        );
        Ok(())
    }

    /// 回收已结束的任务监督器并分类
    async fn drain_finished_supervisors(&mut self) -> MasterResult<()> {
        if self.stop.is_stopped() {
            return Ok(());
        }
        let finished: Vec<String> = self
            .active
            .iter()
            .filter(|(_, active)| active.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in finished {
            let active = self.active.remove(&name).expect("活跃集合包含该任务");
            let task = match active.handle.await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    // 提交失败
                    self.task_failed_submit = true;
                    continue;
                }
                Err(e) => {
                    error!("任务 {} 监督协程异常退出: {}", name, e);
                    self.task_failed_submit = true;
                    continue;
                }
            };
            info!(
                "任务 {} (id {}) 完成，状态 {:?}",
                task.name, task.id, task.state
            );

            if task.state.is_success() {
                self.complete_task_list.insert(task.name.clone(), task.clone());
                self.submit_post_node(Some(&task.name)).await?;
                continue;
            }

            if task.state.is_failure() {
                if task.state == ExecutionStatus::NeedFaultTolerance {
                    self.recover_tolerance_fault_tasks.push(task.clone());
                }
                if task.task_can_retry() {
                    self.add_task_to_standby_list(task);
                } else {
                    self.error_task_list.insert(task.name.clone(), task.clone());
                    self.complete_task_list.insert(task.name.clone(), task);
                    if self.process_instance.failure_strategy == FailureStrategy::End {
                        self.kill_others().await?;
                    }
                }
                continue;
            }

            // 暂停/停止/终止：记完成，不展开后继
            self.complete_task_list.insert(task.name.clone(), task);
        }
        Ok(())
    }

    /// 提交后继节点；parent 为空时计算起始边界
    async fn submit_post_node(&mut self, parent: Option<&str>) -> MasterResult<()> {
        let submit_list = match parent {
            None => self.start_frontier().await?,
            Some(parent_name) => {
                let mut tasks = Vec::new();
                for child in self.dag.successors(parent_name) {
                    tasks.push(self.create_task_instance(&child).await?);
                }
                tasks
            }
        };

        for task in submit_list {
            if self.ready_contains(&task.name) {
                continue;
            }
            if self.complete_task_list.contains_key(&task.name) {
                info!("任务 {} 已执行成功，跳过", task.name);
                continue;
            }
            if task.state.is_pause() || task.state.is_cancel() {
                info!("任务 {} 已停止，状态 {:?}，跳过", task.name, task.state);
            } else {
                self.add_task_to_standby_list(task);
            }
        }
        Ok(())
    }

    /// 起始边界：从源节点迭代下探，越过已成功节点，收集全部可提交节点
    async fn start_frontier(&mut self) -> MasterResult<Vec<TaskInstance>> {
        let mut current = Vec::new();
        for source in self.dag.source_nodes() {
            current.push(self.create_task_instance(&source).await?);
        }

        let mut result: Vec<TaskInstance> = Vec::new();
        let mut success_names: Vec<String> = Vec::new();
        while self.stop.is_running() {
            for task in current.drain(..) {
                if task.state.is_success() {
                    success_names.push(task.name.clone());
                } else if !self.complete_task_list.contains_key(&task.name)
                    && !self.error_task_list.contains_key(&task.name)
                    && !result.iter().any(|t| t.name == task.name)
                {
                    result.push(task);
                }
            }
            if success_names.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for name in success_names.drain(..) {
                for child in self.dag.successors(&name) {
                    next.push(self.create_task_instance(&child).await?);
                }
            }
            current = next;
        }
        Ok(result)
    }

    /// 创建或复用任务实例：同名的已持久化实例优先
    async fn create_task_instance(&self, node_name: &str) -> MasterResult<TaskInstance> {
        let existing = self
            .store
            .find_valid_task_list_by_process_id(self.process_instance.id)
            .await?
            .into_iter()
            .find(|t| t.name == node_name);
        if let Some(task) = existing {
            return Ok(task);
        }

        let node = self.dag.node(node_name).ok_or_else(|| {
            MasterError::InvalidDag(format!("节点 {node_name} 不在执行子图中"))
        })?;
        let now = Utc::now();
        Ok(TaskInstance {
            id: 0,
            name: node.name.clone(),
            task_type: node.task_type.clone(),
            process_definition_id: self.process_instance.process_definition_id,
            process_instance_id: self.process_instance.id,
            task_json: serde_json::to_string(node)?,
            state: ExecutionStatus::SubmittedSuccess,
            submit_time: Some(now),
            start_time: Some(now),
            end_time: None,
            host: None,
            retry_times: 0,
            max_retry_times: node.max_retry_times,
            retry_interval: node.retry_interval,
            flag: Flag::Yes,
            alert_flag: Flag::No,
            task_instance_priority: node.task_instance_priority.unwrap_or(Priority::Medium),
            worker_group_id: node.worker_group_id,
            app_links: None,
        })
    }

    fn ready_contains(&self, name: &str) -> bool {
        self.ready_to_submit.iter().any(|t| t.name == name)
    }

    fn add_task_to_standby_list(&mut self, task: TaskInstance) {
        if self.ready_contains(&task.name) {
            return;
        }
        info!("任务 {} 加入待提交队列", task.name);
        self.ready_to_submit.push(task);
    }

    fn remove_task_from_standby_list(&mut self, name: &str) {
        info!("任务 {} 移出待提交队列", name);
        self.ready_to_submit.retain(|t| t.name != name);
    }

    /// 遍历待提交队列：依赖满足且退避到期的派发，依赖失败的移入失败集
    ///
    /// 失败终止策略下一旦出现失败任务便不再追加派发；预备暂停/停止
    /// 状态下同样只收不发，等待活跃集合排空后收敛。
    async fn submit_standby_tasks(&mut self) -> MasterResult<()> {
        let halt_dispatch = (self.process_instance.failure_strategy == FailureStrategy::End
            && self.has_failed_task())
            || matches!(
                self.process_instance.state,
                ExecutionStatus::ReadyPause | ExecutionStatus::ReadyStop
            );
        let snapshot = self.ready_to_submit.clone();
        for task in snapshot {
            match self.is_task_deps_complete(&task.name) {
                DependResult::Success => {
                    if !halt_dispatch && task.retry_interval_elapsed(Utc::now()) {
                        self.submit_task_exec(task.clone());
                        self.remove_task_from_standby_list(&task.name);
                    }
                }
                DependResult::Failed => {
                    info!("任务 {} 依赖失败，不再提交", task.name);
                    self.depend_failed_task.insert(task.name.clone(), task.clone());
                    self.remove_task_from_standby_list(&task.name);
                }
                DependResult::Waiting => {
                    debug!("任务 {} 等待依赖完成", task.name);
                }
            }
        }
        Ok(())
    }

    /// 把任务交给监督器，在有界池上运行
    fn submit_task_exec(&mut self, task: TaskInstance) {
        let name = task.name.clone();
        let (supervisor, handle) = TaskSupervisor::new(
            task,
            self.process_instance.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Duration::from_millis(self.config.task_poll_interval_ms),
            self.stop.clone(),
        );
        let permits = Arc::clone(&self.supervisor_permits);
        let join = tokio::spawn(async move {
            // 池满时在此排队
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return None,
            };
            supervisor.run().await
        });
        self.active.insert(
            name,
            ActiveTask {
                handle: join,
                supervisor: handle,
            },
        );
    }

    /// 依赖判定：源节点直接成功；全部非禁用依赖成功才算满足
    fn is_task_deps_complete(&self, task_name: &str) -> DependResult {
        let sources = self.dag.source_nodes();
        if sources.iter().any(|s| s == task_name) {
            return DependResult::Success;
        }
        let node = match self.dag.node(task_name) {
            Some(node) => node,
            None => return DependResult::Waiting,
        };
        for dep in &node.deps {
            if self.forbidden_task_list.contains_key(dep) {
                continue;
            }
            let complete = match self.complete_task_list.get(dep) {
                Some(task) => task,
                None => return DependResult::Waiting,
            };
            if complete.state.is_failure() {
                return DependResult::Failed;
            }
            if complete.state.is_pause() || complete.state.is_cancel() {
                return DependResult::Waiting;
            }
        }
        DependResult::Success
    }

    fn complete_tasks_by_state(&self, state: ExecutionStatus) -> Vec<&TaskInstance> {
        self.complete_task_list
            .values()
            .filter(|t| t.state == state)
            .collect()
    }

    fn has_failed_task(&self) -> bool {
        self.task_failed_submit
            || !self.error_task_list.is_empty()
            || !self.depend_failed_task.is_empty()
    }

    fn process_failed(&self) -> bool {
        if !self.has_failed_task() {
            return false;
        }
        match self.process_instance.failure_strategy {
            FailureStrategy::End => true,
            FailureStrategy::Continue => {
                self.ready_to_submit.is_empty() && self.active.is_empty()
            }
        }
    }

    fn has_waiting_thread_task(&self) -> bool {
        !self
            .complete_tasks_by_state(ExecutionStatus::WaitingThread)
            .is_empty()
    }

    fn has_retry_task_in_standby(&self) -> bool {
        self.ready_to_submit.iter().any(|t| t.state.is_failure())
    }

    /// 活跃任务未结束时维持运行中状态
    fn running_state(state: ExecutionStatus) -> ExecutionStatus {
        match state {
            ExecutionStatus::ReadyStop
            | ExecutionStatus::ReadyPause
            | ExecutionStatus::WaitingThread => state,
            _ => ExecutionStatus::RunningExecution,
        }
    }

    /// 预备暂停的收敛
    fn process_ready_pause(&self) -> ExecutionStatus {
        if self.has_retry_task_in_standby() {
            return ExecutionStatus::Failure;
        }
        let has_pause = !self.complete_tasks_by_state(ExecutionStatus::Pause).is_empty();
        if has_pause || !self.is_complement_end() || !self.ready_to_submit.is_empty() {
            ExecutionStatus::Pause
        } else {
            ExecutionStatus::Success
        }
    }

    fn is_complement_end(&self) -> bool {
        if !self.process_instance.is_complement_data() {
            return true;
        }
        let params = match CommandParams::parse(self.process_instance.command_param.as_deref())
        {
            Ok(params) => params,
            Err(e) => {
                error!("解析补数参数失败: {}", e);
                return false;
            }
        };
        match (
            self.process_instance.schedule_time,
            params.complement_end_date(),
        ) {
            (Some(schedule), Some(end)) => schedule >= end,
            _ => true,
        }
    }

    /// 由任务状态推导流程实例最新状态
    async fn process_instance_state(&self) -> MasterResult<ExecutionStatus> {
        let state = self
            .store
            .find_process_instance_by_id(self.process_instance.id)
            .await?
            .map(|instance| instance.state)
            .unwrap_or(self.process_instance.state);

        if !self.active.is_empty() {
            return Ok(Self::running_state(state));
        }
        if self.process_failed() {
            return Ok(ExecutionStatus::Failure);
        }
        if self.has_waiting_thread_task() {
            return Ok(ExecutionStatus::WaitingThread);
        }
        if state == ExecutionStatus::ReadyPause {
            return Ok(self.process_ready_pause());
        }
        if state == ExecutionStatus::ReadyStop {
            let stopped = !self.complete_tasks_by_state(ExecutionStatus::Stop).is_empty()
                || !self.complete_tasks_by_state(ExecutionStatus::Kill).is_empty();
            if stopped || !self.is_complement_end() {
                return Ok(ExecutionStatus::Stop);
            }
            return Ok(ExecutionStatus::Success);
        }
        if state == ExecutionStatus::RunningExecution {
            if self.ready_to_submit.is_empty() {
                return Ok(ExecutionStatus::Success);
            }
            // 待提交队列非空说明仍在等待依赖或重试
            return Ok(ExecutionStatus::RunningExecution);
        }
        Ok(state)
    }

    /// 状态变化才持久化
    async fn update_process_instance_state(&mut self) -> MasterResult<()> {
        let state = self.process_instance_state().await?;
        if self.process_instance.state != state {
            info!(
                "流程实例 [id: {}, name: {}] 状态 {:?} -> {:?}，指令类型 {:?}",
                self.process_instance.id,
                self.process_instance.name,
                self.process_instance.state,
                state,
                self.process_instance.command_type
            );
            let mut instance = self
                .store
                .find_process_instance_by_id(self.process_instance.id)
                .await?
                .unwrap_or_else(|| self.process_instance.clone());
            instance.state = state;
            self.store.update_process_instance(&instance).await?;
            self.process_instance = instance;
        }
        Ok(())
    }

    /// 终止其余活跃任务（已到终态的跳过）
    async fn kill_others(&mut self) -> MasterResult<()> {
        info!(
            "流程实例 {} 终止剩余任务，活跃数 {}",
            self.process_instance.id,
            self.active.len()
        );
        for active in self.active.values() {
            let snapshot = active.supervisor.task_snapshot();
            if snapshot.id > 0 {
                if let Some(fresh) = self.store.find_task_instance_by_id(snapshot.id).await? {
                    if fresh.state.is_finished() {
                        continue;
                    }
                }
            }
            info!(
                "终止任务 {} (流程实例 {})",
                active.supervisor.name(),
                self.process_instance.id
            );
            active.supervisor.kill();
        }
        Ok(())
    }

    /// 收尾：写入 end_time、WAITING_THREAD 写恢复指令、发送结果告警
    async fn end_process(&mut self) -> MasterResult<()> {
        self.process_instance.end_time = Some(Utc::now());
        self.store
            .update_process_instance(&self.process_instance)
            .await?;
        if self.process_instance.state.is_waiting_thread() {
            self.store
                .create_recovery_waiting_thread_command(None, &self.process_instance)
                .await?;
        }
        let tasks = self
            .store
            .find_valid_task_list_by_process_id(self.process_instance.id)
            .await?;
        self.alerter
            .process_result(&self.process_instance, &tasks)
            .await;
        Ok(())
    }

    /// 清理执行目录，开发模式保留现场
    fn post_handle(&self) {
        if self.config.develop_mode {
            debug!("开发模式，保留执行目录");
            return;
        }
        let exec_dir = format!(
            "{}/{}/{}",
            self.config.exec_base_dir,
            self.process_instance.process_definition_id,
            self.process_instance.id
        );
        if Path::new(&exec_dir).exists() {
            if let Err(e) = std::fs::remove_dir_all(&exec_dir) {
                error!("删除执行目录 {} 失败: {}", exec_dir, e);
            }
        }
    }
}
