//! 内存存储实现
//!
//! 语义与 PostgreSQL 实现一致，供单元/集成测试与单机嵌入部署使用。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use flowmaster_domain::command_params::{CommandParams, CMD_PARAM_RECOVER_PROCESS_ID};
use flowmaster_domain::entities::{Command, ProcessDefinition, ProcessInstance, TaskInstance};
use flowmaster_domain::enums::{CommandType, Flag};
use flowmaster_domain::repositories::{ProcessStore, TaskDispatch, TaskDispatchQueue};
use flowmaster_errors::MasterResult;

use crate::command_handler;

#[derive(Default)]
struct StoreInner {
    definitions: HashMap<i64, ProcessDefinition>,
    process_instances: HashMap<i64, ProcessInstance>,
    task_instances: HashMap<i64, TaskInstance>,
    commands: VecDeque<Command>,
    next_definition_id: i64,
    next_process_id: i64,
    next_task_id: i64,
    next_command_id: i64,
}

/// 内存流程存储
#[derive(Clone, Default)]
pub struct InMemoryProcessStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试辅助：全部任务实例（含 flag = NO 的历史记录）
    pub fn all_task_instances(&self) -> Vec<TaskInstance> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<TaskInstance> = inner.task_instances.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// 测试辅助：待处理指令数量
    pub fn pending_command_count(&self) -> usize {
        self.inner.lock().unwrap().commands.len()
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn save_process_definition(
        &self,
        definition: &ProcessDefinition,
    ) -> MasterResult<ProcessDefinition> {
        let mut inner = self.inner.lock().unwrap();
        let mut saved = definition.clone();
        if saved.id == 0 {
            inner.next_definition_id += 1;
            saved.id = inner.next_definition_id;
        }
        inner.definitions.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn find_process_definition_by_id(
        &self,
        id: i64,
    ) -> MasterResult<Option<ProcessDefinition>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.definitions.get(&id).cloned())
    }

    async fn save_process_instance(
        &self,
        process_instance: &ProcessInstance,
    ) -> MasterResult<ProcessInstance> {
        let mut inner = self.inner.lock().unwrap();
        let mut saved = process_instance.clone();
        if saved.id == 0 {
            inner.next_process_id += 1;
            saved.id = inner.next_process_id;
        }
        inner.process_instances.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn update_process_instance(
        &self,
        process_instance: &ProcessInstance,
    ) -> MasterResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .process_instances
            .insert(process_instance.id, process_instance.clone());
        Ok(())
    }

    async fn find_process_instance_by_id(
        &self,
        id: i64,
    ) -> MasterResult<Option<ProcessInstance>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.process_instances.get(&id).cloned())
    }

    async fn find_sub_process_instance(
        &self,
        parent_process_instance_id: i64,
        parent_task_instance_id: i64,
    ) -> MasterResult<Option<ProcessInstance>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .process_instances
            .values()
            .find(|pi| {
                pi.parent_process_instance_id == Some(parent_process_instance_id)
                    && pi.parent_task_instance_id == Some(parent_task_instance_id)
            })
            .cloned())
    }

    async fn find_valid_task_list_by_process_id(
        &self,
        process_instance_id: i64,
    ) -> MasterResult<Vec<TaskInstance>> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<TaskInstance> = inner
            .task_instances
            .values()
            .filter(|t| t.process_instance_id == process_instance_id && t.flag == Flag::Yes)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn find_task_instance_by_id(&self, id: i64) -> MasterResult<Option<TaskInstance>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.task_instances.get(&id).cloned())
    }

    async fn save_task_instance(
        &self,
        task_instance: &TaskInstance,
    ) -> MasterResult<TaskInstance> {
        let mut inner = self.inner.lock().unwrap();
        let mut saved = task_instance.clone();
        if saved.id == 0 {
            inner.next_task_id += 1;
            saved.id = inner.next_task_id;
        }
        inner.task_instances.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn update_task_instance(&self, task_instance: &TaskInstance) -> MasterResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .task_instances
            .insert(task_instance.id, task_instance.clone());
        Ok(())
    }

    async fn query_need_failover_process_instances(
        &self,
        host: Option<&str>,
    ) -> MasterResult<Vec<ProcessInstance>> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<ProcessInstance> = inner
            .process_instances
            .values()
            .filter(|pi| !pi.state.is_finished())
            .filter(|pi| match host {
                Some(h) => pi.host.as_deref() == Some(h),
                None => pi.host.is_some(),
            })
            .cloned()
            .collect();
        result.sort_by_key(|pi| pi.id);
        Ok(result)
    }

    async fn query_need_failover_task_instances(
        &self,
        host: Option<&str>,
    ) -> MasterResult<Vec<TaskInstance>> {
        let inner = self.inner.lock().unwrap();
        let mut result: Vec<TaskInstance> = inner
            .task_instances
            .values()
            .filter(|t| t.flag == Flag::Yes && !t.state.is_finished())
            .filter(|t| match host {
                Some(h) => t.host.as_deref() == Some(h),
                None => true,
            })
            .cloned()
            .collect();
        result.sort_by_key(|t| t.id);
        Ok(result)
    }

    async fn process_need_failover_process_instance(
        &self,
        process_instance: &ProcessInstance,
    ) -> MasterResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pi) = inner.process_instances.get_mut(&process_instance.id) {
            pi.host = None;
        }

        // 幂等：同一实例已有待处理的恢复指令则不再追加
        let already_pending = inner.commands.iter().any(|cmd| {
            cmd.command_type == CommandType::RecoverToleranceFaultProcess
                && CommandParams::parse(cmd.command_param.as_deref())
                    .map(|p| p.recover_process_instance_id() == Some(process_instance.id))
                    .unwrap_or(false)
        });
        if already_pending {
            return Ok(());
        }

        let mut params = CommandParams::default();
        params.set(
            CMD_PARAM_RECOVER_PROCESS_ID,
            process_instance.id.to_string(),
        );
        let mut command = Command::new(
            CommandType::RecoverToleranceFaultProcess,
            process_instance.process_definition_id,
        );
        command.command_param = Some(params.to_json()?);
        command.failure_strategy = process_instance.failure_strategy;
        command.worker_group_id = process_instance.worker_group_id;
        inner.next_command_id += 1;
        command.id = inner.next_command_id;
        inner.commands.push_back(command);
        Ok(())
    }

    async fn create_command(&self, command: &Command) -> MasterResult<Command> {
        let mut inner = self.inner.lock().unwrap();
        let mut saved = command.clone();
        if saved.id == 0 {
            inner.next_command_id += 1;
            saved.id = inner.next_command_id;
        }
        inner.commands.push_back(saved.clone());
        Ok(saved)
    }

    async fn poll_command(&self) -> MasterResult<Option<Command>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.commands.pop_front())
    }

    async fn handle_command(
        &self,
        command: &Command,
        host: &str,
    ) -> MasterResult<Option<ProcessInstance>> {
        command_handler::construct_process_instance(self, command, host).await
    }

    async fn create_recovery_waiting_thread_command(
        &self,
        _origin: Option<&Command>,
        process_instance: &ProcessInstance,
    ) -> MasterResult<()> {
        let mut params = CommandParams::default();
        params.set(
            CMD_PARAM_RECOVER_PROCESS_ID,
            process_instance.id.to_string(),
        );
        let mut command = Command::new(
            CommandType::RecoverWaitingThread,
            process_instance.process_definition_id,
        );
        command.command_param = Some(params.to_json()?);
        command.failure_strategy = process_instance.failure_strategy;
        self.create_command(&command).await?;
        Ok(())
    }
}

/// 内存任务派发队列
///
/// 高优先级先出，同优先级按入队顺序。
#[derive(Clone, Default)]
pub struct InMemoryTaskDispatchQueue {
    queue: Arc<Mutex<Vec<(u64, TaskDispatch)>>>,
    seq: Arc<Mutex<u64>>,
}

impl InMemoryTaskDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskDispatchQueue for InMemoryTaskDispatchQueue {
    async fn enqueue(&self, dispatch: TaskDispatch) -> MasterResult<()> {
        let seq = {
            let mut seq = self.seq.lock().unwrap();
            *seq += 1;
            *seq
        };
        self.queue.lock().unwrap().push((seq, dispatch));
        Ok(())
    }

    async fn take(&self) -> MasterResult<Option<TaskDispatch>> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            return Ok(None);
        }
        let best = queue
            .iter()
            .enumerate()
            .min_by_key(|(_, (seq, d))| (d.priority, *seq))
            .map(|(idx, _)| idx)
            .expect("队列非空");
        Ok(Some(queue.remove(best).1))
    }

    async fn remove(&self, task_instance_id: i64) -> MasterResult<bool> {
        let mut queue = self.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|(_, d)| d.task_instance_id != task_instance_id);
        Ok(queue.len() != before)
    }

    async fn len(&self) -> MasterResult<usize> {
        Ok(self.queue.lock().unwrap().len())
    }
}
