//! 指令消费
//!
//! 把一条指令变成可执行的流程实例：新建指令从流程定义构造新实例，
//! 恢复类指令重建既有实例并写入恢复起始节点；PAUSE/STOP 指令只改写
//! 目标实例状态，不产生可执行实例。所有路径都以给定 host 完成认领。

use chrono::Utc;
use tracing::{info, warn};

use flowmaster_domain::command_params::{CommandParams, CMD_PARAM_RECOVER_PROCESS_ID};
use flowmaster_domain::entities::{Command, ProcessInstance};
use flowmaster_domain::enums::{CommandType, ExecutionStatus, Flag};
use flowmaster_domain::repositories::ProcessStore;
use flowmaster_errors::MasterResult;

/// 消费指令，返回需要调度执行的流程实例
pub async fn construct_process_instance(
    store: &dyn ProcessStore,
    command: &Command,
    host: &str,
) -> MasterResult<Option<ProcessInstance>> {
    match command.command_type {
        CommandType::Pause => transition_instance(store, command, ExecutionStatus::ReadyPause).await,
        CommandType::Stop => transition_instance(store, command, ExecutionStatus::ReadyStop).await,
        t if t.is_recovery() => recover_instance(store, command, host).await,
        _ => start_instance(store, command, host).await,
    }
}

/// 新建流程实例
async fn start_instance(
    store: &dyn ProcessStore,
    command: &Command,
    host: &str,
) -> MasterResult<Option<ProcessInstance>> {
    let definition = match store
        .find_process_definition_by_id(command.process_definition_id)
        .await?
    {
        Some(definition) => definition,
        None => {
            warn!(
                "指令 {} 引用的流程定义 {} 不存在，忽略",
                command.id, command.process_definition_id
            );
            return Ok(None);
        }
    };

    let params = CommandParams::parse(command.command_param.as_deref())?;
    let mut instance = ProcessInstance::new(&definition, command.command_type);
    instance.command_param = command.command_param.clone();
    instance.task_depend_type = command.task_depend_type;
    instance.failure_strategy = command.failure_strategy;
    instance.worker_group_id = command.worker_group_id;
    instance.schedule_time = command.schedule_time;
    instance.state = ExecutionStatus::RunningExecution;
    instance.host = Some(host.to_string());
    instance.start_time = Utc::now();

    // 补数模式以起始日期作为首个调度时间
    if command.command_type == CommandType::ComplementData && instance.schedule_time.is_none() {
        instance.schedule_time = params.complement_start_date();
    }

    // 子流程通过父实例参数回溯
    if let (Some(parent_process), Some(parent_task)) = (
        params.parent_process_instance_id(),
        params.parent_task_instance_id(),
    ) {
        instance.is_sub_process = Flag::Yes;
        instance.parent_process_instance_id = Some(parent_process);
        instance.parent_task_instance_id = Some(parent_task);
    }

    let saved = store.save_process_instance(&instance).await?;
    info!(
        "指令 {} 创建流程实例 {} (定义 {})",
        command.id, saved.id, definition.id
    );
    Ok(Some(saved))
}

/// 恢复既有流程实例
async fn recover_instance(
    store: &dyn ProcessStore,
    command: &Command,
    host: &str,
) -> MasterResult<Option<ProcessInstance>> {
    let mut params = CommandParams::parse(command.command_param.as_deref())?;
    let instance_id = match params.recover_process_instance_id() {
        Some(id) => id,
        None => {
            warn!("恢复指令 {} 缺少流程实例 id，忽略", command.id);
            return Ok(None);
        }
    };
    let mut instance = match store.find_process_instance_by_id(instance_id).await? {
        Some(instance) => instance,
        None => {
            warn!("恢复指令 {} 指向的流程实例 {} 不存在，忽略", command.id, instance_id);
            return Ok(None);
        }
    };

    let tasks = store.find_valid_task_list_by_process_id(instance_id).await?;
    let recovery_ids: Vec<i64> = match command.command_type {
        // 失败重跑：从失败节点续起
        CommandType::StartFailureTaskProcess => tasks
            .iter()
            .filter(|t| t.state.is_failure())
            .map(|t| t.id)
            .collect(),
        // 暂停恢复：从暂停/被杀节点续起
        CommandType::RecoverSuspendedProcess => tasks
            .iter()
            .filter(|t| t.state.is_pause() || t.state == ExecutionStatus::Kill)
            .map(|t| t.id)
            .collect(),
        // 容错恢复：运行中与容错态节点都要重新接管
        CommandType::RecoverToleranceFaultProcess => tasks
            .iter()
            .filter(|t| {
                !t.state.is_finished() || t.state == ExecutionStatus::NeedFaultTolerance
            })
            .map(|t| t.id)
            .collect(),
        // 整体重跑：旧任务实例全部作废
        CommandType::RepeatRunning => {
            for task in &tasks {
                let mut stale = task.clone();
                stale.flag = Flag::No;
                store.update_task_instance(&stale).await?;
            }
            Vec::new()
        }
        _ => Vec::new(),
    };

    if !recovery_ids.is_empty() {
        params.set_recovery_start_node_ids(&recovery_ids);
    }
    params.remove(CMD_PARAM_RECOVER_PROCESS_ID);

    instance.command_type = command.command_type;
    instance.command_param = if params.is_empty() {
        None
    } else {
        Some(params.to_json()?)
    };
    instance.state = ExecutionStatus::RunningExecution;
    instance.host = Some(host.to_string());
    instance.end_time = None;
    instance.run_times += 1;
    store.update_process_instance(&instance).await?;

    info!(
        "指令 {} 恢复流程实例 {}，恢复节点 {:?}",
        command.id, instance.id, recovery_ids
    );
    Ok(Some(instance))
}

/// PAUSE/STOP：只迁移目标实例状态
async fn transition_instance(
    store: &dyn ProcessStore,
    command: &Command,
    target: ExecutionStatus,
) -> MasterResult<Option<ProcessInstance>> {
    let params = CommandParams::parse(command.command_param.as_deref())?;
    let instance_id = match params.recover_process_instance_id() {
        Some(id) => id,
        None => {
            warn!("控制指令 {} 缺少流程实例 id，忽略", command.id);
            return Ok(None);
        }
    };
    let mut instance = match store.find_process_instance_by_id(instance_id).await? {
        Some(instance) => instance,
        None => {
            warn!("控制指令 {} 指向的流程实例 {} 不存在，忽略", command.id, instance_id);
            return Ok(None);
        }
    };
    if instance.state.is_finished() {
        info!("流程实例 {} 已结束，忽略 {:?} 指令", instance_id, target);
        return Ok(None);
    }
    instance.state = target;
    store.update_process_instance(&instance).await?;
    info!("流程实例 {} 状态迁移为 {:?}", instance_id, target);
    Ok(None)
}
