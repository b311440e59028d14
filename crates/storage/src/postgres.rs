//! PostgreSQL 流程存储
//!
//! 关系存储是跨 Master 的唯一事实来源，行级更新按最后写入生效；
//! 指令出队使用 `FOR UPDATE SKIP LOCKED` 保证多 Master 不重复消费。

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use flowmaster_domain::command_params::{CommandParams, CMD_PARAM_RECOVER_PROCESS_ID};
use flowmaster_domain::entities::{Command, ProcessDefinition, ProcessInstance, TaskInstance};
use flowmaster_domain::enums::{
    CommandType, ExecutionStatus, FailureStrategy, Flag, Priority, TaskDependType,
};
use flowmaster_domain::repositories::ProcessStore;
use flowmaster_errors::{MasterError, MasterResult};

use crate::command_handler;

pub struct PostgresProcessStore {
    pool: PgPool,
}

impl PostgresProcessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建立连接池并初始化表结构
    pub async fn connect(
        url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> MasterResult<Self> {
        debug!("连接 PostgreSQL: {}", url);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> MasterResult<()> {
        debug!("初始化数据库表结构");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS process_definition (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                process_definition_json TEXT NOT NULL,
                global_params TEXT,
                timeout INT NOT NULL DEFAULT 0,
                create_time TIMESTAMPTZ NOT NULL,
                update_time TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS process_instance (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                process_definition_id BIGINT NOT NULL,
                process_instance_json TEXT NOT NULL,
                state VARCHAR(64) NOT NULL,
                command_type VARCHAR(64) NOT NULL,
                command_param TEXT,
                task_depend_type VARCHAR(32) NOT NULL,
                host VARCHAR(255),
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ,
                schedule_time TIMESTAMPTZ,
                run_times INT NOT NULL DEFAULT 1,
                timeout INT NOT NULL DEFAULT 0,
                failure_strategy VARCHAR(32) NOT NULL,
                is_sub_process VARCHAR(8) NOT NULL,
                global_params TEXT,
                worker_group_id BIGINT NOT NULL DEFAULT -1,
                parent_process_instance_id BIGINT,
                parent_task_instance_id BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_instance (
                id BIGSERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                task_type VARCHAR(64) NOT NULL,
                process_definition_id BIGINT NOT NULL,
                process_instance_id BIGINT NOT NULL,
                task_json TEXT NOT NULL,
                state VARCHAR(64) NOT NULL,
                submit_time TIMESTAMPTZ,
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                host VARCHAR(255),
                retry_times INT NOT NULL DEFAULT 0,
                max_retry_times INT NOT NULL DEFAULT 0,
                retry_interval INT NOT NULL DEFAULT 0,
                flag VARCHAR(8) NOT NULL,
                alert_flag VARCHAR(8) NOT NULL,
                task_instance_priority VARCHAR(32) NOT NULL,
                worker_group_id BIGINT NOT NULL DEFAULT -1,
                app_links TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS command (
                id BIGSERIAL PRIMARY KEY,
                command_type VARCHAR(64) NOT NULL,
                process_definition_id BIGINT NOT NULL,
                command_param TEXT,
                task_depend_type VARCHAR(32) NOT NULL,
                failure_strategy VARCHAR(32) NOT NULL,
                schedule_time TIMESTAMPTZ,
                worker_group_id BIGINT NOT NULL DEFAULT -1,
                process_instance_priority VARCHAR(32) NOT NULL,
                create_time TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_process_instance_host_state ON process_instance (host, state)",
            "CREATE INDEX IF NOT EXISTS idx_task_instance_process ON task_instance (process_instance_id, flag)",
            "CREATE INDEX IF NOT EXISTS idx_task_instance_host_state ON task_instance (host, state)",
        ] {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_status(s: &str) -> MasterResult<ExecutionStatus> {
    ExecutionStatus::parse(s)
        .ok_or_else(|| MasterError::database_error(format!("非法执行状态: {s}")))
}

fn parse_flag(s: &str) -> MasterResult<Flag> {
    Flag::parse(s).ok_or_else(|| MasterError::database_error(format!("非法标记: {s}")))
}

fn parse_command_type(s: &str) -> MasterResult<CommandType> {
    CommandType::parse(s)
        .ok_or_else(|| MasterError::database_error(format!("非法指令类型: {s}")))
}

fn parse_failure_strategy(s: &str) -> MasterResult<FailureStrategy> {
    FailureStrategy::parse(s)
        .ok_or_else(|| MasterError::database_error(format!("非法失败策略: {s}")))
}

fn parse_priority(s: &str) -> MasterResult<Priority> {
    Priority::parse(s).ok_or_else(|| MasterError::database_error(format!("非法优先级: {s}")))
}

fn parse_depend_type(s: &str) -> MasterResult<TaskDependType> {
    TaskDependType::parse(s)
        .ok_or_else(|| MasterError::database_error(format!("非法依赖裁剪方式: {s}")))
}

fn map_process_definition(row: &sqlx::postgres::PgRow) -> MasterResult<ProcessDefinition> {
    Ok(ProcessDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        process_definition_json: row.try_get("process_definition_json")?,
        global_params: row.try_get("global_params")?,
        timeout: row.try_get("timeout")?,
        create_time: row.try_get("create_time")?,
        update_time: row.try_get("update_time")?,
    })
}

fn map_process_instance(row: &sqlx::postgres::PgRow) -> MasterResult<ProcessInstance> {
    Ok(ProcessInstance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        process_definition_id: row.try_get("process_definition_id")?,
        process_instance_json: row.try_get("process_instance_json")?,
        state: parse_status(row.try_get::<&str, _>("state")?)?,
        command_type: parse_command_type(row.try_get::<&str, _>("command_type")?)?,
        command_param: row.try_get("command_param")?,
        task_depend_type: parse_depend_type(row.try_get::<&str, _>("task_depend_type")?)?,
        host: row.try_get("host")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        schedule_time: row.try_get("schedule_time")?,
        run_times: row.try_get("run_times")?,
        timeout: row.try_get("timeout")?,
        failure_strategy: parse_failure_strategy(row.try_get::<&str, _>("failure_strategy")?)?,
        is_sub_process: parse_flag(row.try_get::<&str, _>("is_sub_process")?)?,
        global_params: row.try_get("global_params")?,
        worker_group_id: row.try_get("worker_group_id")?,
        parent_process_instance_id: row.try_get("parent_process_instance_id")?,
        parent_task_instance_id: row.try_get("parent_task_instance_id")?,
    })
}

fn map_task_instance(row: &sqlx::postgres::PgRow) -> MasterResult<TaskInstance> {
    Ok(TaskInstance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        task_type: row.try_get("task_type")?,
        process_definition_id: row.try_get("process_definition_id")?,
        process_instance_id: row.try_get("process_instance_id")?,
        task_json: row.try_get("task_json")?,
        state: parse_status(row.try_get::<&str, _>("state")?)?,
        submit_time: row.try_get("submit_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        host: row.try_get("host")?,
        retry_times: row.try_get("retry_times")?,
        max_retry_times: row.try_get("max_retry_times")?,
        retry_interval: row.try_get("retry_interval")?,
        flag: parse_flag(row.try_get::<&str, _>("flag")?)?,
        alert_flag: parse_flag(row.try_get::<&str, _>("alert_flag")?)?,
        task_instance_priority: parse_priority(
            row.try_get::<&str, _>("task_instance_priority")?,
        )?,
        worker_group_id: row.try_get("worker_group_id")?,
        app_links: row.try_get("app_links")?,
    })
}

fn map_command(row: &sqlx::postgres::PgRow) -> MasterResult<Command> {
    Ok(Command {
        id: row.try_get("id")?,
        command_type: parse_command_type(row.try_get::<&str, _>("command_type")?)?,
        process_definition_id: row.try_get("process_definition_id")?,
        command_param: row.try_get("command_param")?,
        task_depend_type: parse_depend_type(row.try_get::<&str, _>("task_depend_type")?)?,
        failure_strategy: parse_failure_strategy(row.try_get::<&str, _>("failure_strategy")?)?,
        schedule_time: row.try_get("schedule_time")?,
        worker_group_id: row.try_get("worker_group_id")?,
        process_instance_priority: parse_priority(
            row.try_get::<&str, _>("process_instance_priority")?,
        )?,
        create_time: row.try_get("create_time")?,
    })
}

#[async_trait]
impl ProcessStore for PostgresProcessStore {
    async fn save_process_definition(
        &self,
        definition: &ProcessDefinition,
    ) -> MasterResult<ProcessDefinition> {
        let row = sqlx::query(
            r#"
            INSERT INTO process_definition
                (name, process_definition_json, global_params, timeout, create_time, update_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.process_definition_json)
        .bind(&definition.global_params)
        .bind(definition.timeout)
        .bind(definition.create_time)
        .bind(definition.update_time)
        .fetch_one(&self.pool)
        .await?;
        map_process_definition(&row)
    }

    async fn find_process_definition_by_id(
        &self,
        id: i64,
    ) -> MasterResult<Option<ProcessDefinition>> {
        let row = sqlx::query("SELECT * FROM process_definition WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_process_definition(&r)).transpose()
    }

    async fn save_process_instance(
        &self,
        pi: &ProcessInstance,
    ) -> MasterResult<ProcessInstance> {
        let row = sqlx::query(
            r#"
            INSERT INTO process_instance
                (name, process_definition_id, process_instance_json, state, command_type,
                 command_param, task_depend_type, host, start_time, end_time, schedule_time,
                 run_times, timeout, failure_strategy, is_sub_process, global_params,
                 worker_group_id, parent_process_instance_id, parent_task_instance_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19)
            RETURNING *
            "#,
        )
        .bind(&pi.name)
        .bind(pi.process_definition_id)
        .bind(&pi.process_instance_json)
        .bind(pi.state)
        .bind(pi.command_type.as_str())
        .bind(&pi.command_param)
        .bind(pi.task_depend_type.as_str())
        .bind(&pi.host)
        .bind(pi.start_time)
        .bind(pi.end_time)
        .bind(pi.schedule_time)
        .bind(pi.run_times)
        .bind(pi.timeout)
        .bind(pi.failure_strategy.as_str())
        .bind(pi.is_sub_process)
        .bind(&pi.global_params)
        .bind(pi.worker_group_id)
        .bind(pi.parent_process_instance_id)
        .bind(pi.parent_task_instance_id)
        .fetch_one(&self.pool)
        .await?;
        map_process_instance(&row)
    }

    async fn update_process_instance(&self, pi: &ProcessInstance) -> MasterResult<()> {
        sqlx::query(
            r#"
            UPDATE process_instance SET
                name = $1, state = $2, command_type = $3, command_param = $4,
                task_depend_type = $5, host = $6, start_time = $7, end_time = $8,
                schedule_time = $9, run_times = $10, timeout = $11, failure_strategy = $12,
                global_params = $13, process_instance_json = $14
            WHERE id = $15
            "#,
        )
        .bind(&pi.name)
        .bind(pi.state)
        .bind(pi.command_type.as_str())
        .bind(&pi.command_param)
        .bind(pi.task_depend_type.as_str())
        .bind(&pi.host)
        .bind(pi.start_time)
        .bind(pi.end_time)
        .bind(pi.schedule_time)
        .bind(pi.run_times)
        .bind(pi.timeout)
        .bind(pi.failure_strategy.as_str())
        .bind(&pi.global_params)
        .bind(&pi.process_instance_json)
        .bind(pi.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_process_instance_by_id(
        &self,
        id: i64,
    ) -> MasterResult<Option<ProcessInstance>> {
        let row = sqlx::query("SELECT * FROM process_instance WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_process_instance(&r)).transpose()
    }

    async fn find_sub_process_instance(
        &self,
        parent_process_instance_id: i64,
        parent_task_instance_id: i64,
    ) -> MasterResult<Option<ProcessInstance>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM process_instance
            WHERE parent_process_instance_id = $1 AND parent_task_instance_id = $2
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(parent_process_instance_id)
        .bind(parent_task_instance_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| map_process_instance(&r)).transpose()
    }

    async fn find_valid_task_list_by_process_id(
        &self,
        process_instance_id: i64,
    ) -> MasterResult<Vec<TaskInstance>> {
        let rows = sqlx::query(
            "SELECT * FROM task_instance WHERE process_instance_id = $1 AND flag = $2 ORDER BY id",
        )
        .bind(process_instance_id)
        .bind(Flag::Yes)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task_instance).collect()
    }

    async fn find_task_instance_by_id(&self, id: i64) -> MasterResult<Option<TaskInstance>> {
        let row = sqlx::query("SELECT * FROM task_instance WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_task_instance(&r)).transpose()
    }

    async fn save_task_instance(&self, ti: &TaskInstance) -> MasterResult<TaskInstance> {
        let row = sqlx::query(
            r#"
            INSERT INTO task_instance
                (name, task_type, process_definition_id, process_instance_id, task_json,
                 state, submit_time, start_time, end_time, host, retry_times,
                 max_retry_times, retry_interval, flag, alert_flag, task_instance_priority,
                 worker_group_id, app_links)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18)
            RETURNING *
            "#,
        )
        .bind(&ti.name)
        .bind(&ti.task_type)
        .bind(ti.process_definition_id)
        .bind(ti.process_instance_id)
        .bind(&ti.task_json)
        .bind(ti.state)
        .bind(ti.submit_time)
        .bind(ti.start_time)
        .bind(ti.end_time)
        .bind(&ti.host)
        .bind(ti.retry_times)
        .bind(ti.max_retry_times)
        .bind(ti.retry_interval)
        .bind(ti.flag)
        .bind(ti.alert_flag)
        .bind(ti.task_instance_priority.as_str())
        .bind(ti.worker_group_id)
        .bind(&ti.app_links)
        .fetch_one(&self.pool)
        .await?;
        map_task_instance(&row)
    }

    async fn update_task_instance(&self, ti: &TaskInstance) -> MasterResult<()> {
        sqlx::query(
            r#"
            UPDATE task_instance SET
                state = $1, submit_time = $2, start_time = $3, end_time = $4, host = $5,
                retry_times = $6, flag = $7, alert_flag = $8, app_links = $9
            WHERE id = $10
            "#,
        )
        .bind(ti.state)
        .bind(ti.submit_time)
        .bind(ti.start_time)
        .bind(ti.end_time)
        .bind(&ti.host)
        .bind(ti.retry_times)
        .bind(ti.flag)
        .bind(ti.alert_flag)
        .bind(&ti.app_links)
        .bind(ti.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_need_failover_process_instances(
        &self,
        host: Option<&str>,
    ) -> MasterResult<Vec<ProcessInstance>> {
        let sql = match host {
            Some(_) => {
                "SELECT * FROM process_instance
                 WHERE host = $1
                   AND state NOT IN ('SUCCESS','FAILURE','KILL','STOP','PAUSE','WAITING_THREAD')
                 ORDER BY id"
            }
            None => {
                "SELECT * FROM process_instance
                 WHERE host IS NOT NULL
                   AND state NOT IN ('SUCCESS','FAILURE','KILL','STOP','PAUSE','WAITING_THREAD')
                 ORDER BY id"
            }
        };
        let mut query = sqlx::query(sql);
        if let Some(h) = host {
            query = query.bind(h);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(map_process_instance).collect()
    }

    async fn query_need_failover_task_instances(
        &self,
        host: Option<&str>,
    ) -> MasterResult<Vec<TaskInstance>> {
        let sql = match host {
            Some(_) => {
                "SELECT * FROM task_instance
                 WHERE flag = 'YES' AND host = $1
                   AND state NOT IN ('SUCCESS','FAILURE','NEED_FAULT_TOLERANCE','KILL','STOP','PAUSE','WAITING_THREAD')
                 ORDER BY id"
            }
            None => {
                "SELECT * FROM task_instance
                 WHERE flag = 'YES'
                   AND state NOT IN ('SUCCESS','FAILURE','NEED_FAULT_TOLERANCE','KILL','STOP','PAUSE','WAITING_THREAD')
                 ORDER BY id"
            }
        };
        let mut query = sqlx::query(sql);
        if let Some(h) = host {
            query = query.bind(h);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(map_task_instance).collect()
    }

    async fn process_need_failover_process_instance(
        &self,
        pi: &ProcessInstance,
    ) -> MasterResult<()> {
        sqlx::query("UPDATE process_instance SET host = NULL WHERE id = $1")
            .bind(pi.id)
            .execute(&self.pool)
            .await?;

        // 幂等：同一实例已有待处理的恢复指令则不再追加
        let pattern = format!("%\"{}\":\"{}\"%", CMD_PARAM_RECOVER_PROCESS_ID, pi.id);
        let existing = sqlx::query(
            "SELECT id FROM command WHERE command_type = $1 AND command_param LIKE $2 LIMIT 1",
        )
        .bind(CommandType::RecoverToleranceFaultProcess.as_str())
        .bind(&pattern)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(());
        }

        let mut params = CommandParams::default();
        params.set(CMD_PARAM_RECOVER_PROCESS_ID, pi.id.to_string());
        let mut command = Command::new(
            CommandType::RecoverToleranceFaultProcess,
            pi.process_definition_id,
        );
        command.command_param = Some(params.to_json()?);
        command.failure_strategy = pi.failure_strategy;
        command.worker_group_id = pi.worker_group_id;
        self.create_command(&command).await?;
        Ok(())
    }

    async fn create_command(&self, command: &Command) -> MasterResult<Command> {
        let row = sqlx::query(
            r#"
            INSERT INTO command
                (command_type, process_definition_id, command_param, task_depend_type,
                 failure_strategy, schedule_time, worker_group_id, process_instance_priority,
                 create_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(command.command_type.as_str())
        .bind(command.process_definition_id)
        .bind(&command.command_param)
        .bind(command.task_depend_type.as_str())
        .bind(command.failure_strategy.as_str())
        .bind(command.schedule_time)
        .bind(command.worker_group_id)
        .bind(command.process_instance_priority.as_str())
        .bind(command.create_time)
        .fetch_one(&self.pool)
        .await?;
        map_command(&row)
    }

    async fn poll_command(&self) -> MasterResult<Option<Command>> {
        let row = sqlx::query(
            r#"
            DELETE FROM command
            WHERE id = (
                SELECT id FROM command ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| map_command(&r)).transpose()
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
        pi: &ProcessInstance,
    ) -> MasterResult<()> {
        let mut params = CommandParams::default();
        params.set(CMD_PARAM_RECOVER_PROCESS_ID, pi.id.to_string());
        let mut command = Command::new(
            CommandType::RecoverWaitingThread,
            pi.process_definition_id,
        );
        command.command_param = Some(params.to_json()?);
        command.failure_strategy = pi.failure_strategy;
        self.create_command(&command).await?;
        Ok(())
    }
}
