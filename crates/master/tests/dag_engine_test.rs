//! DAG 执行引擎集成测试
//!
//! 内存存储 + Worker 模拟器驱动完整引擎主循环。

mod common;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use flowmaster_domain::enums::{CommandType, ExecutionStatus, FailureStrategy, Flag};
use flowmaster_domain::repositories::{ProcessStore, TaskDispatchQueue};
use flowmaster_master::alerter::AlertRecord;

use common::*;

#[tokio::test]
async fn test_linear_dag_success() {
    // S1: A -> B -> C 全部一次成功
    let ctx = TestContext::new();
    let json = definition_json(&[
        ("A", &[], 0, 0),
        ("B", &["A"], 0, 0),
        ("C", &["B"], 0, 0),
    ]);
    let definition = seed_definition(&ctx.store, &json).await;
    let instance = claim_instance(
        &ctx.store,
        definition.id,
        CommandType::StartProcess,
        None,
        FailureStrategy::Continue,
    )
    .await;

    let worker = spawn_worker(
        ctx.store.clone(),
        ctx.queue.clone(),
        WORKER_HOST,
        &[],
    );
    let state = tokio::time::timeout(Duration::from_secs(20), ctx.engine(instance.clone()).run())
        .await
        .expect("引擎执行超时");
    worker.shutdown().await;

    assert_eq!(state, ExecutionStatus::Success);

    let reloaded = ctx
        .store
        .find_process_instance_by_id(instance.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.state, ExecutionStatus::Success);
    assert!(reloaded.end_time.is_some());

    let tasks = ctx
        .store
        .find_valid_task_list_by_process_id(instance.id)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert_eq!(task.state, ExecutionStatus::Success);
        assert!(task.end_time.is_some());
    }
    // 依赖顺序：A 先于 B，B 先于 C 开始
    let start = |name: &str| {
        tasks
            .iter()
            .find(|t| t.name == name)
            .unwrap()
            .submit_time
            .unwrap()
    };
    assert!(start("A") <= start("B"));
    assert!(start("B") <= start("C"));
}

#[tokio::test]
async fn test_retry_until_success() {
    // S2: A 失败两次后成功，产生三个任务实例
    let ctx = TestContext::new();
    let json = definition_json(&[("A", &[], 2, 0)]);
    let definition = seed_definition(&ctx.store, &json).await;
    let instance = claim_instance(
        &ctx.store,
        definition.id,
        CommandType::StartProcess,
        None,
        FailureStrategy::Continue,
    )
    .await;

    let worker = spawn_worker(
        ctx.store.clone(),
        ctx.queue.clone(),
        WORKER_HOST,
        &[(
            "A",
            &[
                Outcome::Finish(ExecutionStatus::Failure),
                Outcome::Finish(ExecutionStatus::Failure),
            ],
        )],
    );
    let state = tokio::time::timeout(Duration::from_secs(20), ctx.engine(instance.clone()).run())
        .await
        .expect("引擎执行超时");
    worker.shutdown().await;

    assert_eq!(state, ExecutionStatus::Success);

    let all = ctx.store.all_task_instances();
    assert_eq!(all.len(), 3);
    let flags: Vec<Flag> = all.iter().map(|t| t.flag).collect();
    assert_eq!(flags, vec![Flag::No, Flag::No, Flag::Yes]);

    // flag=YES 的实例重试次数为 2，且每个节点名只有一条有效实例
    let valid = ctx
        .store
        .find_valid_task_list_by_process_id(instance.id)
        .await
        .unwrap();
    assert_eq!(valid.len(), 1);
    assert_eq!(valid[0].retry_times, 2);
    assert_eq!(valid[0].state, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_dep_failure_end_strategy() {
    // S3: 菱形 DAG，END 策略下 B 失败终止流程，D 不再派发
    let ctx = TestContext::new();
    let json = definition_json(&[
        ("A", &[], 0, 0),
        ("B", &["A"], 0, 0),
        ("C", &["A"], 0, 0),
        ("D", &["B", "C"], 0, 0),
    ]);
    let definition = seed_definition(&ctx.store, &json).await;
    let instance = claim_instance(
        &ctx.store,
        definition.id,
        CommandType::StartProcess,
        None,
        FailureStrategy::End,
    )
    .await;

    let worker = spawn_worker(
        ctx.store.clone(),
        ctx.queue.clone(),
        WORKER_HOST,
        &[("B", &[Outcome::Finish(ExecutionStatus::Failure)])],
    );
    let state = tokio::time::timeout(Duration::from_secs(20), ctx.engine(instance.clone()).run())
        .await
        .expect("引擎执行超时");
    worker.shutdown().await;

    assert_eq!(state, ExecutionStatus::Failure);

    let tasks = ctx
        .store
        .find_valid_task_list_by_process_id(instance.id)
        .await
        .unwrap();
    // D 从未生成任务实例
    assert!(tasks.iter().all(|t| t.name != "D"));
    let b = tasks.iter().find(|t| t.name == "B").unwrap();
    assert_eq!(b.state, ExecutionStatus::Failure);
    // C 若已派发则到达某个终态（成功或被终止）
    if let Some(c) = tasks.iter().find(|t| t.name == "C") {
        assert!(c.state.is_finished());
    }
}

#[tokio::test]
async fn test_dep_failure_continue_strategy() {
    // S4: CONTINUE 策略下 C 分支照常成功，D 因父失败永不派发
    let ctx = TestContext::new();
    let json = definition_json(&[
        ("A", &[], 0, 0),
        ("B", &["A"], 0, 0),
        ("C", &["A"], 0, 0),
        ("D", &["B", "C"], 0, 0),
    ]);
    let definition = seed_definition(&ctx.store, &json).await;
    let instance = claim_instance(
        &ctx.store,
        definition.id,
        CommandType::StartProcess,
        None,
        FailureStrategy::Continue,
    )
    .await;

    let worker = spawn_worker(
        ctx.store.clone(),
        ctx.queue.clone(),
        WORKER_HOST,
        &[("B", &[Outcome::Finish(ExecutionStatus::Failure)])],
    );
    let state = tokio::time::timeout(Duration::from_secs(20), ctx.engine(instance.clone()).run())
        .await
        .expect("引擎执行超时");
    worker.shutdown().await;

    assert_eq!(state, ExecutionStatus::Failure);

    let tasks = ctx
        .store
        .find_valid_task_list_by_process_id(instance.id)
        .await
        .unwrap();
    let c = tasks.iter().find(|t| t.name == "C").expect("C 应当执行");
    assert_eq!(c.state, ExecutionStatus::Success);
    assert!(tasks.iter().all(|t| t.name != "D"));
}

#[tokio::test]
async fn test_pause_and_resume() {
    // S6: A 运行中下达暂停；A 成功后 B 停在待提交队列，流程收敛为 PAUSE；
    // 恢复后新一轮执行派发 B 并成功。
    let ctx = TestContext::new();
    let json = definition_json(&[("A", &[], 0, 0), ("B", &["A"], 0, 0)]);
    let definition = seed_definition(&ctx.store, &json).await;
    let instance = claim_instance(
        &ctx.store,
        definition.id,
        CommandType::StartProcess,
        None,
        FailureStrategy::Continue,
    )
    .await;

    // A 挂起，完成时机由测试控制
    let worker = spawn_worker(
        ctx.store.clone(),
        ctx.queue.clone(),
        WORKER_HOST,
        &[("A", &[Outcome::Hang])],
    );

    let engine = ctx.engine(instance.clone());
    let engine_handle = tokio::spawn(engine.run());

    // 等 A 进入运行中
    let store = ctx.store.clone();
    let instance_id = instance.id;
    wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .find_valid_task_list_by_process_id(instance_id)
                .await
                .unwrap()
                .iter()
                .any(|t| t.name == "A" && t.state == ExecutionStatus::RunningExecution)
        }
    })
    .await;

    // 用户下达暂停
    let mut pi = ctx
        .store
        .find_process_instance_by_id(instance.id)
        .await
        .unwrap()
        .unwrap();
    pi.state = ExecutionStatus::ReadyPause;
    ctx.store.update_process_instance(&pi).await.unwrap();

    // 留几个节拍让引擎观察到预备暂停，再让 A 成功
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut a = ctx
        .store
        .find_valid_task_list_by_process_id(instance.id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name == "A")
        .unwrap();
    a.state = ExecutionStatus::Success;
    a.end_time = Some(Utc::now());
    ctx.store.update_task_instance(&a).await.unwrap();

    let state = tokio::time::timeout(Duration::from_secs(20), engine_handle)
        .await
        .expect("引擎执行超时")
        .unwrap();
    worker.shutdown().await;
    assert_eq!(state, ExecutionStatus::Pause);

    // B 未被派发
    let tasks = ctx
        .store
        .find_valid_task_list_by_process_id(instance.id)
        .await
        .unwrap();
    assert!(tasks.iter().all(|t| t.name != "B"));
    assert_eq!(ctx.queue.len().await.unwrap(), 0);

    // 恢复：状态复位后重新执行
    let mut pi = ctx
        .store
        .find_process_instance_by_id(instance.id)
        .await
        .unwrap()
        .unwrap();
    pi.state = ExecutionStatus::RunningExecution;
    pi.end_time = None;
    ctx.store.update_process_instance(&pi).await.unwrap();

    let worker = spawn_worker(ctx.store.clone(), ctx.queue.clone(), WORKER_HOST, &[]);
    let state = tokio::time::timeout(Duration::from_secs(20), ctx.engine(pi).run())
        .await
        .expect("引擎执行超时");
    worker.shutdown().await;

    assert_eq!(state, ExecutionStatus::Success);
    let tasks = ctx
        .store
        .find_valid_task_list_by_process_id(instance.id)
        .await
        .unwrap();
    let b = tasks.iter().find(|t| t.name == "B").expect("恢复后应执行 B");
    assert_eq!(b.state, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_complement_date_range() {
    // S7: 补数 2024-01-01 至 2024-01-03，逐日执行三轮
    let ctx = TestContext::new();
    let json = definition_json(&[("A", &[], 0, 0)]);
    let definition = seed_definition(&ctx.store, &json).await;
    let command_param = serde_json::json!({
        "complementStartDate": "2024-01-01",
        "complementEndDate": "2024-01-03",
    })
    .to_string();
    let instance = claim_instance(
        &ctx.store,
        definition.id,
        CommandType::ComplementData,
        Some(command_param),
        FailureStrategy::Continue,
    )
    .await;
    assert_eq!(
        instance
            .schedule_time
            .unwrap()
            .format("%Y-%m-%d")
            .to_string(),
        "2024-01-01"
    );

    let worker = spawn_worker(ctx.store.clone(), ctx.queue.clone(), WORKER_HOST, &[]);
    let state = tokio::time::timeout(Duration::from_secs(30), ctx.engine(instance.clone()).run())
        .await
        .expect("引擎执行超时");
    worker.shutdown().await;

    assert_eq!(state, ExecutionStatus::Success);

    let reloaded = ctx
        .store
        .find_process_instance_by_id(instance.id)
        .await
        .unwrap()
        .unwrap();
    // 调度日期单调推进到结束日期
    assert_eq!(
        reloaded
            .schedule_time
            .unwrap()
            .format("%Y-%m-%d")
            .to_string(),
        "2024-01-03"
    );
    assert_eq!(reloaded.state, ExecutionStatus::Success);

    // 每个逻辑日期一轮执行，旧轮次实例翻为 NO
    let all = ctx.store.all_task_instances();
    assert_eq!(all.len(), 3);
    assert_eq!(all.iter().filter(|t| t.flag == Flag::No).count(), 2);
    assert_eq!(all.iter().filter(|t| t.flag == Flag::Yes).count(), 1);
}

#[tokio::test]
async fn test_process_timeout_alert_sent_once() {
    // 超时告警只发一次，且不强制终止任务
    let ctx = TestContext::new();
    let json = definition_json(&[("A", &[], 0, 0)]);
    let definition = seed_definition(&ctx.store, &json).await;
    let mut instance = claim_instance(
        &ctx.store,
        definition.id,
        CommandType::StartProcess,
        None,
        FailureStrategy::Continue,
    )
    .await;
    instance.timeout = 1;
    instance.start_time = Utc::now() - ChronoDuration::minutes(2);
    ctx.store.update_process_instance(&instance).await.unwrap();

    let worker = spawn_worker(ctx.store.clone(), ctx.queue.clone(), WORKER_HOST, &[]);
    let state = tokio::time::timeout(Duration::from_secs(20), ctx.engine(instance.clone()).run())
        .await
        .expect("引擎执行超时");
    worker.shutdown().await;

    assert_eq!(state, ExecutionStatus::Success);
    let timeout_alerts = ctx
        .alerter
        .records()
        .into_iter()
        .filter(|r| matches!(r, AlertRecord::ProcessTimeout { .. }))
        .count();
    assert_eq!(timeout_alerts, 1);
}
