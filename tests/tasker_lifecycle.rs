//! Integration tests for the Tasker manager.
//!
//! Each test starts a manager over an in-process module registry and drives
//! it only through the public `Tasker` handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;

use tasker::error::{ErrorKind, ThrownError};
use tasker::modules::{ExportTable, LocalResolver, builtin, param};
use tasker::{CancelOutcome, ModuleRegistry, Task, TaskId, TaskResult, Tasker, TaskerConfig};

/// Maximum time any task is allowed to take before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Panic payload whose own drop panics, taking the context thread down
/// after the export's panic has been caught.
struct Bomb;

impl Drop for Bomb {
    fn drop(&mut self) {
        panic!("panic payload exploded while being dropped");
    }
}

fn detonate() -> anyhow::Result<Value> {
    std::panic::panic_any(Bomb)
}

fn fixtures() -> ExportTable {
    ExportTable::new()
        .async_function("echo", |args| async move {
            Ok::<_, anyhow::Error>(args.into_iter().next().unwrap_or(Value::Null))
        })
        .async_function("nap", |args| async move {
            let ms: u64 = param(&args, 0)?;
            let tag: Value = param(&args, 1).unwrap_or(Value::Null);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, anyhow::Error>(tag)
        })
        .async_function("hang", |_args| async move {
            futures::future::pending::<()>().await;
            Ok::<_, anyhow::Error>(Value::Null)
        })
        .async_function("crash", |_args| async move { detonate() })
        .function("reject", |args| {
            let reason: String = param(&args, 0)?;
            Err(ThrownError::new("TypeError", reason).into())
        })
}

fn start(config: TaskerConfig) -> Tasker {
    let registry = Arc::new(ModuleRegistry::new("/srv/app"));
    registry.register_builtin("./fixtures", Arc::new(fixtures()));
    builtin::register(&registry);
    Tasker::start(config, Arc::new(LocalResolver::new(registry))).unwrap()
}

fn submit(tasker: &Tasker, task: Task) -> (TaskId, oneshot::Receiver<TaskResult>) {
    let (tx, rx) = oneshot::channel();
    let id = tasker.run(task, move |result| {
        let _ = tx.send(result);
    });
    (id, rx)
}

async fn settle(rx: oneshot::Receiver<TaskResult>) -> TaskResult {
    timeout(TEST_TIMEOUT, rx)
        .await
        .expect("task did not settle in time")
        .expect("callback was dropped without being called")
}

fn nap(ms: u64, tag: Value) -> Task {
    Task::new("fixtures", "nap").args([json!(ms), tag])
}

#[tokio::test]
async fn single_context_completes_in_dispatch_order() {
    let tasker = start(TaskerConfig::default().with_max_contexts(1));

    // Later tasks are faster, so any overlap would reorder completions.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for i in 0..5u64 {
        let tx = tx.clone();
        tasker.run(nap(50 - i * 10, json!(i)), move |result| {
            let _ = tx.send(result.unwrap());
        });
    }

    let mut order = Vec::new();
    for _ in 0..5 {
        order.push(timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(order, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn every_task_settles_exactly_once() {
    let tasker = start(TaskerConfig::default().with_max_contexts(3));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut receivers = Vec::new();

    for i in 0..12 {
        let task = if i % 3 == 0 {
            Task::new("fixtures", "reject").args([json!("odd one out")])
        } else {
            Task::new("fixtures", "echo").args([json!(i)])
        };
        let calls = calls.clone();
        let (tx, rx) = oneshot::channel();
        tasker.run(task, move |result| {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });
        receivers.push((i, rx));
    }

    for (i, rx) in receivers {
        match settle(rx).await {
            Ok(value) => {
                assert_ne!(i % 3, 0);
                assert_eq!(value, json!(i));
            }
            Err(e) => {
                assert_eq!(i % 3, 0);
                assert_eq!(e.kind(), ErrorKind::Execution);
                assert_eq!(e.name(), "TypeError");
                assert_eq!(e.message(), "odd one out");
            }
        }
    }

    let report = tasker.shutdown().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 12);
    assert_eq!(report.completed, 8);
    assert_eq!(report.failed, 4);
}

#[tokio::test]
async fn repeated_calls_are_idempotent() {
    let tasker = start(TaskerConfig::default());
    let task = Task::new("std/math", "multiply").args([json!(6), json!(7)]);

    let first = tasker.call(task.clone()).await.unwrap();
    let second = tasker.call(task).await.unwrap();
    assert_eq!(first, json!(42.0));
    assert_eq!(first, second);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn parameters_round_trip_unchanged() {
    let tasker = start(TaskerConfig::default());
    let value = json!({
        "name": "payload",
        "list": [1, -2.5, "three", null, true, {"deep": [[[]]]}],
        "unicode": "ünïcødé ✓",
        "empty": {}
    });

    let echoed = tasker
        .call(Task::new("./fixtures", "echo").args([value.clone()]))
        .await
        .unwrap();
    assert_eq!(echoed, value);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn timeout_fails_task_and_discards_context() {
    let tasker = start(TaskerConfig::default().with_max_contexts(1));

    let began = Instant::now();
    let err = tasker
        .call(Task::new("fixtures", "hang").with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TaskTimeout);
    assert!(began.elapsed() >= Duration::from_millis(50));
    assert!(began.elapsed() < Duration::from_secs(2));

    let stats = tasker.stats().await.unwrap();
    assert_eq!(stats.live_contexts, 0);
    assert_eq!(stats.idle_contexts, 0);

    // A fresh context serves the next task.
    let value = tasker.call(Task::new("fixtures", "echo").args([json!("after")])).await.unwrap();
    assert_eq!(value, json!("after"));
    assert_eq!(tasker.stats().await.unwrap().live_contexts, 1);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn default_timeout_applies_without_task_timeout() {
    let tasker = start(
        TaskerConfig::default()
            .with_max_contexts(1)
            .with_default_timeout(Duration::from_millis(40)),
    );

    let err = tasker.call(Task::new("fixtures", "hang")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TaskTimeout);

    // A per-task timeout overrides the default.
    let value = tasker
        .call(nap(80, json!("slow but allowed")).with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(value, json!("slow but allowed"));

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_tasks_respect_context_limit() {
    let tasker = start(TaskerConfig::default().with_max_contexts(2));

    let began = Instant::now();
    let receivers: Vec<_> = (0..5)
        .map(|i| submit(&tasker, nap(100, json!(i))).1)
        .collect();
    for rx in receivers {
        settle(rx).await.unwrap();
    }
    let elapsed = began.elapsed();

    // Five 100ms tasks on two contexts need three rounds.
    assert!(elapsed >= Duration::from_millis(300), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "finished too slow: {elapsed:?}");

    let stats = tasker.stats().await.unwrap();
    assert_eq!(stats.peak_busy, 2);
    assert!(stats.live_contexts <= 2);
    assert_eq!(stats.completed, 5);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn unresolvable_module_fails() {
    let tasker = start(TaskerConfig::default());
    let err = tasker
        .call(Task::new("does-not-exist.module", "fn"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModuleResolution);
    assert!(err.message().contains("does-not-exist.module"));
    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_export_fails() {
    let tasker = start(TaskerConfig::default());

    let err = tasker.call(Task::new("std/math", "nonexistent")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExportNotFound);

    let err = tasker.call(Task::new("std/math", "PI")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExportNotFound);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn context_crash_fails_task_and_is_replaced() {
    let tasker = start(TaskerConfig::default().with_max_contexts(1));

    let err = timeout(TEST_TIMEOUT, tasker.call(Task::new("fixtures", "crash")))
        .await
        .expect("crashed task did not settle")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextTerminated);
    assert!(err.message().contains("crashed"), "unexpected message: {}", err.message());

    let stats = tasker.stats().await.unwrap();
    assert_eq!(stats.live_contexts, 0);
    assert_eq!(stats.busy_contexts, 0);

    // The pool spawns a fresh context for the next task.
    let value = tasker.call(Task::new("fixtures", "echo").args([json!(1)])).await.unwrap();
    assert_eq!(value, json!(1));
    assert_eq!(tasker.stats().await.unwrap().live_contexts, 1);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_queued_and_running_tasks() {
    let tasker = start(TaskerConfig::default().with_max_contexts(1));

    let (running_id, running_rx) = submit(&tasker, Task::new("fixtures", "hang"));
    let (queued_id, queued_rx) = submit(&tasker, Task::new("fixtures", "echo").args([json!(1)]));

    assert_eq!(tasker.cancel(queued_id).await, CancelOutcome::Dequeued);
    let err = settle(queued_rx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TaskCancelled);

    assert_eq!(tasker.cancel(running_id).await, CancelOutcome::Terminating);
    let err = settle(running_rx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContextTerminated);

    // Both are gone now.
    assert_eq!(tasker.cancel(running_id).await, CancelOutcome::NotFound);
    assert_eq!(tasker.cancel(queued_id).await, CancelOutcome::NotFound);
    assert_eq!(tasker.stats().await.unwrap().live_contexts, 0);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_lets_running_tasks_finish_and_cancels_queued() {
    let tasker = start(TaskerConfig::default().with_max_contexts(1));

    let (_, running_rx) = submit(&tasker, nap(100, json!("done")));
    let (_, queued_rx) = submit(&tasker, nap(10, json!("never")));

    let report = tasker.shutdown_with_grace(Duration::from_secs(2)).await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.terminated, 0);
    assert_eq!(report.contexts_joined, 1);

    assert_eq!(settle(running_rx).await.unwrap(), json!("done"));
    assert_eq!(settle(queued_rx).await.unwrap_err().kind(), ErrorKind::TaskCancelled);

    let err = tasker.call(Task::new("fixtures", "echo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rejected);
}

#[tokio::test]
async fn shutdown_terminates_stragglers_after_grace() {
    let tasker = start(TaskerConfig::default().with_max_contexts(2));

    let (_, first) = submit(&tasker, Task::new("fixtures", "hang"));
    let (_, second) = submit(&tasker, Task::new("fixtures", "hang"));

    let began = Instant::now();
    let report = tasker.shutdown_with_grace(Duration::from_millis(50)).await.unwrap();
    assert!(began.elapsed() < Duration::from_secs(2));
    assert_eq!(report.terminated, 2);

    assert_eq!(settle(first).await.unwrap_err().kind(), ErrorKind::ContextTerminated);
    assert_eq!(settle(second).await.unwrap_err().kind(), ErrorKind::ContextTerminated);
}

#[tokio::test]
async fn unsendable_parameters_fail_before_queueing() {
    let tasker = start(TaskerConfig::default());

    let mut nested = json!(0);
    for _ in 0..100 {
        nested = json!([nested]);
    }

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    tasker.run(Task::new("fixtures", "echo").args([nested]), move |result| {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Serialization);
        flag.store(true, Ordering::SeqCst);
    });
    // Reported before `run` returned.
    assert!(called.load(Ordering::SeqCst));

    let stats = tasker.stats().await.unwrap();
    assert_eq!(stats.queued_tasks, 0);
    assert_eq!(stats.live_contexts, 0);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn oversized_message_is_a_serialization_failure() {
    let mut config = TaskerConfig::default();
    config.max_message_bytes = 256;
    let tasker = start(config);

    let err = tasker
        .call(Task::new("fixtures", "echo").args([json!("x".repeat(1024))]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Serialization);

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn contexts_are_discarded_when_reuse_is_off() {
    let tasker = start(TaskerConfig::default().with_context_reuse(false));

    for i in 0..3 {
        let value = tasker
            .call(Task::new("std/text", "concat").args([json!("run-"), json!(i)]))
            .await
            .unwrap();
        assert_eq!(value, json!(format!("run-{i}")));

        let stats = tasker.stats().await.unwrap();
        assert_eq!(stats.live_contexts, 0);
        assert_eq!(stats.idle_contexts, 0);
    }

    tasker.shutdown().await.unwrap();
}

#[tokio::test]
async fn detached_tasks_run() {
    let tasker = start(TaskerConfig::default().with_max_contexts(1));

    tasker.run_detached(Task::new("fixtures", "echo").args([json!("fire and forget")]));
    // Same context, so this completes after the detached task.
    tasker.call(Task::new("fixtures", "echo")).await.unwrap();

    assert_eq!(tasker.stats().await.unwrap().completed, 2);
    tasker.shutdown().await.unwrap();
}
