use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use taskq::{Config, Driver, Payload, Queue, QueueError, RawBody, Result, Task};
use tokio_util::sync::CancellationToken;

/// Task whose behavior is scripted per attempt: panic first, then fail,
/// then succeed, optionally holding the worker for `busy_for` while
/// ignoring the cancellation token.
struct ScriptedTask {
    name: String,
    max_tries: i64,
    retry_interval: i64,
    timeout: Duration,
    panic_attempts: i64,
    fail_attempts: i64,
    busy_for: Duration,
    counter: AtomicI64,
    calls: Mutex<Vec<(Instant, Vec<u8>)>>,
}

impl ScriptedTask {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_tries: 1,
            retry_interval: 0,
            timeout: Duration::from_secs(5),
            panic_attempts: 0,
            fail_attempts: 0,
            busy_for: Duration::ZERO,
            counter: AtomicI64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn count(&self) -> i64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    fn call_bodies(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl Task for ScriptedTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_tries(&self) -> i64 {
        self.max_tries
    }

    fn retry_interval(&self) -> i64 {
        self.retry_interval
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, _ctx: CancellationToken, body: RawBody) -> Result<()> {
        let attempt = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), body.bytes().to_vec()));

        if !self.busy_for.is_zero() {
            tokio::time::sleep(self.busy_for).await;
        }
        if attempt <= self.panic_attempts {
            panic!("oops");
        }
        if attempt <= self.fail_attempts {
            return Err(QueueError::Handler("boom".to_string()));
        }
        Ok(())
    }
}

type SinkLog = Arc<Mutex<Vec<(Payload, String)>>>;

fn install_sink(queue: &Queue) -> SinkLog {
    let log: SinkLog = Arc::default();
    let sink = Arc::clone(&log);
    queue.set_failed_job_handler(Box::new(move |payload, err| {
        sink.lock().unwrap().push((payload.clone(), err.to_string()));
        Ok(())
    }));
    log
}

fn memory_queue() -> Queue {
    let _ = env_logger::builder().is_test(true).try_init();
    Queue::new(Driver::Memory, Config::default())
}

async fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn immediate_dispatch_runs_exactly_once() {
    let queue = memory_queue();
    let sink = install_sink(&queue);

    let task = Arc::new(ScriptedTask::new("t1"));
    queue.bootstrap_one(task.clone()).unwrap();
    queue.dispatch(task.as_ref(), &json!({"v": 1})).await.unwrap();
    queue.start().unwrap();

    assert!(wait_for(|| task.count() == 1, Duration::from_secs(2)).await);

    let bodies = task.call_bodies();
    let decoded: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(decoded, json!({"v": 1}));

    assert_eq!(queue.size(task.as_ref()).await, 0);

    // No second execution sneaks in, no failure surfaces.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(task.count(), 1);
    assert!(sink.lock().unwrap().is_empty());

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_attempts_retry_with_backoff_then_succeed() {
    let queue = memory_queue();
    let sink = install_sink(&queue);

    let task = Arc::new(ScriptedTask {
        max_tries: 3,
        retry_interval: 1,
        fail_attempts: 2,
        ..ScriptedTask::new("t2")
    });
    queue.bootstrap_one(task.clone()).unwrap();
    queue.dispatch(task.as_ref(), &"x").await.unwrap();
    queue.start().unwrap();

    assert!(wait_for(|| task.count() == 3, Duration::from_secs(10)).await);

    let times = task.call_times();
    assert!(times[1] - times[0] >= Duration::from_millis(950));
    assert!(times[2] - times[1] >= Duration::from_millis(950));

    for body in task.call_bodies() {
        let decoded: String = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, "x");
    }

    assert!(sink.lock().unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(task.count(), 3);
    assert_eq!(queue.size(task.as_ref()).await, 0);

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_reach_the_failed_job_handler_once() {
    let queue = memory_queue();
    let sink = install_sink(&queue);

    let task = Arc::new(ScriptedTask {
        max_tries: 3,
        fail_attempts: i64::MAX,
        ..ScriptedTask::new("t3")
    });
    queue.bootstrap_one(task.clone()).unwrap();
    queue.dispatch(task.as_ref(), &"doomed").await.unwrap();
    queue.start().unwrap();

    assert!(wait_for(|| sink.lock().unwrap().len() == 1, Duration::from_secs(5)).await);
    assert_eq!(task.count(), 3);

    {
        let entries = sink.lock().unwrap();
        let (payload, err) = &entries[0];
        assert_eq!(payload.attempts, 3);
        assert_eq!(payload.name, "t3");
        assert!(err.contains("boom"), "unexpected sink error: {err}");
    }

    // Terminal: nothing left to run, handler not invoked again.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(task.count(), 3);
    assert_eq!(sink.lock().unwrap().len(), 1);
    assert_eq!(queue.size(task.as_ref()).await, 0);

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_attempt_is_contained_and_retried() {
    let queue = memory_queue();
    let sink = install_sink(&queue);

    let task = Arc::new(ScriptedTask {
        max_tries: 2,
        panic_attempts: 1,
        ..ScriptedTask::new("t4")
    });
    queue.bootstrap_one(task.clone()).unwrap();
    queue.dispatch(task.as_ref(), &"p").await.unwrap();
    queue.start().unwrap();

    assert!(wait_for(|| task.count() == 2, Duration::from_secs(5)).await);
    assert!(sink.lock().unwrap().is_empty());

    // The worker survived the panic and keeps consuming.
    queue.dispatch(task.as_ref(), &"p2").await.unwrap();
    assert!(wait_for(|| task.count() == 3, Duration::from_secs(5)).await);

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delayed_dispatch_never_runs_early() {
    let queue = memory_queue();

    let task = Arc::new(ScriptedTask::new("t5"));
    queue.bootstrap_one(task.clone()).unwrap();

    let dispatched_at = Instant::now();
    queue
        .delay(task.as_ref(), &"late", Duration::from_secs(3))
        .await
        .unwrap();
    queue.start().unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(task.count(), 0, "executed before its delay elapsed");

    assert!(wait_for(|| task.count() == 1, Duration::from_secs(3)).await);
    assert!(task.call_times()[0] - dispatched_at >= Duration::from_secs(3));

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_attempt_is_retried_and_never_kills_the_worker() {
    let queue = memory_queue();
    let sink = install_sink(&queue);

    // Sleeps well past its timeout, ignoring the cancellation token.
    let task = Arc::new(ScriptedTask {
        max_tries: 2,
        timeout: Duration::from_secs(1),
        busy_for: Duration::from_secs(3),
        ..ScriptedTask::new("t6")
    });
    queue.bootstrap_one(task.clone()).unwrap();
    queue.dispatch(task.as_ref(), &"slow").await.unwrap();
    queue.start().unwrap();

    // Either the expired reservation is reclaimed and re-executed, or
    // the overlap guard re-delays it until the attempt cap fires; both
    // end in the failure sink without losing the worker.
    assert!(
        wait_for(
            || task.count() >= 2 || !sink.lock().unwrap().is_empty(),
            Duration::from_secs(8),
        )
        .await
    );

    // Let late attempts drain, then prove the pool is still alive.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let extra = Arc::new(ScriptedTask::new("t6-extra"));
    queue.bootstrap_one(extra.clone()).unwrap();
    queue.dispatch(extra.as_ref(), &"ok").await.unwrap();
    assert!(wait_for(|| extra.count() == 1, Duration::from_secs(3)).await);

    queue.shut_down(Duration::from_secs(10)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_quiesces_and_closes_the_queue() {
    let queue = memory_queue();

    let task = Arc::new(ScriptedTask {
        busy_for: Duration::from_millis(200),
        ..ScriptedTask::new("t7")
    });
    queue.bootstrap_one(task.clone()).unwrap();
    for _ in 0..3 {
        queue.dispatch(task.as_ref(), &"w").await.unwrap();
    }
    queue.start().unwrap();

    assert!(wait_for(|| task.count() >= 1, Duration::from_secs(3)).await);
    queue.shut_down(Duration::from_secs(5)).await.unwrap();

    // No execution begins after a clean shutdown.
    let settled = task.count();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(task.count(), settled);

    assert!(matches!(queue.start(), Err(QueueError::QueueClosed)));
    assert!(matches!(
        queue.dispatch(task.as_ref(), &"late").await,
        Err(QueueError::QueueClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn excluded_tasks_are_not_consumed() {
    let queue = memory_queue();

    let wanted = Arc::new(ScriptedTask::new("wanted"));
    let banned = Arc::new(ScriptedTask::new("banned"));
    queue
        .bootstrap(vec![wanted.clone() as Arc<dyn Task>, banned.clone()])
        .unwrap();
    queue.set_exclude_tasks(&["banned".to_string()]);

    queue.dispatch(wanted.as_ref(), &1).await.unwrap();
    queue.dispatch(banned.as_ref(), &2).await.unwrap();
    queue.start().unwrap();

    assert!(wait_for(|| wanted.count() == 1, Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(banned.count(), 0);
    assert_eq!(queue.size(banned.as_ref()).await, 1);

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allow_list_restricts_consumption() {
    let queue = memory_queue();

    let first = Arc::new(ScriptedTask::new("first"));
    let second = Arc::new(ScriptedTask::new("second"));
    queue
        .bootstrap(vec![first.clone() as Arc<dyn Task>, second.clone()])
        .unwrap();
    queue.set_allow_tasks(&["first".to_string()]);

    queue.dispatch(first.as_ref(), &1).await.unwrap();
    queue.dispatch(second.as_ref(), &2).await.unwrap();
    queue.start().unwrap();

    assert!(wait_for(|| first.count() == 1, Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(second.count(), 0);

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_bootstrap_replaces_the_previous_definition() {
    let queue = memory_queue();
    let sink = install_sink(&queue);

    let stale = Arc::new(ScriptedTask {
        fail_attempts: i64::MAX,
        ..ScriptedTask::new("dup")
    });
    let fresh = Arc::new(ScriptedTask::new("dup"));
    queue.bootstrap_one(stale.clone()).unwrap();
    queue.bootstrap_one(fresh.clone()).unwrap();

    queue.dispatch_by_name("dup", &"payload").await.unwrap();
    queue.start().unwrap();

    assert!(wait_for(|| fresh.count() == 1, Duration::from_secs(3)).await);
    assert_eq!(stale.count(), 0);
    assert!(sink.lock().unwrap().is_empty());

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatch_by_name_requires_bootstrap() {
    let queue = memory_queue();
    assert!(matches!(
        queue.dispatch_by_name("ghost", &1).await,
        Err(QueueError::TaskNotBootstrapped(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn statistics_reflect_the_worker_pool() {
    let queue = memory_queue();

    let task = Arc::new(ScriptedTask::new("stats"));
    queue.bootstrap_one(task.clone()).unwrap();
    queue.start().unwrap();

    let stats = queue.get_statistics().await;
    // One worker per allowed task plus the general looper's worker.
    assert_eq!(stats.workers.total_workers, 2);
    assert!(stats.jobs.jobs_statistics.contains_key("stats"));
    assert!(stats.memory.sys_memory_total > 0);

    queue.shut_down(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_autoscale_grows_and_shrinks_the_pool() {
    let _ = env_logger::builder().is_test(true).try_init();
    let queue = Queue::new(
        Driver::Memory,
        Config {
            max_concurrency: 2,
            auto_scale_job_threshold: 1,
            ..Config::default()
        },
    );

    let task = Arc::new(ScriptedTask {
        busy_for: Duration::from_millis(1500),
        ..ScriptedTask::new("scale")
    });
    queue.bootstrap_one(task.clone()).unwrap();
    for _ in 0..6 {
        queue.dispatch(task.as_ref(), &"job").await.unwrap();
    }
    queue.start().unwrap();

    // Backlog above the threshold: one more worker within the ceiling.
    assert!(wait_for(|| task.count() >= 1, Duration::from_secs(3)).await);
    queue.auto_scale_workers().await.unwrap();
    let stats = queue.get_statistics().await;
    assert_eq!(stats.workers.total_workers, 3);

    // Drained backlog: back down to the floor of tasks + 1.
    assert!(wait_for(|| task.count() == 6, Duration::from_secs(15)).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    queue.auto_scale_workers().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if queue.get_statistics().await.workers.total_workers == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "worker pool did not shrink");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    queue.shut_down(Duration::from_secs(10)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn autoscale_requires_a_consumer_process() {
    let queue = memory_queue();
    let task = Arc::new(ScriptedTask::new("idle"));
    queue.bootstrap_one(task).unwrap();

    // Never started: no workers to scale.
    assert!(queue.auto_scale_workers().await.is_err());
}
