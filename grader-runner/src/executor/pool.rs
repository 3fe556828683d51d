//! Bounded worker pool
//!
//! A fixed number of long-lived workers consume one shared FIFO queue.
//! Errors and panics inside a unit of work are logged and the worker moves on;
//! only `stop` and `cancel_all` end a worker's loop.

use futures_util::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SubmitError;
use crate::executor::QueueEntry;

/// How long cancelled workers get to unwind before they are aborted
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of workers, and so the maximum number of concurrent jobs
    pub concurrency: usize,

    /// Put work that was in flight when cancelled back on the queue
    pub resubmit_cancelled_tasks: bool,

    /// Maximum queued entries, `None` for an unbounded queue
    pub queue_capacity: Option<usize>,

    /// Deadline applied to entries submitted without one
    pub default_timeout: Option<Duration>,
}

impl ExecutorConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            resubmit_cancelled_tasks: false,
            queue_capacity: None,
            default_timeout: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        if self.queue_capacity == Some(0) {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.default_timeout == Some(Duration::ZERO) {
            anyhow::bail!("default job timeout must be greater than 0");
        }

        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// State shared between the executor handle and its workers
struct Shared {
    queue: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    active: AtomicUsize,
    config: ExecutorConfig,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop(&self) -> Option<QueueEntry> {
        self.queue().pop_front()
    }

    fn requeue(&self, entry: QueueEntry) {
        self.queue().push_front(entry);
        self.notify.notify_one();
    }
}

/// Worker handles plus the signals that control them
///
/// `closing` tells workers to exit once the queue is empty, `cancel` aborts
/// whatever they are running. Both are replaced on every `start`.
struct PoolState {
    workers: JoinSet<()>,
    closing: CancellationToken,
    cancel: CancellationToken,
}

/// Bounded concurrent task executor
pub struct TaskExecutor {
    shared: Arc<Shared>,
    state: Mutex<PoolState>,
}

enum Outcome {
    Finished(anyhow::Result<()>),
    Cancelled,
}

impl TaskExecutor {
    /// Creates a stopped executor; call [`start`](Self::start) to spawn workers
    pub fn new(config: ExecutorConfig) -> anyhow::Result<Self> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                active: AtomicUsize::new(0),
                config,
            }),
            state: Mutex::new(PoolState {
                workers: JoinSet::new(),
                closing: CancellationToken::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// Enqueues a unit of work; never blocks
    ///
    /// Entries are accepted while the pool is stopped and picked up by the
    /// next `start`.
    pub fn submit(&self, mut entry: QueueEntry) -> Result<(), SubmitError> {
        entry.set_default_timeout(self.shared.config.default_timeout);

        {
            let mut queue = self.shared.queue();
            if let Some(capacity) = self.shared.config.queue_capacity {
                if queue.len() >= capacity {
                    warn!("Rejecting task '{}': queue is full", entry.label());
                    return Err(SubmitError::QueueFull(capacity));
                }
            }
            debug!("Queued task '{}' (depth: {})", entry.label(), queue.len() + 1);
            queue.push_back(entry);
        }

        self.shared.notify.notify_one();
        Ok(())
    }

    /// Spawns the configured number of workers unless they are already running
    pub fn start(&self) {
        let mut state = self.state();

        if !state.workers.is_empty() {
            debug!("Executor already running with {} workers", state.workers.len());
            return;
        }

        state.closing = CancellationToken::new();
        state.cancel = CancellationToken::new();

        for worker_id in 0..self.shared.config.concurrency {
            let shared = Arc::clone(&self.shared);
            let closing = state.closing.clone();
            let cancel = state.cancel.clone();
            state
                .workers
                .spawn(worker_loop(worker_id, shared, closing, cancel));
        }

        info!(
            "Started {} workers (resubmit cancelled: {})",
            self.shared.config.concurrency, self.shared.config.resubmit_cancelled_tasks
        );
    }

    /// Drains the queue and stops the workers
    ///
    /// Workers keep taking entries until the queue is empty and then exit.
    /// Whatever is still running when `timeout` expires is cancelled, and
    /// entries left on the queue stay there for a later `start`.
    pub async fn stop(&self, timeout: Duration) {
        let (mut workers, closing, cancel) = self.take_workers();
        if workers.is_empty() {
            return;
        }

        info!("Stopping executor (timeout: {:?})", timeout);
        closing.cancel();

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(Some(result)) => log_join_result(result),
                Ok(None) => {
                    info!("Executor stopped");
                    return;
                }
                Err(_) => {
                    warn!(
                        "Stop timeout reached, cancelling {} remaining workers",
                        workers.len()
                    );
                    cancel.cancel();
                    break;
                }
            }
        }

        reap(workers).await;
    }

    /// Cancels every worker's current unit of work and stops the pool
    ///
    /// With `resubmit_cancelled_tasks` the interrupted entries go back to the
    /// front of the queue, otherwise they are dropped.
    pub async fn cancel_all(&self) {
        let (workers, closing, cancel) = self.take_workers();
        closing.cancel();
        cancel.cancel();

        if workers.is_empty() {
            return;
        }

        info!("Cancelling {} workers", workers.len());
        reap(workers).await;
    }

    /// Number of spawned workers
    pub fn worker_count(&self) -> usize {
        self.state().workers.len()
    }

    /// Number of units of work currently executing
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Number of entries waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.shared.queue().len()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_workers(&self) -> (JoinSet<()>, CancellationToken, CancellationToken) {
        let mut state = self.state();
        (
            std::mem::take(&mut state.workers),
            state.closing.clone(),
            state.cancel.clone(),
        )
    }
}

/// Waits for cancelled workers, aborting any that do not exit in time
async fn reap(mut workers: JoinSet<()>) {
    let drained = tokio::time::timeout(CANCEL_GRACE, async {
        while let Some(result) = workers.join_next().await {
            log_join_result(result);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            "{} workers ignored cancellation, abandoning them",
            workers.len()
        );
        workers.abort_all();
        workers.detach_all();
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!("Worker task failed: {}", e);
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    closing: CancellationToken,
    cancel: CancellationToken,
) {
    debug!("Worker {} started", worker_id);

    while !cancel.is_cancelled() {
        let Some(entry) = next_entry(&shared, &closing, &cancel).await else {
            break;
        };

        debug!("Worker {} running '{}'", worker_id, entry.label());
        shared.active.fetch_add(1, Ordering::SeqCst);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = run_entry(&entry) => Outcome::Finished(result),
        };

        shared.active.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Outcome::Finished(Ok(())) => {
                if let Err(e) = entry.finish() {
                    error!("Completion callback of '{}' failed: {:#}", entry.label(), e);
                }
            }
            Outcome::Finished(Err(e)) => {
                error!("Task '{}' failed: {:#}", entry.label(), e);
            }
            Outcome::Cancelled => {
                if shared.config.resubmit_cancelled_tasks {
                    info!("Resubmitting cancelled task '{}'", entry.label());
                    shared.requeue(entry);
                } else {
                    warn!("Dropping cancelled task '{}'", entry.label());
                }
                break;
            }
        }
    }

    debug!("Worker {} exited", worker_id);
}

/// Blocks until an entry is available
///
/// Returns `None` when the pool is cancelled, or when it is closing and the
/// queue has run dry.
async fn next_entry(
    shared: &Shared,
    closing: &CancellationToken,
    cancel: &CancellationToken,
) -> Option<QueueEntry> {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if cancel.is_cancelled() {
            return None;
        }

        if let Some(entry) = shared.pop() {
            return Some(entry);
        }

        if closing.is_cancelled() {
            return None;
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = closing.cancelled() => {}
            _ = cancel.cancelled() => return None,
        }
    }
}

/// Runs one attempt of an entry, converting timeouts and panics into errors
async fn run_entry(entry: &QueueEntry) -> anyhow::Result<()> {
    let work = AssertUnwindSafe(entry.start()).catch_unwind();

    let result = match entry.timeout() {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("timed out after {:?}", limit),
        },
        None => work.await,
    };

    match result {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            anyhow::bail!("panicked: {}", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn executor(concurrency: usize) -> TaskExecutor {
        TaskExecutor::new(ExecutorConfig::new(concurrency)).unwrap()
    }

    fn sleeper(millis: u64, done: Arc<AtomicUsize>) -> QueueEntry {
        QueueEntry::new("sleep", move || async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(())
        })
        .on_finish(move || {
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    async fn wait_for(counter: &AtomicUsize, value: usize, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if counter.load(Ordering::SeqCst) >= value {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[test]
    fn test_config_validation() {
        assert!(TaskExecutor::new(ExecutorConfig::new(0)).is_err());

        let mut config = ExecutorConfig::new(2);
        config.queue_capacity = Some(0);
        assert!(TaskExecutor::new(config).is_err());

        assert!(TaskExecutor::new(ExecutorConfig::new(2)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_worker_count() {
        let executor = executor(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..30 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            let entry = QueueEntry::new("probe", move || {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_finish(move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            executor.submit(entry).unwrap();
        }

        executor.start();
        executor.stop(Duration::from_secs(10)).await;

        assert_eq!(done.load(Ordering::SeqCst), 30);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_drains_queue_within_timeout() {
        let executor = executor(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            executor.submit(sleeper(100, Arc::clone(&done))).unwrap();
        }

        let started = std::time::Instant::now();
        executor.start();
        executor.stop(Duration::from_secs(1)).await;

        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(executor.worker_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_timeout_abandons_remaining_work() {
        // `stop` keeps draining until the deadline, so "at most N completions"
        // holds for a deadline shorter than two rounds of work. Here it falls
        // inside the second round: the first round finishes, the second is
        // cancelled and nothing else leaves the queue.
        let executor = executor(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            executor.submit(sleeper(200, Arc::clone(&done))).unwrap();
        }

        executor.start();
        executor.stop(Duration::from_millis(250)).await;

        let completed = done.load(Ordering::SeqCst);
        assert!(completed <= 2, "completed {} entries", completed);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(done.load(Ordering::SeqCst), completed);
        assert!(executor.queue_len() >= 6);
        assert_eq!(executor.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_all_resubmits_in_flight_work_once() {
        let mut config = ExecutorConfig::new(1);
        config.resubmit_cancelled_tasks = true;
        let executor = TaskExecutor::new(config).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let entry = {
            let attempts = Arc::clone(&attempts);
            let done = Arc::clone(&done);
            QueueEntry::new("slow", move || {
                let attempts = Arc::clone(&attempts);
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let pause = if attempt == 1 { 5_000 } else { 20 };
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                    Ok(())
                }
            })
            .on_finish(move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        executor.submit(entry).unwrap();
        executor.start();
        assert!(wait_for(&attempts, 1, Duration::from_secs(2)).await);

        executor.cancel_all().await;
        assert_eq!(executor.worker_count(), 0);
        assert_eq!(executor.queue_len(), 1);
        assert_eq!(done.load(Ordering::SeqCst), 0);

        executor.start();
        assert!(wait_for(&done, 1, Duration::from_secs(2)).await);
        executor.stop(Duration::from_secs(1)).await;

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(executor.queue_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_all_drops_in_flight_work_without_resubmit() {
        let executor = executor(1);
        let done = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&started);
        executor
            .submit(QueueEntry::new("forever", move || {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            }))
            .unwrap();
        executor.submit(sleeper(1, Arc::clone(&done))).unwrap();

        executor.start();
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        executor.cancel_all().await;

        // The queued entry survives, the in-flight one is gone
        assert_eq!(executor.queue_len(), 1);
        executor.start();
        executor.stop(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let executor = executor(3);
        executor.start();
        executor.start();
        assert_eq!(executor.worker_count(), 3);
        executor.stop(Duration::from_millis(100)).await;
        assert_eq!(executor.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_work_does_not_kill_worker() {
        let executor = executor(1);
        let done = Arc::new(AtomicUsize::new(0));
        let failed_finish = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&failed_finish);
        executor
            .submit(
                QueueEntry::new("fails", || async { Err(anyhow::anyhow!("boom")) }).on_finish(
                    move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                ),
            )
            .unwrap();
        executor
            .submit(QueueEntry::new("panics", || async {
                let missing: Option<()> = None;
                missing.expect("worker must survive this");
                Ok(())
            }))
            .unwrap();
        executor.submit(sleeper(1, Arc::clone(&done))).unwrap();

        executor.start();
        executor.stop(Duration::from_secs(1)).await;

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(failed_finish.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_callback_is_swallowed() {
        let executor = executor(1);
        let done = Arc::new(AtomicUsize::new(0));

        executor
            .submit(
                QueueEntry::new("ok", || async { Ok(()) })
                    .on_finish(|| anyhow::bail!("callback broke")),
            )
            .unwrap();
        executor.submit(sleeper(1, Arc::clone(&done))).unwrap();

        executor.start();
        executor.stop(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_when_full() {
        let mut config = ExecutorConfig::new(1);
        config.queue_capacity = Some(2);
        let executor = TaskExecutor::new(config).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        executor.submit(sleeper(1, Arc::clone(&done))).unwrap();
        executor.submit(sleeper(1, Arc::clone(&done))).unwrap();
        assert_eq!(
            executor.submit(sleeper(1, Arc::clone(&done))),
            Err(SubmitError::QueueFull(2))
        );
    }

    #[tokio::test]
    async fn test_timed_out_work_is_abandoned() {
        let executor = executor(1);
        let slow_done = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        executor
            .submit(sleeper(5_000, Arc::clone(&slow_done)).with_timeout(Duration::from_millis(20)))
            .unwrap();
        executor.submit(sleeper(1, Arc::clone(&done))).unwrap();

        executor.start();
        executor.stop(Duration::from_secs(2)).await;

        assert_eq!(slow_done.load(Ordering::SeqCst), 0);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
