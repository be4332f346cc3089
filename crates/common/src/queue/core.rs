use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::QueueConfig;
use crate::error::{ConfigResult, FetchError, FetchResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const COMPONENT: &str = "backpressure queue";

/// How [`BackpressureQueue::shutdown`] treats outstanding work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop admitting, finish everything already admitted
    Drain,
    /// Stop admitting, abort running tasks and resolve waiting handles with
    /// `ShutDown`
    Cancel,
}

/// Queue metrics for monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMetrics {
    pub max_queue_size: usize,
    pub max_concurrent: usize,
    /// Tasks admitted but not yet picked up by a worker
    pub queue_depth: usize,
    /// Tasks currently running
    pub active: usize,
    /// Submissions rejected because the queue was full
    pub dropped: u64,
    /// Tasks whose operation returned `Ok`
    pub completed: u64,
    /// Tasks whose operation returned `Err` or panicked
    pub failed: u64,
}

impl QueueMetrics {
    /// Fraction of workers busy (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        self.active as f64 / self.max_concurrent as f64
    }

    /// Fraction of submissions rejected (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        let total = self.completed + self.failed + self.dropped;
        if total == 0 {
            return 0.0;
        }
        self.dropped as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Shared {
    /// Waiting plus running tasks
    admitted: AtomicUsize,
    active: AtomicUsize,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Releases an admission slot however the task ends: run, aborted, or
/// discarded unrun at shutdown.
struct AdmissionSlot(Arc<Shared>);

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.0.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Future resolving to the result of a submitted task
///
/// Resolves to `ShutDown` if the queue discarded the task before it produced
/// a result. Dropping the handle abandons the wait; the task still runs.
#[must_use = "a task handle does nothing unless awaited"]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<FetchResult<T>>,
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").finish_non_exhaustive()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = FetchResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(FetchError::shut_down(COMPONENT))))
    }
}

/// Bounded work queue that sheds load instead of growing
///
/// At most `max_concurrent` tasks run at once and at most `max_queue_size`
/// more wait for a worker, in FIFO order. Admission never blocks: a
/// submission beyond that capacity fails immediately with `QueueFull` and is
/// counted as dropped.
///
/// Workers are spawned on construction, so the queue must be created from
/// within a Tokio runtime.
pub struct BackpressureQueue {
    config: QueueConfig,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    accepting: AtomicBool,
    shared: Arc<Shared>,
    cancellation: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for BackpressureQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackpressureQueue")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl BackpressureQueue {
    /// Create the queue and spawn its workers
    pub fn new(config: QueueConfig) -> ConfigResult<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared::default());
        let cancellation = CancellationToken::new();

        let workers = (0..config.max_concurrent)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&shared),
                    cancellation.clone(),
                ))
            })
            .collect();

        info!(
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            "Backpressure queue started"
        );

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            accepting: AtomicBool::new(true),
            shared,
            cancellation,
            workers: Mutex::new(workers),
        })
    }

    /// Admit `operation` for execution
    ///
    /// Returns `QueueFull` synchronously when `max_queue_size +
    /// max_concurrent` tasks are already admitted, and `ShutDown` after
    /// [`shutdown`](Self::shutdown). The operation is not invoked until a
    /// worker picks it up.
    pub fn submit<F, Fut, T>(&self, operation: F) -> FetchResult<TaskHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(FetchError::shut_down(COMPONENT));
        }

        let capacity = self.config.capacity();
        let admitted = self.shared.admitted.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < capacity).then_some(n + 1)
        });
        if admitted.is_err() {
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(capacity, dropped, "Queue full, dropping request");
            return Err(FetchError::queue_full(capacity));
        }

        let slot = AdmissionSlot(Arc::clone(&self.shared));
        let shared = Arc::clone(&self.shared);
        let (result_tx, result_rx) = oneshot::channel();

        let job: Job = Box::pin(async move {
            let _slot = slot;
            let result = AssertUnwindSafe(async move { operation().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(FetchError::non_retryable("queued operation panicked")));

            match &result {
                Ok(_) => shared.completed.fetch_add(1, Ordering::Relaxed),
                Err(_) => shared.failed.fetch_add(1, Ordering::Relaxed),
            };
            // Receiver gone means the submitter stopped waiting.
            let _ = result_tx.send(result);
        });

        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            return Err(FetchError::shut_down(COMPONENT));
        }

        Ok(TaskHandle { receiver: result_rx })
    }

    /// Submit `operation` and wait for its result
    #[instrument(skip(self, operation))]
    pub async fn execute<F, Fut, T>(&self, operation: F) -> FetchResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(operation)?.await
    }

    /// Tasks admitted but not yet running
    pub fn queue_depth(&self) -> usize {
        let admitted = self.shared.admitted.load(Ordering::SeqCst);
        admitted.saturating_sub(self.active_count())
    }

    /// Tasks currently running
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Submissions rejected because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            max_queue_size: self.config.max_queue_size,
            max_concurrent: self.config.max_concurrent,
            queue_depth: self.queue_depth(),
            active: self.active_count(),
            dropped: self.dropped_count(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop admitting work and wind the workers down
    ///
    /// Waits up to `shutdown_timeout` for the workers; any still running after
    /// that are aborted and a `Timeout` error is returned. Calling this again
    /// after a completed shutdown is a no-op.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, mode: ShutdownMode) -> FetchResult<()> {
        self.accepting.store(false, Ordering::SeqCst);
        // Closing the channel lets draining workers exit once it is empty.
        self.sender.lock().take();

        if mode == ShutdownMode::Cancel {
            self.cancellation.cancel();
        }

        let mut workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return Ok(());
        }

        info!(?mode, workers = workers.len(), "Shutting down backpressure queue");

        let timeout = self.config.shutdown_timeout;
        let join_all = futures::future::join_all(workers.iter_mut());
        let joined = tokio::time::timeout(timeout, join_all).await;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Queue worker ended abnormally");
                    }
                }
                info!("Backpressure queue stopped");
                Ok(())
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Queue workers did not stop in time, aborting");
                self.cancellation.cancel();
                for handle in &workers {
                    handle.abort();
                }
                Err(FetchError::timeout("queue shutdown", timeout))
            }
        }
    }
}

impl Drop for BackpressureQueue {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = receiver.recv() => job,
            }
        };

        let Some(job) = job else {
            debug!(worker_id, "Queue worker exiting");
            break;
        };

        shared.active.fetch_add(1, Ordering::SeqCst);
        let aborted = tokio::select! {
            biased;
            _ = cancel.cancelled() => true,
            _ = job => false,
        };
        shared.active.fetch_sub(1, Ordering::SeqCst);

        if aborted {
            debug!(worker_id, "Queue worker cancelled with a task in flight");
            break;
        }
    }
}
