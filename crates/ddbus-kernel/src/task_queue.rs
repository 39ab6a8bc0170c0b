//! Serial task queue: single-worker FIFO executor.
//!
//! Producers on any thread enqueue closures; one dedicated worker thread runs
//! them one at a time in enqueue order. All object cache mutation goes
//! through a queue like this, so observers see events in a single order.
//!
//! The worker enters the tokio runtime that was current when the queue was
//! created, so tasks may spawn timers or other tokio work.

use ddbus_types::{DdError, DdResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Run(Task),
    Barrier(oneshot::Sender<()>),
}

/// Handle to a serial task queue. Cheap to clone; the worker exits once
/// every handle is dropped and the backlog is drained.
#[derive(Clone)]
pub struct SerialTaskQueue {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl SerialTaskQueue {
    /// Start a queue and its worker thread.
    pub fn new(name: &str) -> DdResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let runtime = tokio::runtime::Handle::try_current().ok();

        let worker_name: Arc<str> = Arc::from(name);
        let worker_pending = Arc::clone(&pending);
        std::thread::Builder::new()
            .name(format!("ddbus-{name}"))
            .spawn(move || run_worker(worker_name, receiver, worker_pending, runtime))
            .map_err(|e| DdError::InitFailed(format!("task queue '{name}': {e}")))?;

        Ok(Self {
            name: Arc::from(name),
            sender,
            pending,
        })
    }

    /// Queue name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task. Returns false if the worker has stopped.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(Job::Run(Box::new(task))).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!(queue = %self.name, "Task queue stopped, task dropped");
            return false;
        }
        true
    }

    /// Wait until every task enqueued before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Job::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Number of tasks enqueued but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SerialTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTaskQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_worker(
    name: Arc<str>,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    pending: Arc<AtomicUsize>,
    runtime: Option<tokio::runtime::Handle>,
) {
    let _guard = runtime.as_ref().map(|rt| rt.enter());
    debug!(queue = %name, "Task queue worker started");
    while let Some(job) = receiver.blocking_recv() {
        match job {
            Job::Run(task) => {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(queue = %name, "Task panicked; continuing with next task");
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            Job::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(queue = %name, "Task queue worker stopped");
}
