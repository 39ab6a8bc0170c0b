//! Invocation futures: exactly-once, cancel-safe completion of remote calls.
//!
//! An [`InvocationFuture`] and its [`Completer`] share one state word.
//! Whoever moves it out of `WAITING` first wins: the reply path claims it
//! with a compare-and-swap before storing the result, a cancelling caller
//! swaps it straight to `CANCELLED`. Every later attempt is a no-op.
//!
//! The completer only holds a weak reference, so a reply arriving after
//! every caller-side handle was dropped is discarded.

use crate::task_queue::SerialTaskQueue;
use ddbus_types::CallError;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

const WAITING: u8 = 0;
const CLAIMED: u8 = 1;
const READY: u8 = 2;
const CANCELLED: u8 = 3;

/// Observable state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// No result yet.
    Waiting,
    /// A reply, remote error or local failure was recorded.
    Ready,
    /// The caller cancelled before a result arrived.
    Cancelled,
}

/// Outcome of a remote call.
pub type CallResult<T> = Result<T, CallError>;

/// Callback run on the serial task queue when a reply arrives.
pub type ReplyListener<T> = Box<dyn FnOnce(CallResult<T>) + Send + 'static>;

struct Shared<T> {
    state: AtomicU8,
    result: Mutex<Option<CallResult<T>>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WAITING),
            result: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn load(&self) -> InvocationState {
        match self.state.load(Ordering::SeqCst) {
            READY => InvocationState::Ready,
            CANCELLED => InvocationState::Cancelled,
            _ => InvocationState::Waiting,
        }
    }

    fn claim_and_set(&self, result: CallResult<T>) -> bool {
        if self
            .state
            .compare_exchange(WAITING, CLAIMED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        self.state.store(READY, Ordering::SeqCst);
        self.notify.notify_waiters();
        true
    }
}

/// Caller side of one outstanding remote call.
pub struct InvocationFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for InvocationFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for InvocationFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationFuture")
            .field("state", &self.shared.load())
            .finish()
    }
}

impl<T: Clone + Send + 'static> InvocationFuture<T> {
    /// A waiting future and the completer that resolves it.
    pub fn pending() -> (Self, Completer<T>) {
        let shared = Arc::new(Shared::new());
        let completer = Completer {
            shared: Arc::downgrade(&shared),
            listener: None,
        };
        (Self { shared }, completer)
    }

    /// Like [`pending`](Self::pending), with a listener that runs on `queue`
    /// once the reply is recorded.
    pub fn pending_with_listener(
        queue: SerialTaskQueue,
        listener: ReplyListener<T>,
    ) -> (Self, Completer<T>) {
        let (future, mut completer) = Self::pending();
        completer.listener = Some((queue, listener));
        (future, completer)
    }

    /// An already resolved future.
    pub fn ready(result: CallResult<T>) -> Self {
        let shared = Shared::new();
        shared.claim_and_set(result);
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Current state.
    pub fn state(&self) -> InvocationState {
        self.shared.load()
    }

    /// Whether a result is available.
    pub fn is_ready(&self) -> bool {
        self.state() == InvocationState::Ready
    }

    /// Result if terminal, without waiting.
    pub fn try_result(&self) -> Option<CallResult<T>> {
        match self.state() {
            InvocationState::Ready => self
                .shared
                .result
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            InvocationState::Cancelled => Some(Err(CallError::Cancelled)),
            InvocationState::Waiting => None,
        }
    }

    /// Cancel the call. Returns false if it had already completed.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .shared
            .state
            .compare_exchange(WAITING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            debug!("Invocation cancelled");
            self.shared.notify.notify_waiters();
        }
        cancelled
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> CallResult<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Wait at most `timeout`. `None` if still waiting; the call stays live.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<CallResult<T>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Block the current thread until the call is terminal. Must not be
    /// called from inside an async context.
    pub fn wait_blocking(&self) -> CallResult<T> {
        futures::executor::block_on(self.wait())
    }
}

/// Reply side of an invocation.
pub struct Completer<T> {
    shared: Weak<Shared<T>>,
    listener: Option<(SerialTaskQueue, ReplyListener<T>)>,
}

impl<T: Clone + Send + 'static> Completer<T> {
    /// Deliver the result. Returns whether it was recorded.
    pub fn complete(mut self, result: CallResult<T>) -> bool {
        self.deliver(result)
    }

    fn deliver(&mut self, result: CallResult<T>) -> bool {
        let Some(shared) = std::mem::take(&mut self.shared).upgrade() else {
            debug!("Reply for dropped invocation discarded");
            return false;
        };
        if !shared.claim_and_set(result.clone()) {
            debug!("Reply for completed invocation ignored");
            return false;
        }
        if let Some((queue, listener)) = self.listener.take() {
            queue.enqueue(move || listener(result));
        }
        true
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        // A completer dropped without a reply would leave waiters hanging.
        if let Some(shared) = self.shared.upgrade() {
            if shared.claim_and_set(Err(CallError::Local(
                "reply channel closed".to_string(),
            ))) {
                debug!("Invocation failed: reply channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_debug_shows_state() {
        let (future, completer) = InvocationFuture::<Value>::pending();
        assert_eq!(format!("{future:?}"), "InvocationFuture { state: Waiting }");
        assert!(future.cancel());
        assert_eq!(format!("{future:?}"), "InvocationFuture { state: Cancelled }");
        drop(completer);
        let ready = InvocationFuture::ready(Ok(json!(1)));
        assert!(format!("{ready:?}").contains("Ready"));
    }

    #[tokio::test]
    async fn test_complete_then_wait() {
        let (future, completer) = InvocationFuture::<Value>::pending();
        assert_eq!(future.state(), InvocationState::Waiting);
        assert!(completer.complete(Ok(json!(1))));
        assert_eq!(future.wait().await, Ok(json!(1)));
        assert!(future.is_ready());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_late_completion() {
        let (future, completer) = InvocationFuture::<Value>::pending();
        let waiter = {
            let future = future.clone();
            tokio::spawn(async move { future.wait().await })
        };
        tokio::task::yield_now().await;
        completer.complete(Err(CallError::Remote {
            name: "e".into(),
            description: "d".into(),
        }));
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CallError::Remote { .. })));
    }

    #[tokio::test]
    async fn test_cancel_wins_and_reply_is_ignored() {
        let (future, completer) = InvocationFuture::<Value>::pending();
        assert!(future.cancel());
        assert!(!future.cancel());
        assert!(!completer.complete(Ok(json!("late"))));
        assert_eq!(future.state(), InvocationState::Cancelled);
        assert_eq!(future.wait().await, Err(CallError::Cancelled));
    }

    #[tokio::test]
    async fn test_terminal_future_ignores_further_deliveries() {
        let (future, first) = InvocationFuture::<Value>::pending();
        let second = Completer {
            shared: Arc::downgrade(&future.shared),
            listener: None,
        };
        assert!(first.complete(Ok(json!(1))));
        assert!(!second.complete(Ok(json!(2))));
        assert!(!future.cancel());
        assert_eq!(future.try_result(), Some(Ok(json!(1))));
    }

    #[tokio::test]
    async fn test_reply_after_drop_is_discarded() {
        let (future, completer) = InvocationFuture::<Value>::pending();
        drop(future);
        assert!(!completer.complete(Ok(json!(1))));
    }

    #[tokio::test]
    async fn test_dropped_completer_fails_call() {
        let (future, completer) = InvocationFuture::<Value>::pending();
        drop(completer);
        assert!(matches!(future.wait().await, Err(CallError::Local(_))));
    }

    #[tokio::test]
    async fn test_wait_timeout_does_not_cancel() {
        let (future, completer) = InvocationFuture::<Value>::pending();
        assert!(future
            .wait_timeout(Duration::from_millis(20))
            .await
            .is_none());
        assert_eq!(future.state(), InvocationState::Waiting);
        completer.complete(Ok(json!(true)));
        assert_eq!(
            future.wait_timeout(Duration::from_millis(20)).await,
            Some(Ok(json!(true)))
        );
    }

    #[test]
    fn test_wait_blocking_across_threads() {
        let (future, completer) = InvocationFuture::<Value>::pending();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(json!("done")));
        });
        assert_eq!(future.wait_blocking(), Ok(json!("done")));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_listener_runs_on_queue_unless_cancelled() {
        let queue = SerialTaskQueue::new("replies").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let (future, completer) = InvocationFuture::<Value>::pending_with_listener(
            queue.clone(),
            Box::new(move |r| {
                assert_eq!(r, Ok(json!(5)));
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        completer.complete(Ok(json!(5)));
        queue.flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(future);

        let h = Arc::clone(&hits);
        let (future, completer) = InvocationFuture::<Value>::pending_with_listener(
            queue.clone(),
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(future.cancel());
        completer.complete(Ok(json!(6)));
        queue.flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ready_future() {
        let future = InvocationFuture::<Value>::ready(Err(CallError::DeadObject));
        assert!(future.is_ready());
        assert_eq!(future.wait().await, Err(CallError::DeadObject));
    }
}
