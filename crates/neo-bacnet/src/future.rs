//! Service Future
//!
//! A single-resolution result cell shared between the dispatcher (which
//! resolves it through a [`Completer`]) and any number of observers.
//!
//! Observers can:
//! - block the calling thread with [`ServiceFuture::wait`]
//! - await it from async code with [`ServiceFuture::resolved`] / [`ServiceFuture::wait_for`]
//! - poll it with [`ServiceFuture::state`]
//! - register a continuation with [`ServiceFuture::on_complete`]
//!
//! A caller-side timeout never cancels the exchange; it only stops that
//! observer from waiting.

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::types::DeviceAddress;

type Continuation<T> = Box<dyn FnOnce(&ServiceResult<T>) + Send + 'static>;

/// Observable state of a future
#[derive(Debug, Clone, PartialEq)]
pub enum FutureState<T> {
    Pending,
    Succeeded(T),
    Failed(ServiceError),
}

impl<T> FutureState<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FutureState::Pending)
    }
}

/// What a future is bound to, so it can be cancelled through the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Binding {
    Request {
        destination: DeviceAddress,
        invoke_id: u8,
        /// Dispatch sequence number; guards against cancelling a recycled id
        seq: u64,
    },
    Discovery(Uuid),
}

struct Slot<T> {
    outcome: Option<ServiceResult<T>>,
    continuations: Vec<Continuation<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
    notify: Notify,
}

/// Handle to the eventual result of one dispatched exchange.
///
/// Cloning yields another observer of the same cell.
pub struct ServiceFuture<T> {
    shared: Arc<Shared<T>>,
    binding: Option<Binding>,
}

impl<T> Clone for ServiceFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            binding: self.binding.clone(),
        }
    }
}

/// Write side of a [`ServiceFuture`]
pub(crate) struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completer<T>
where
    T: Clone + Send + 'static,
{
    /// Transition the future to its terminal state.
    ///
    /// Returns `false` (and leaves the first outcome untouched) if the future
    /// was already resolved.
    pub(crate) fn complete(&self, result: ServiceResult<T>) -> bool {
        let continuations = {
            let mut slot = self.shared.slot.lock();
            if slot.outcome.is_some() {
                tracing::warn!("Ignoring second resolution of a service future");
                return false;
            }
            slot.outcome = Some(result.clone());
            std::mem::take(&mut slot.continuations)
        };

        self.shared.cond.notify_all();
        self.shared.notify.notify_waiters();

        for continuation in continuations {
            continuation(&result);
        }
        true
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.shared.slot.lock().outcome.is_some()
    }
}

impl<T> ServiceFuture<T>
where
    T: Clone + Send + 'static,
{
    /// Create an unresolved future and its completer
    pub(crate) fn pending() -> (Self, Completer<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                outcome: None,
                continuations: Vec::new(),
            }),
            cond: Condvar::new(),
            notify: Notify::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
                binding: None,
            },
            Completer { shared },
        )
    }

    /// An already-resolved future
    pub fn ready(result: ServiceResult<T>) -> Self {
        let (future, completer) = Self::pending();
        completer.complete(result);
        future
    }

    pub(crate) fn bound(mut self, binding: Binding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub(crate) fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Non-blocking poll
    pub fn state(&self) -> FutureState<T> {
        match &self.shared.slot.lock().outcome {
            None => FutureState::Pending,
            Some(Ok(v)) => FutureState::Succeeded(v.clone()),
            Some(Err(e)) => FutureState::Failed(e.clone()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.shared.slot.lock().outcome.is_some()
    }

    /// Terminal outcome, if resolved
    pub fn try_result(&self) -> Option<ServiceResult<T>> {
        self.shared.slot.lock().outcome.clone()
    }

    /// Block the calling thread until resolution.
    ///
    /// With `timeout`, returns `CallerTimeout` once it elapses. Must not be
    /// called from inside an async task.
    pub fn wait(&self, timeout: Option<Duration>) -> ServiceResult<T> {
        let mut slot = self.shared.slot.lock();
        match timeout {
            None => {
                while slot.outcome.is_none() {
                    self.shared.cond.wait(&mut slot);
                }
            }
            Some(limit) => {
                let deadline = std::time::Instant::now() + limit;
                while slot.outcome.is_none() {
                    if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        slot.outcome.clone().unwrap_or(Err(ServiceError::CallerTimeout))
    }

    /// Await resolution
    pub async fn resolved(&self) -> ServiceResult<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.try_result() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Await resolution for at most `limit`
    pub async fn wait_for(&self, limit: Duration) -> ServiceResult<T> {
        tokio::time::timeout(limit, self.resolved())
            .await
            .unwrap_or(Err(ServiceError::CallerTimeout))
    }

    /// Register a continuation invoked exactly once with the terminal outcome.
    ///
    /// Runs on the resolving thread, or immediately on this one if the future
    /// is already terminal.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&ServiceResult<T>) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.shared.slot.lock();
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.continuations.push(Box::new(f));
                    return;
                }
            }
        };
        f(&outcome);
    }

    /// Derive a future whose success value is produced by `f`.
    ///
    /// The derived future keeps the binding, so cancelling it cancels the
    /// underlying exchange.
    pub fn map<U, F>(&self, f: F) -> ServiceFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> ServiceResult<U> + Send + 'static,
    {
        let (mapped, completer) = ServiceFuture::<U>::pending();
        self.on_complete(move |outcome| {
            let result = match outcome {
                Ok(v) => f(v.clone()),
                Err(e) => Err(e.clone()),
            };
            completer.complete(result);
        });
        ServiceFuture {
            shared: mapped.shared,
            binding: self.binding.clone(),
        }
    }
}

impl<T> IntoFuture for ServiceFuture<T>
where
    T: Clone + Send + 'static,
{
    type Output = ServiceResult<T>;
    type IntoFuture = BoxFuture<'static, ServiceResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.resolved().await })
    }
}

impl<T> fmt::Debug for ServiceFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.shared.slot.lock().outcome {
            None => "pending",
            Some(Ok(_)) => "succeeded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("ServiceFuture")
            .field("state", &state)
            .field("binding", &self.binding)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn test_resolves_exactly_once() {
        let (future, completer) = ServiceFuture::<u32>::pending();
        assert_eq!(future.state(), FutureState::Pending);

        assert!(completer.complete(Ok(7)));
        assert!(!completer.complete(Err(ServiceError::Timeout)));

        assert_eq!(future.state(), FutureState::Succeeded(7));
        assert_eq!(future.wait(None), Ok(7));
    }

    #[test]
    fn test_continuation_runs_once() {
        let (future, completer) = ServiceFuture::<u32>::pending();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        future.on_complete(move |outcome| {
            assert_eq!(outcome, &Ok(1));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        completer.complete(Ok(1));
        completer.complete(Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Registered after resolution: runs immediately
        let counter = Arc::clone(&calls);
        future.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_blocking_wait_caller_timeout() {
        let (future, completer) = ServiceFuture::<u32>::pending();

        let result = future.wait(Some(Duration::from_millis(20)));
        assert_eq!(result, Err(ServiceError::CallerTimeout));

        // The underlying exchange is unaffected and can still resolve
        assert!(!future.is_terminal());
        assert!(completer.complete(Ok(3)));
        assert_eq!(future.wait(Some(Duration::from_millis(20))), Ok(3));
    }

    #[test]
    fn test_blocking_wait_from_other_thread() {
        let (future, completer) = ServiceFuture::<String>::pending();
        let observer = future.clone();

        let handle = std::thread::spawn(move || observer.wait(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        completer.complete(Ok("done".to_string()));

        assert_eq!(handle.join().unwrap(), Ok("done".to_string()));
        assert_eq!(future.try_result(), Some(Ok("done".to_string())));
    }

    #[test]
    fn test_async_observer_is_woken() {
        let (future, completer) = ServiceFuture::<u32>::pending();
        let mut task = tokio_test::task::spawn(future.resolved());

        assert_pending!(task.poll());
        completer.complete(Err(ServiceError::Cancelled));
        assert!(task.is_woken());
        assert_eq!(assert_ready!(task.poll()), Err(ServiceError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_caller_timeout() {
        let (future, _completer) = ServiceFuture::<u32>::pending();
        let result = future.wait_for(Duration::from_secs(1)).await;
        assert_eq!(result, Err(ServiceError::CallerTimeout));
    }

    #[test]
    fn test_map_propagates_outcome_and_binding() {
        let (future, completer) = ServiceFuture::<u32>::pending();
        let future = future.bound(Binding::Discovery(Uuid::new_v4()));

        let doubled = future.map(|v| Ok(v * 2));
        let failing = future.map(|_| -> ServiceResult<u32> {
            Err(ServiceError::UnexpectedResponse("nope".into()))
        });
        assert_eq!(doubled.binding(), future.binding());

        completer.complete(Ok(21));
        assert_eq!(doubled.state(), FutureState::Succeeded(42));
        assert!(matches!(failing.state(), FutureState::Failed(ServiceError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn test_await_directly() {
        let (future, completer) = ServiceFuture::<u32>::pending();
        let observer = future.clone();
        tokio::spawn(async move {
            completer.complete(Ok(5));
        });
        assert_eq!(observer.await, Ok(5));
        assert_eq!(future.await, Ok(5));
    }

    #[test]
    fn test_ready() {
        let future = ServiceFuture::ready(Err::<u32, _>(ServiceError::Shutdown));
        assert!(future.is_terminal());
        assert_eq!(future.state(), FutureState::Failed(ServiceError::Shutdown));
    }
}
