// One-shot completion primitives bridging callback-style producers and
// awaitable consumers.
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use tokio::sync::oneshot;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Single-use completion sink with exactly one terminal outcome.
///
/// Both methods default to no-ops so a producer may always invoke one of
/// them without a consumer present.
pub trait Promise<T>: Send + Sync {
    /// Callback to invoke when the operation succeeds.
    fn succeed(&self, _result: T) {}

    /// Callback to invoke when the operation fails.
    fn fail(&self, _failure: BoxError) {}
}

/// Promise that discards both outcomes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Noop;

impl<T> Promise<T> for Noop {}

/// Passthrough decorator forwarding both outcomes to an inner promise.
///
/// Wrap one of these to attach cross-cutting side effects without altering
/// completion semantics.
pub struct Nested<T> {
    inner: Arc<dyn Promise<T>>,
}

impl<T> Nested<T> {
    pub fn new(inner: Arc<dyn Promise<T>>) -> Self {
        Self { inner }
    }
}

impl<T> Promise<T> for Nested<T>
where
    T: Send + Sync,
{
    fn succeed(&self, result: T) {
        self.inner.succeed(result);
    }

    fn fail(&self, failure: BoxError) {
        self.inner.fail(failure);
    }
}

/// Adapts a not-yet-completed oneshot sender into a promise.
///
/// Succeeding or failing the returned promise completes the receiving end
/// with `Ok` or `Err` respectively. A `Completable` already satisfies the
/// promise contract, so it never needs this adapter.
pub fn from_oneshot<T>(sender: oneshot::Sender<Result<T, BoxError>>) -> OneshotPromise<T> {
    OneshotPromise {
        sender: Mutex::new(Some(sender)),
    }
}

pub struct OneshotPromise<T> {
    sender: Mutex<Option<oneshot::Sender<Result<T, BoxError>>>>,
}

impl<T> OneshotPromise<T> {
    fn complete(&self, outcome: Result<T, BoxError>) {
        match self.sender.lock().take() {
            // The receiver may have gone away; completion is best-effort.
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => tracing::debug!("oneshot promise completed more than once"),
        }
    }
}

impl<T> Promise<T> for OneshotPromise<T>
where
    T: Send,
{
    fn succeed(&self, result: T) {
        self.complete(Ok(result));
    }

    fn fail(&self, failure: BoxError) {
        self.complete(Err(failure));
    }
}

enum CellState<T> {
    Pending(Option<Waker>),
    Ready(Result<T, BoxError>),
    Taken,
}

struct CompletionCell<T> {
    // One-shot guard: the first compare-and-set wins, later completions are
    // ignored and logged.
    completed: AtomicBool,
    state: Mutex<CellState<T>>,
}

/// A future that is also a promise.
///
/// Clones share one completion cell, so a producer may keep one handle and
/// complete it while a consumer awaits another. Completing an instance that
/// is already completed is a caller error; the extra outcome is dropped and
/// logged at debug level.
///
/// ```
/// use halley_promise::{Completable, Promise};
///
/// let completable = Completable::new();
/// let promise = completable.clone();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async move {
///     promise.succeed(42u32);
///     assert_eq!(completable.await.expect("outcome"), 42);
/// });
/// ```
pub struct Completable<T> {
    cell: Arc<CompletionCell<T>>,
}

impl<T> Completable<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(CompletionCell {
                completed: AtomicBool::new(false),
                state: Mutex::new(CellState::Pending(None)),
            }),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.cell.completed.load(Ordering::Acquire)
    }

    fn complete(&self, outcome: Result<T, BoxError>) {
        if self
            .cell
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("completable completed more than once");
            return;
        }
        let waker = {
            let mut state = self.cell.state.lock();
            match std::mem::replace(&mut *state, CellState::Ready(outcome)) {
                CellState::Pending(waker) => waker,
                // Unreachable given the completed flag, but don't lose a
                // consumed state if it ever happens.
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Default for Completable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Completable<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Promise<T> for Completable<T>
where
    T: Send,
{
    fn succeed(&self, result: T) {
        self.complete(Ok(result));
    }

    fn fail(&self, failure: BoxError) {
        self.complete(Err(failure));
    }
}

impl<T> Future for Completable<T> {
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.cell.state.lock();
        match std::mem::replace(&mut *state, CellState::Taken) {
            CellState::Ready(outcome) => Poll::Ready(outcome),
            CellState::Pending(_) => {
                *state = CellState::Pending(Some(cx.waker().clone()));
                Poll::Pending
            }
            CellState::Taken => panic!("Completable polled after completion"),
        }
    }
}
