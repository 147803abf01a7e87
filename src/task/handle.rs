//! Cancellable units of async work.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::lock::mutex_lock;

use super::error::TaskError;

const SOURCE: &str = "task::handle";

const METRIC_TASK_CANCELLED_TOTAL: &str = "rescore_task_cancelled_total";

type CancelCallback = Box<dyn FnOnce() + Send>;
type OutcomeSlot<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, TaskError>>>>>;

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    on_cancel: Mutex<Option<CancelCallback>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl CancelState {
    fn run_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let callback = mutex_lock(&self.on_cancel, SOURCE, "run_cancel").take();
        if let Some(callback) = callback {
            callback();
        }
        if let Some(abort) = mutex_lock(&self.abort, SOURCE, "run_cancel").take() {
            abort.abort();
        }
    }
}

/// Handle the work of a [`Task`] uses to cooperate with cancellation.
#[derive(Clone)]
pub struct TaskControl {
    state: Arc<CancelState>,
}

impl TaskControl {
    /// Register the callback run when the task is cancelled, replacing any
    /// earlier one.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *mutex_lock(&self.state.on_cancel, SOURCE, "on_cancel") = Some(Box::new(callback));
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Spawned, cancellable unit of async work with a shareable outcome.
///
/// A task settles exactly once. After [`cancel`](Self::cancel) wins, the
/// outcome is `TaskError::Cancelled` no matter what the work does next.
pub struct Task<T> {
    state: Arc<CancelState>,
    slot: OutcomeSlot<T>,
    outcome: Shared<BoxFuture<'static, Result<T, TaskError>>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            slot: Arc::clone(&self.slot),
            outcome: self.outcome.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("cancelled", &self.state.cancelled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<T> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Spawn `work` on the runtime. `work` receives the task's control handle.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: FnOnce(TaskControl) -> Fut,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let state = Arc::new(CancelState::default());
        let (sender, receiver) = oneshot::channel();
        let slot: OutcomeSlot<T> = Arc::new(Mutex::new(Some(sender)));

        let future = work(TaskControl {
            state: Arc::clone(&state),
        });
        let worker_state = Arc::clone(&state);
        let worker_slot = Arc::clone(&slot);
        let handle = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskError::failed("task panicked")),
            };
            if matches!(
                outcome,
                Err(TaskError::Cancelled { .. } | TaskError::Timeout { .. })
            ) {
                worker_state.cancelled.store(true, Ordering::SeqCst);
            }
            settle(&worker_slot, outcome);
        });
        *mutex_lock(&state.abort, SOURCE, "new") = Some(handle.abort_handle());

        let outcome = receiver
            .map(|received| {
                received.unwrap_or_else(|_| Err(TaskError::cancelled("task dropped")))
            })
            .boxed()
            .shared();

        Self {
            state,
            slot,
            outcome,
        }
    }

    /// Task that runs `future` without needing its control handle.
    pub fn from_future<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        Self::new(|_| future)
    }

    /// Task already settled with `value`.
    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// Task already settled with `error`.
    pub fn rejected(error: TaskError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(outcome: Result<T, TaskError>) -> Self {
        let state = Arc::new(CancelState::default());
        if matches!(outcome, Err(TaskError::Cancelled { .. })) {
            state.cancelled.store(true, Ordering::SeqCst);
        }
        Self {
            state,
            slot: Arc::new(Mutex::new(None)),
            outcome: futures::future::ready(outcome).boxed().shared(),
        }
    }

    /// Cancel the task unless it already settled.
    ///
    /// Runs the registered cancel callback, drops the work and settles with
    /// [`TaskError::Cancelled`]. Returns false if the task had already settled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let Some(sender) = mutex_lock(&self.slot, SOURCE, "cancel").take() else {
            return false;
        };
        let reason = reason.into();
        self.state.run_cancel();
        counter!(METRIC_TASK_CANCELLED_TOTAL).increment(1);
        debug!(%reason, "Task cancelled");
        let _ = sender.send(Err(TaskError::Cancelled { reason }));
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_settled(&self) -> bool {
        mutex_lock(&self.slot, SOURCE, "is_settled").is_none()
    }

    /// Wait for the outcome. Any number of callers may wait on one task.
    pub fn wait(&self) -> impl Future<Output = Result<T, TaskError>> + Send + 'static {
        self.outcome.clone()
    }

    /// Continue with `next` once this task resolves.
    ///
    /// Cancelling the continuation cancels this task; if this task is
    /// cancelled the continuation settles as cancelled too.
    pub fn then<U, F, Fut>(&self, next: F) -> Task<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, TaskError>> + Send + 'static,
    {
        let source = self.clone();
        Task::new(move |control| {
            let upstream = source.clone();
            control.on_cancel(move || {
                upstream.cancel("continuation cancelled");
            });
            async move {
                let value = source.wait().await?;
                next(value).await
            }
        })
    }

    /// Recover from failures other than cancellation.
    pub fn catch<F, Fut>(&self, recover: F) -> Task<T>
    where
        F: FnOnce(TaskError) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let source = self.clone();
        Task::new(move |control| {
            let upstream = source.clone();
            control.on_cancel(move || {
                upstream.cancel("continuation cancelled");
            });
            async move {
                match source.wait().await {
                    Err(error) if !error.is_cancelled() => recover(error).await,
                    outcome => outcome,
                }
            }
        })
    }

    /// Run `cleanup` after this task settles, whatever the outcome.
    ///
    /// Cancelling the returned task also runs `cleanup`; it runs exactly once.
    pub fn finally<F>(&self, cleanup: F) -> Task<T>
    where
        F: FnOnce() + Send + 'static,
    {
        let source = self.clone();
        let cleanup = Arc::new(Mutex::new(Some(cleanup)));
        Task::new(move |control| {
            let upstream = source.clone();
            let on_cancel = Arc::clone(&cleanup);
            control.on_cancel(move || {
                upstream.cancel("continuation cancelled");
                run_once(&on_cancel);
            });
            async move {
                let outcome = source.wait().await;
                run_once(&cleanup);
                outcome
            }
        })
    }
}

fn run_once<F: FnOnce()>(cleanup: &Mutex<Option<F>>) {
    let cleanup = mutex_lock(cleanup, SOURCE, "finally").take();
    if let Some(cleanup) = cleanup {
        cleanup();
    }
}

fn settle<T>(slot: &OutcomeSlot<T>, outcome: Result<T, TaskError>) -> bool {
    match mutex_lock(slot, SOURCE, "settle").take() {
        Some(sender) => {
            let _ = sender.send(outcome);
            true
        }
        None => false,
    }
}

impl<T> IntoFuture for Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, TaskError>;
    type IntoFuture = Shared<BoxFuture<'static, Result<T, TaskError>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.outcome
    }
}
