//! Polling loop built on [`Task`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::lock::mutex_lock;

use super::error::TaskError;
use super::handle::Task;

const SOURCE: &str = "task::while_task";

/// Repeat `producer` until `callback` accepts its value.
///
/// Each round waits for the produced task, resolves with its value when
/// `callback` returns true, and otherwise sleeps `interval` before the next
/// round. A producer failure ends the loop with that failure. With a
/// `timeout` the loop settles as [`TaskError::Timeout`] once it elapses.
/// Cancellation or timeout also cancels the producer task in flight.
pub fn while_task<T, C, P>(
    callback: C,
    producer: P,
    interval: Duration,
    timeout: Option<Duration>,
) -> Task<T>
where
    T: Clone + Send + Sync + 'static,
    C: Fn(&T) -> bool + Send + Sync + 'static,
    P: Fn() -> Task<T> + Send + Sync + 'static,
{
    Task::new(move |control| {
        let current: Arc<Mutex<Option<Task<T>>>> = Arc::new(Mutex::new(None));
        let on_cancel = Arc::clone(&current);
        control.on_cancel(move || {
            let producing = mutex_lock(&on_cancel, SOURCE, "on_cancel").take();
            if let Some(task) = producing {
                task.cancel("polling loop cancelled");
            }
        });

        async move {
            let polling = poll_rounds(&callback, &producer, interval, &current);

            let Some(after) = timeout else {
                return polling.await;
            };
            match tokio::time::timeout(after, polling).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let producing = mutex_lock(&current, SOURCE, "timeout").take();
                    if let Some(task) = producing {
                        task.cancel("polling loop timed out");
                    }
                    debug!(?after, "Polling loop timed out");
                    Err(TaskError::Timeout { after })
                }
            }
        }
    })
}

async fn poll_rounds<T, C, P>(
    callback: &C,
    producer: &P,
    interval: Duration,
    current: &Mutex<Option<Task<T>>>,
) -> Result<T, TaskError>
where
    T: Clone + Send + Sync + 'static,
    C: Fn(&T) -> bool,
    P: Fn() -> Task<T>,
{
    let mut round = 0_u64;
    loop {
        round += 1;
        let task = producer();
        *mutex_lock(current, SOURCE, "produce") = Some(task.clone());
        let value = task.wait().await?;
        if callback(&value) {
            debug!(round, "Polling condition met");
            return Ok(value);
        }
        tokio::time::sleep(interval).await;
    }
}
