//! Mutual-exclusion scheduling of tasks per id.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::oneshot;
use tracing::debug;

use crate::util::PriorityQueue;

use super::error::TaskError;
use super::handle::{Task, TaskControl};

const METRIC_SCHEDULER_QUEUE_LEN: &str = "rescore_scheduler_queue_len";

/// Priority used by [`TaskScheduler::schedule`].
pub const DEFAULT_PRIORITY: i32 = 0;

type Canceller = Arc<dyn Fn(&str) + Send + Sync>;

struct PendingEntry {
    priority: i32,
    seq: u64,
    start: oneshot::Sender<()>,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    /// Higher priority first; equal priorities in submission order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Lane {
    running: Option<u64>,
    pending: PriorityQueue<PendingEntry>,
    tasks: HashMap<u64, Canceller>,
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            running: None,
            pending: PriorityQueue::new(),
            tasks: HashMap::new(),
        }
    }
}

impl Lane {
    /// Start the best pending entry whose task is still waiting.
    fn dispatch(&mut self) {
        if self.running.is_some() {
            return;
        }
        while let Some(entry) = self.pending.pop() {
            if entry.start.send(()).is_ok() {
                self.running = Some(entry.seq);
                return;
            }
            self.tasks.remove(&entry.seq);
        }
    }

    fn is_idle(&self) -> bool {
        self.running.is_none() && self.pending.is_empty() && self.tasks.is_empty()
    }
}

struct SchedulerInner<Id> {
    name: String,
    lanes: DashMap<Id, Lane>,
    next_seq: AtomicU64,
}

impl<Id> SchedulerInner<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn record_queue_len(&self) {
        let pending: usize = self
            .lanes
            .iter()
            .map(|lane| lane.pending.iter().filter(|entry| !entry.start.is_closed()).count())
            .sum();
        gauge!(METRIC_SCHEDULER_QUEUE_LEN, "scheduler" => self.name.clone()).set(pending as f64);
    }
}

/// Releases a lane slot when the scheduled work finishes or is dropped.
struct LanePermit<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    inner: Arc<SchedulerInner<Id>>,
    id: Id,
    seq: u64,
}

impl<Id> Drop for LanePermit<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(mut lane) = self.inner.lanes.get_mut(&self.id) {
            lane.tasks.remove(&self.seq);
            if lane.running == Some(self.seq) {
                lane.running = None;
            } else {
                let seq = self.seq;
                lane.pending.retain(|entry| entry.seq != seq);
            }
            lane.dispatch();
        }
        self.inner.lanes.remove_if(&self.id, |_, lane| lane.is_idle());
        self.inner.record_queue_len();
    }
}

/// Runs tasks for the same id one at a time.
///
/// Tasks for different ids run concurrently. Within one id, waiting tasks
/// start in priority order, ties in submission order.
pub struct TaskScheduler<Id> {
    inner: Arc<SchedulerInner<Id>>,
}

impl<Id> Clone for TaskScheduler<Id> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Id> TaskScheduler<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                name: name.into(),
                lanes: DashMap::new(),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn schedule<T, F, Fut>(&self, id: Id, work: F) -> Task<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(TaskControl) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        self.schedule_with_priority(id, DEFAULT_PRIORITY, work)
    }

    pub fn schedule_with_priority<T, F, Fut>(&self, id: Id, priority: i32, work: F) -> Task<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(TaskControl) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (start, started) = oneshot::channel();
        let permit = LanePermit {
            inner: Arc::clone(&self.inner),
            id: id.clone(),
            seq,
        };

        let task = Task::new(move |control| async move {
            let _permit = permit;
            if started.await.is_err() {
                return Err(TaskError::cancelled("scheduler lane dropped"));
            }
            work(control).await
        });

        let handle = task.clone();
        let canceller: Canceller = Arc::new(move |reason: &str| {
            handle.cancel(reason);
        });
        {
            let mut lane = self.inner.lanes.entry(id.clone()).or_default();
            lane.tasks.insert(seq, canceller);
            lane.pending.push(PendingEntry {
                priority,
                seq,
                start,
            });
            lane.dispatch();
        }
        debug!(scheduler = %self.inner.name, ?id, seq, priority, "Task scheduled");
        self.inner.record_queue_len();
        task
    }

    pub fn is_executing(&self, id: &Id) -> bool {
        self.inner
            .lanes
            .get(id)
            .is_some_and(|lane| lane.running.is_some())
    }

    /// Number of tasks for `id` still waiting for their turn.
    pub fn pending(&self, id: &Id) -> usize {
        self.inner.lanes.get(id).map_or(0, |lane| {
            lane.pending
                .iter()
                .filter(|entry| !entry.start.is_closed())
                .count()
        })
    }

    /// Cancel the running task and every waiting task for `id`.
    pub fn cancel(&self, id: &Id) -> usize {
        let Some((_, lane)) = self.inner.lanes.remove(id) else {
            return 0;
        };
        let cancelled = lane.tasks.len();
        for canceller in lane.tasks.values() {
            canceller("scheduler lane cancelled");
        }
        debug!(scheduler = %self.inner.name, ?id, cancelled, "Scheduler lane cancelled");
        self.inner.record_queue_len();
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<Id> = self.inner.lanes.iter().map(|lane| lane.key().clone()).collect();
        ids.iter().map(|id| self.cancel(id)).sum()
    }
}
