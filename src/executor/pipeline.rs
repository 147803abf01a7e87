use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::trace;

use crate::lock::{rw_read, rw_write};

use super::context::ExecutionContext;

const SOURCE: &str = "executor::pipeline";

type Callback<T> = Arc<dyn Fn(T, ExecutionContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifies a registered handler or link for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registered<T> {
    id: HandlerId,
    callback: Callback<T>,
}

impl<T> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

struct Slots<T> {
    pre: Vec<Registered<T>>,
    handlers: Vec<Registered<T>>,
    post: Vec<Registered<T>>,
    before: Vec<Registered<T>>,
    next: Vec<Registered<T>>,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self {
            pre: Vec::new(),
            handlers: Vec::new(),
            post: Vec::new(),
            before: Vec::new(),
            next: Vec::new(),
        }
    }
}

enum Stage {
    Pre,
    Primary,
    Post,
    Before,
    Next,
}

struct ExecutorInner<T> {
    slots: RwLock<Slots<T>>,
    next_id: AtomicU64,
}

/// Ordered, chainable, interruptible handler pipeline.
///
/// Firing runs, in order: `before` links, pre-handlers, primary handlers,
/// `next` links, post-handlers. Every handler is awaited before the next one
/// starts. Once a handler interrupts the firing (see
/// [`ExecutorInterrupter`](super::ExecutorInterrupter)) the remaining pre and
/// primary handlers and all `next` links are skipped; post-handlers always run.
pub struct Executor<T> {
    inner: Arc<ExecutorInner<T>>,
}

impl<T> Clone for Executor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Executor<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Executor<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                slots: RwLock::new(Slots::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn add_handler<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(T, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Stage::Primary, boxed(handler))
    }

    pub fn add_pre_handler<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(T, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Stage::Pre, boxed(handler))
    }

    pub fn add_post_handler<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(T, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(Stage::Post, boxed(handler))
    }

    /// Fire `target` with `map(data)` before this executor's own handlers.
    pub fn before<U, M>(&self, target: &Executor<U>, map: M) -> HandlerId
    where
        U: Clone + Send + Sync + 'static,
        M: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.register(Stage::Before, link(target, map, |_: &T| true))
    }

    /// Like [`before`](Self::before), skipping payloads rejected by `filter`.
    pub fn before_if<U, M, P>(&self, target: &Executor<U>, map: M, filter: P) -> HandlerId
    where
        U: Clone + Send + Sync + 'static,
        M: Fn(&T) -> U + Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.register(Stage::Before, link(target, map, filter))
    }

    /// Fire `target` with `map(data)` after this executor's primary handlers.
    pub fn next<U, M>(&self, target: &Executor<U>, map: M) -> HandlerId
    where
        U: Clone + Send + Sync + 'static,
        M: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.register(Stage::Next, link(target, map, |_: &T| true))
    }

    /// Like [`next`](Self::next), skipping payloads rejected by `filter`.
    pub fn next_if<U, M, P>(&self, target: &Executor<U>, map: M, filter: P) -> HandlerId
    where
        U: Clone + Send + Sync + 'static,
        M: Fn(&T) -> U + Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.register(Stage::Next, link(target, map, filter))
    }

    /// Remove a handler or link. Returns false if the id is unknown.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut slots = rw_write(&self.inner.slots, SOURCE, "remove");
        let Slots {
            pre,
            handlers,
            post,
            before,
            next,
        } = &mut *slots;
        [pre, handlers, post, before, next]
            .into_iter()
            .any(|list| match list.iter().position(|entry| entry.id == id) {
                Some(position) => {
                    list.remove(position);
                    true
                }
                None => false,
            })
    }

    pub fn handler_count(&self) -> usize {
        let slots = rw_read(&self.inner.slots, SOURCE, "handler_count");
        slots.pre.len() + slots.handlers.len() + slots.post.len()
    }

    pub fn link_count(&self) -> usize {
        let slots = rw_read(&self.inner.slots, SOURCE, "link_count");
        slots.before.len() + slots.next.len()
    }

    /// Fire the pipeline with a fresh context and return that context.
    pub async fn execute(&self, data: T) -> ExecutionContext {
        let context = ExecutionContext::new();
        self.execute_in(data, context.clone()).await;
        context
    }

    /// Fire the pipeline inside an existing context.
    pub fn execute_in(&self, data: T, context: ExecutionContext) -> BoxFuture<'static, ()> {
        let (pre, handlers, post, before, next) = {
            let slots = rw_read(&self.inner.slots, SOURCE, "execute");
            (
                slots.pre.clone(),
                slots.handlers.clone(),
                slots.post.clone(),
                slots.before.clone(),
                slots.next.clone(),
            )
        };

        async move {
            trace!(
                handlers = handlers.len(),
                links = before.len() + next.len(),
                "Executor firing"
            );

            for entry in before.iter().chain(pre.iter()).chain(handlers.iter()) {
                if context.is_interrupted() {
                    break;
                }
                (entry.callback)(data.clone(), context.clone()).await;
            }

            for entry in &next {
                if context.is_interrupted() {
                    break;
                }
                (entry.callback)(data.clone(), context.clone()).await;
            }

            for entry in &post {
                (entry.callback)(data.clone(), context.clone()).await;
            }
        }
        .boxed()
    }

    fn register(&self, stage: Stage, callback: Callback<T>) -> HandlerId {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Registered { id, callback };
        let mut slots = rw_write(&self.inner.slots, SOURCE, "register");
        match stage {
            Stage::Pre => slots.pre.push(entry),
            Stage::Primary => slots.handlers.push(entry),
            Stage::Post => slots.post.push(entry),
            Stage::Before => slots.before.push(entry),
            Stage::Next => slots.next.push(entry),
        }
        id
    }
}

fn boxed<T, F, Fut>(handler: F) -> Callback<T>
where
    F: Fn(T, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |data, context| handler(data, context).boxed())
}

fn link<T, U, M, P>(target: &Executor<U>, map: M, filter: P) -> Callback<T>
where
    T: Clone + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
    M: Fn(&T) -> U + Send + Sync + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    let target = target.clone();
    Arc::new(move |data: T, context| {
        if !filter(&data) {
            return futures::future::ready(()).boxed();
        }
        target.execute_in(map(&data), context)
    })
}
