use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock::mutex_lock;

const SOURCE: &str = "executor::context";

type ContextSlot = Arc<dyn Any + Send + Sync>;

/// Typed, lazily constructed state shared by every handler of one firing.
///
/// Each call to [`Executor::execute`](super::Executor::execute) creates a fresh
/// context; linked executors fired as part of the same firing see the same one.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    contexts: Arc<Mutex<HashMap<TypeId, ContextSlot>>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the context of type `C`, constructing it with `Default` on first use.
    pub fn get<C>(&self) -> Arc<C>
    where
        C: Default + Send + Sync + 'static,
    {
        self.get_or_init(C::default)
    }

    /// Return the context of type `C`, constructing it with `init` on first use.
    pub fn get_or_init<C, F>(&self, init: F) -> Arc<C>
    where
        C: Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        let mut contexts = mutex_lock(&self.contexts, SOURCE, "get_or_init");
        if let Some(existing) = contexts.get(&TypeId::of::<C>())
            && let Ok(context) = Arc::clone(existing).downcast::<C>()
        {
            return context;
        }

        let context = Arc::new(init());
        contexts.insert(TypeId::of::<C>(), Arc::clone(&context) as ContextSlot);
        context
    }

    /// Return the context of type `C` only if some handler already created it.
    pub fn try_get<C>(&self) -> Option<Arc<C>>
    where
        C: Send + Sync + 'static,
    {
        let contexts = mutex_lock(&self.contexts, SOURCE, "try_get");
        contexts
            .get(&TypeId::of::<C>())
            .and_then(|slot| Arc::clone(slot).downcast::<C>().ok())
    }

    pub fn interrupt(&self) {
        self.get::<ExecutorInterrupter>().interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.try_get::<ExecutorInterrupter>()
            .is_some_and(|interrupter| interrupter.is_interrupted())
    }
}

/// Cooperative short-circuit flag for an executor firing.
///
/// Once set, remaining primary handlers and downstream linked executors are
/// skipped; post-handlers still run and may inspect the flag.
#[derive(Debug, Default)]
pub struct ExecutorInterrupter {
    interrupted: AtomicBool,
}

impl ExecutorInterrupter {
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}
