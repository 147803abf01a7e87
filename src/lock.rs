//! Poison-tolerant access to the std locks guarding resource and task state.
//!
//! A poisoned lock is logged and its guard reused.

use std::sync::{
    LockResult, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use tracing::warn;

fn recover<G>(
    result: LockResult<G>,
    source: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    result.unwrap_or_else(|poisoned: PoisonError<G>| {
        warn!(
            op,
            source,
            lock_kind,
            result = "poisoned_recovered",
            "Recovered from poisoned lock; guarded state may be stale"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    source: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), source, op, "mutex")
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), source, op, "rwlock.read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), source, op, "rwlock.write")
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn mutex_lock_recovers_after_panic() {
        let lock = Mutex::new(vec![1]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison the lock");
        }));

        mutex_lock(&lock, "lock::tests", "push").push(2);
        assert_eq!(*mutex_lock(&lock, "lock::tests", "read"), vec![1, 2]);
    }

    #[test]
    fn rw_lock_recovers_after_panic() {
        let lock = RwLock::new(0_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("lock should be acquired");
            panic!("poison the lock");
        }));

        *rw_write(&lock, "lock::tests", "write") = 7;
        assert_eq!(*rw_read(&lock, "lock::tests", "read"), 7);
    }
}
