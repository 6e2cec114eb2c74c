use std::sync::{LockResult, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Takes the read side, recovering the guard if a writer panicked.
pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    backend: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), backend, op, "rwlock.read")
}

/// Takes the write side, recovering the guard if a writer panicked.
pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    backend: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), backend, op, "rwlock.write")
}

fn recover<G>(
    result: LockResult<G>,
    backend: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            backend,
            op,
            lock_kind,
            result = "poisoned_recovered",
            "recovered poisoned store lock; entries may be stale"
        );
        poisoned.into_inner()
    })
}
