use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

/// Lock a backend mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    backend: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, backend, op))
}

fn recover<G>(poisoned: PoisonError<G>, backend: &'static str, op: &'static str) -> G {
    warn!(
        target = "trellis::cache",
        op,
        backend,
        lock_kind = "mutex",
        result = "poisoned_recovered",
        hint = "entries may be stale after a panic in another task",
        "Recovered from poisoned cache lock"
    );
    poisoned.into_inner()
}
