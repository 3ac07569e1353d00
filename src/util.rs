use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock ignoring poison: every critical section in this crate leaves its data consistent
/// before any call that can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
