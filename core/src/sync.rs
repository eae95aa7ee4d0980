//! Deadline-bounded waiting on a mutex-guarded state

use std::time::{Duration, Instant};

use parking_lot::{Condvar, MutexGuard};

use crate::error::StrataResult;

/// Condition variable paired with a maximum wait.
///
/// Waiters retry an attempt against the guarded state each time they are
/// woken, until it succeeds or the deadline passes.
pub struct BoundedWait {
    cond: Condvar,
    max_wait: Duration,
}

impl BoundedWait {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            cond: Condvar::new(),
            max_wait,
        }
    }

    /// Run `attempt` until it yields a value.
    ///
    /// Returns `Ok(None)` when the maximum wait elapses first. The final
    /// attempt is made after the deadline so a wake-up racing the timeout is
    /// not lost.
    pub fn wait_until<T, R>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        mut attempt: impl FnMut(&mut T) -> StrataResult<Option<R>>,
    ) -> StrataResult<Option<R>> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            if let Some(value) = attempt(&mut **guard)? {
                return Ok(Some(value));
            }
            if self.cond.wait_until(guard, deadline).timed_out() {
                return attempt(&mut **guard);
            }
        }
    }

    /// Wake every waiter so it retries its attempt
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}
