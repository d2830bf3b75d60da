//! Sleep/wake barrier of a group.
//!
//! Threads [park](Barrier::park) on the barrier until another thread calls
//! [`Barrier::release_all`]. Releasing is a broadcast: every thread parked at
//! that moment is woken, in no particular order. A release that finds no
//! parked threads does nothing; in particular it does not let a later park
//! return immediately.
//!
//! The barrier does not own a lock. Its state lives inside the state of the
//! group and is protected by the group lock, which is also the lock the
//! condition variable waits on.

use std::sync::{Condvar, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub(crate) struct BarrierState {
    generation: u64,
    waiters: usize,
    closed: bool,
}

impl BarrierState {
    pub fn waiters(&self) -> usize {
        self.waiters
    }
}

impl AsMut<BarrierState> for BarrierState {
    fn as_mut(&mut self) -> &mut BarrierState {
        self
    }
}

/// Reason a parked thread returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Released,
    Closed,
}

#[derive(Debug, Default)]
pub(crate) struct Barrier {
    condvar: Condvar,
}

impl Barrier {
    /// Parks the calling thread until the barrier is released or closed.
    ///
    /// `guard` must be the guard of the lock protecting the barrier state; it
    /// is released while waiting and reacquired before returning.
    pub fn park<'a, T: AsMut<BarrierState>>(
        &self,
        mut guard: MutexGuard<'a, T>,
    ) -> (MutexGuard<'a, T>, Wake) {
        let state = guard.as_mut();
        if state.closed {
            return (guard, Wake::Closed);
        }

        let generation = state.generation;
        state.waiters += 1;
        tracing::trace!(generation, waiters = state.waiters, "parking on barrier");

        let mut guard = self
            .condvar
            .wait_while(guard, |state| {
                let state = state.as_mut();
                state.generation == generation && !state.closed
            })
            .unwrap_or_else(PoisonError::into_inner);

        // A release always bumps the generation, so a changed generation wins
        // over a close that happened afterwards.
        let wake = if guard.as_mut().generation != generation {
            Wake::Released
        } else {
            Wake::Closed
        };
        (guard, wake)
    }

    /// Wakes every parked thread and returns how many there were.
    pub fn release_all(&self, state: &mut BarrierState) -> usize {
        if state.waiters == 0 {
            tracing::trace!("release without waiters");
            return 0;
        }

        let released = std::mem::take(&mut state.waiters);
        state.generation = state.generation.wrapping_add(1);
        self.condvar.notify_all();
        tracing::trace!(generation = state.generation, released, "barrier released");
        released
    }

    /// Closes the barrier for good.
    ///
    /// Parked threads return with [`Wake::Closed`], as does every later call
    /// to [`Barrier::park`].
    pub fn close(&self, state: &mut BarrierState) -> usize {
        state.closed = true;
        let waiters = std::mem::take(&mut state.waiters);
        self.condvar.notify_all();
        waiters
    }
}
