//! Message groups.
//!
//! A group is a named mailbox. Writers hand messages to the group, which
//! delivers them into its queue after the current send delay has elapsed.
//! Readers pop delivered messages in the order they were written. Every group
//! also carries a [barrier](crate::barrier) that threads can sleep on until
//! another thread wakes them up.
//!
//! # Example
//! ```
//! use synchmess::registry::GroupRegistry;
//! use std::time::Duration;
//!
//! let registry = GroupRegistry::new();
//! let group = registry.create_or_get("example")?;
//!
//! group.write(b"First write")?;
//! group.write(b"Second write")?;
//! assert_eq!(&*group.read().unwrap(), b"First write");
//! assert_eq!(&*group.read().unwrap(), b"Second write");
//! assert!(group.read().is_none());
//!
//! group.set_delay(Duration::from_secs(120));
//! group.write(b"later")?;
//! assert!(group.read().is_none());
//! group.flush();
//! assert_eq!(&*group.read().unwrap(), b"later");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use crate::{
    barrier::{Barrier, BarrierState, Wake},
    config::RelayConfig,
    error::RelayError,
    queue::{Message, MessageQueue},
    registry::GroupId,
    scheduler::{DelayScheduler, DeliveryId, FlushOutcome},
    timer::{Expire, TimerHandle},
};

pub(crate) struct GroupState {
    delay: Duration,
    queue: MessageQueue,
    scheduler: DelayScheduler,
    barrier: BarrierState,
    closed: bool,
}

impl AsMut<BarrierState> for GroupState {
    fn as_mut(&mut self) -> &mut BarrierState {
        &mut self.barrier
    }
}

/// A write accepted by [`Group::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    /// Handle of the deferred delivery.
    pub delivery: DeliveryId,
    /// Number of bytes accepted after truncation.
    pub accepted: usize,
}

/// A named message group.
///
/// Groups are created through
/// [`GroupRegistry::create_or_get`](crate::registry::GroupRegistry::create_or_get)
/// and shared between threads using [`Arc`]. All mutable state sits behind a
/// single lock per group, so operations on different groups never contend.
pub struct Group {
    id: GroupId,
    name: String,
    max_message_size: usize,
    state: Mutex<GroupState>,
    barrier: Barrier,
}

impl Group {
    pub(crate) fn new(
        id: GroupId,
        name: String,
        config: &RelayConfig,
        timer: TimerHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Group>| {
            let target: Weak<dyn Expire> = this.clone();
            Self {
                id,
                name,
                max_message_size: config.max_message_size,
                state: Mutex::new(GroupState {
                    delay: config.default_delay,
                    queue: MessageQueue::new(config.max_storage_size),
                    scheduler: DelayScheduler::new(id, timer, target),
                    barrier: BarrierState::default(),
                    closed: false,
                }),
                barrier: Barrier::default(),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        // Nothing that runs under the lock leaves the state half-updated on
        // panic, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, GroupState>, RelayError> {
        let state = self.lock();
        if state.closed {
            Err(RelayError::Closed(self.id))
        } else {
            Ok(state)
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes longer than this are truncated.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// The send delay applied to new writes.
    pub fn delay(&self) -> Duration {
        self.lock().delay
    }

    /// Number of deliveries that have neither fired nor been revoked.
    pub fn pending_len(&self) -> usize {
        self.lock().scheduler.len()
    }

    /// Number of delivered messages waiting to be read.
    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Number of bytes occupied in the byte budget.
    pub fn queued_bytes(&self) -> usize {
        self.lock().queue.used_bytes()
    }

    /// Number of threads currently sleeping on the barrier.
    pub fn sleepers(&self) -> usize {
        self.lock().barrier.waiters()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Sets the send delay.
    ///
    /// Only writes made afterwards are affected; deliveries that are already
    /// scheduled keep the delay they were written with.
    ///
    /// A delay too long to be represented as a point in time is accepted;
    /// writes made with it only arrive through [`Self::flush`].
    #[tracing::instrument(skip(self), fields(group = self.id))]
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Writes a message and returns the handle of its delivery.
    ///
    /// The payload is truncated to the configured maximum message size. With
    /// a zero delay the message is delivered before this function returns,
    /// otherwise the timer thread delivers it once the delay has elapsed.
    ///
    /// The byte budget is checked on delivery, not here. A message that does
    /// not fit at that point is dropped and the writer is not notified.
    #[tracing::instrument(skip(self, payload), fields(group = self.id, len = payload.len()))]
    pub fn submit(&self, payload: &[u8]) -> Result<Submitted, RelayError> {
        let message = Message::truncated(payload, self.max_message_size);
        let accepted = message.len();
        if accepted < payload.len() {
            tracing::debug!(accepted, "message truncated");
        }

        let mut guard = self.lock_open()?;
        let state = &mut *guard;
        let delivery = state
            .scheduler
            .schedule(message, state.delay, &mut state.queue);

        Ok(Submitted { delivery, accepted })
    }

    /// Writes a message and returns the number of bytes accepted.
    ///
    /// See [`Self::submit`] for details.
    pub fn write(&self, payload: &[u8]) -> Result<usize, RelayError> {
        self.submit(payload).map(|submitted| submitted.accepted)
    }

    /// Pops the oldest delivered message.
    ///
    /// Never blocks: `None` just means that there is nothing to read right now.
    pub fn read(&self) -> Option<Message> {
        let message = self.lock().queue.pop_front();
        tracing::trace!(group = self.id, len = ?message.as_ref().map(|m| m.len()), "read");
        message
    }

    /// Cancels a single delivery.
    ///
    /// Returns [`RelayError::AlreadyTerminal`] if the delivery has already
    /// fired or was cancelled before, which callers can safely ignore.
    pub fn cancel(&self, delivery: DeliveryId) -> Result<(), RelayError> {
        self.lock().scheduler.cancel(delivery)
    }

    /// Delivers a single pending message now, regardless of its delay.
    ///
    /// Returns once the delivery reached its terminal state.
    pub fn fire_now(&self, delivery: DeliveryId) -> Result<(), RelayError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.scheduler.fire(delivery, &mut state.queue)
    }

    /// Cancels all pending deliveries and returns how many were cancelled.
    ///
    /// Messages that have already been delivered stay in the queue.
    #[tracing::instrument(skip(self), fields(group = self.id))]
    pub fn revoke_all_pending(&self) -> usize {
        let revoked = self.lock().scheduler.cancel_all();
        tracing::debug!(revoked, "revoked delayed messages");
        revoked
    }

    /// Delivers all pending messages now, in the order they were written.
    #[tracing::instrument(skip(self), fields(group = self.id))]
    pub fn flush(&self) -> FlushOutcome {
        let mut guard = self.lock();
        let state = &mut *guard;
        let outcome = state.scheduler.fire_all(&mut state.queue);
        tracing::debug!(?outcome, "flushed delayed messages");
        outcome
    }

    /// Sleeps on the barrier of the group until [`Self::awake`] is called.
    ///
    /// There is no timeout: a thread that is never woken sleeps forever,
    /// unless the group is torn down, in which case [`RelayError::Closed`] is
    /// returned.
    #[tracing::instrument(skip(self), fields(group = self.id))]
    pub fn sleep(&self) -> Result<(), RelayError> {
        let (_state, wake) = self.barrier.park(self.lock());
        match wake {
            Wake::Released => Ok(()),
            Wake::Closed => Err(RelayError::Closed(self.id)),
        }
    }

    /// Wakes every thread sleeping on the barrier and returns how many there
    /// were.
    ///
    /// Waking a group nobody sleeps on has no effect.
    #[tracing::instrument(skip(self), fields(group = self.id))]
    pub fn awake(&self) -> usize {
        self.barrier.release_all(&mut self.lock().barrier)
    }

    /// Tears the group down.
    ///
    /// Cancels every pending delivery, wakes sleeping threads with
    /// [`RelayError::Closed`] and drops the queued messages. Later writes fail
    /// with [`RelayError::Closed`].
    pub(crate) fn shutdown(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        let cancelled = state.scheduler.cancel_all();
        let woken = self.barrier.close(&mut state.barrier);
        let dropped = state.queue.clear();
        tracing::debug!(group = self.id, cancelled, woken, dropped, "group shut down");
    }
}

impl Expire for Group {
    fn expire(&self, delivery: DeliveryId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.scheduler.expire(delivery, &mut state.queue) {
            Ok(()) | Err(RelayError::BudgetExceeded { .. }) => {}
            Err(RelayError::AlreadyTerminal(_)) => {
                tracing::trace!(group = self.id, delivery, "delivery was flushed or revoked");
            }
            Err(err) => {
                tracing::error!(group = self.id, delivery, %err, "unexpected delivery error");
            }
        }
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
