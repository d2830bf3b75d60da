use std::{
    collections::BTreeMap,
    sync::Weak,
    time::{Duration, Instant},
};

use crate::{
    error::RelayError,
    queue::{Message, MessageQueue},
    registry::GroupId,
    timer::{Expire, TimerHandle},
};

/// Identifies a deferred delivery within its group.
///
/// Identifiers increase with every write, so ordering by identifier is
/// ordering by submission.
pub type DeliveryId = u64;

#[derive(Debug)]
struct PendingDelivery {
    payload: Message,
    /// `None` if the delay reaches past what [`Instant`] can represent. Such
    /// a delivery never expires and only leaves by flush or revoke.
    fire_at: Option<Instant>,
}

/// Outcome of firing all pending deliveries at once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Messages moved into the queue.
    pub delivered: usize,
    /// Messages dropped because the byte budget was exhausted.
    pub dropped: usize,
}

/// Deferred deliveries of a single group.
///
/// The scheduler lives inside the locked state of its group, so firing and
/// cancelling an entry always happen under the group lock. Whichever comes
/// first removes the entry from `pending`; the other one finds nothing and
/// reports [`RelayError::AlreadyTerminal`].
pub(crate) struct DelayScheduler {
    group: GroupId,
    timer: TimerHandle,
    target: Weak<dyn Expire>,
    next_delivery: DeliveryId,
    pending: BTreeMap<DeliveryId, PendingDelivery>,
}

impl DelayScheduler {
    pub fn new(group: GroupId, timer: TimerHandle, target: Weak<dyn Expire>) -> Self {
        Self {
            group,
            timer,
            target,
            next_delivery: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Schedules `payload` for delivery into `queue` after `delay`.
    ///
    /// A zero delay delivers right away, before this function returns.
    pub fn schedule(
        &mut self,
        payload: Message,
        delay: Duration,
        queue: &mut MessageQueue,
    ) -> DeliveryId {
        let delivery = self.next_delivery;
        self.next_delivery += 1;

        let fire_at = Instant::now().checked_add(delay);
        self.pending
            .insert(delivery, PendingDelivery { payload, fire_at });

        let Some(fire_at) = fire_at else {
            tracing::debug!(
                group = self.group,
                delivery,
                ?delay,
                "delay out of range, delivery never expires"
            );
            return delivery;
        };

        if delay.is_zero() {
            // Budget rejections are already logged by deliver().
            let _ = self.deliver(delivery, queue);
        } else if !self.timer.schedule(fire_at, delivery, self.target.clone()) {
            // Without a timer the entry can still be flushed or revoked.
            tracing::error!(group = self.group, delivery, "timer is not running");
        } else {
            tracing::trace!(group = self.group, delivery, ?delay, "delivery scheduled");
        }

        delivery
    }

    /// Moves the payload of `delivery` into `queue` ahead of its deadline.
    ///
    /// The entry reaches its terminal state in any case: if the queue rejects
    /// the payload, it is dropped and [`RelayError::BudgetExceeded`] is
    /// returned.
    pub fn fire(
        &mut self,
        delivery: DeliveryId,
        queue: &mut MessageQueue,
    ) -> Result<(), RelayError> {
        let result = self.deliver(delivery, queue);
        if !matches!(result, Err(RelayError::AlreadyTerminal(_))) {
            self.timer.cancel(&self.target, vec![delivery]);
        }
        result
    }

    /// Moves the payload of `delivery` into `queue` once its timer expired.
    pub fn expire(
        &mut self,
        delivery: DeliveryId,
        queue: &mut MessageQueue,
    ) -> Result<(), RelayError> {
        self.deliver(delivery, queue)
    }

    fn deliver(
        &mut self,
        delivery: DeliveryId,
        queue: &mut MessageQueue,
    ) -> Result<(), RelayError> {
        let entry = self
            .pending
            .remove(&delivery)
            .ok_or(RelayError::AlreadyTerminal(delivery))?;

        let len = entry.payload.len();
        let late = entry
            .fire_at
            .map(|fire_at| Instant::now().saturating_duration_since(fire_at));
        match queue.try_push(entry.payload) {
            Ok(()) => {
                tracing::trace!(group = self.group, delivery, len, ?late, "delivered");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(group = self.group, delivery, %err, "message dropped");
                Err(err)
            }
        }
    }

    /// Fires every pending delivery in submission order.
    pub fn fire_all(&mut self, queue: &mut MessageQueue) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let mut fired = Vec::with_capacity(self.pending.len());
        while let Some((delivery, _)) = self.pending.first_key_value() {
            let delivery = *delivery;
            fired.push(delivery);
            match self.deliver(delivery, queue) {
                Ok(()) => outcome.delivered += 1,
                Err(_) => outcome.dropped += 1,
            }
        }
        self.timer.cancel(&self.target, fired);
        outcome
    }

    /// Cancels `delivery` and drops its payload.
    pub fn cancel(&mut self, delivery: DeliveryId) -> Result<(), RelayError> {
        match self.pending.remove(&delivery) {
            Some(_) => {
                self.timer.cancel(&self.target, vec![delivery]);
                tracing::trace!(group = self.group, delivery, "delivery cancelled");
                Ok(())
            }
            None => Err(RelayError::AlreadyTerminal(delivery)),
        }
    }

    /// Cancels every pending delivery and returns how many there were.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = std::mem::take(&mut self.pending);
        self.timer.cancel(&self.target, cancelled.keys().copied().collect());
        cancelled.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
