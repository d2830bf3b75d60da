//! Thread synchronization and messaging through named groups.
//!
//! This crate provides named message groups that threads use to exchange
//! small byte messages and to coordinate with each other. Groups are created
//! on demand by name through the [registry](registry::GroupRegistry) and live
//! until the registry is shut down. Each group offers two primitives:
//! - A FIFO mailbox. Writes can be delayed by a per-group send delay; delayed
//!   messages can be revoked before they arrive or flushed to arrive right
//!   away. Every group has a byte budget, deliveries that exceed it are
//!   dropped.
//! - A barrier. Threads [sleep](group::Group::sleep) on it until another
//!   thread [wakes](group::Group::awake) all of them at once.
//!
//! The [device](device::Device) front end exposes the same functionality as
//! file-like [handles](device::GroupHandle) driven by
//! [control commands](protocol).
//!
//! # Important Notes
//! <div class="warning">
//! Delivery is best effort: a delayed message that no longer fits into the
//! byte budget of its group when it is due is dropped without notifying the
//! writer. Sleeping on a barrier has no timeout.
//! </div>

pub(crate) mod barrier;
pub(crate) mod queue;
pub(crate) mod scheduler;
#[cfg(test)]
pub(crate) mod test;
pub(crate) mod timer;

pub mod config;
pub mod device;
pub mod error;
pub mod group;
pub mod protocol;
pub mod registry;

pub use queue::Message;
pub use scheduler::{DeliveryId, FlushOutcome};
