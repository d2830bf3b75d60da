use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc, Mutex, PoisonError, Weak,
    },
    thread::JoinHandle,
    time::Instant,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::scheduler::DeliveryId;

/// Receives expired deliveries from the timer thread.
pub(crate) trait Expire: Send + Sync {
    fn expire(&self, delivery: DeliveryId);
}

/// Identifies the target of timer entries, independent of the vtable.
///
/// Every entry holds a `Weak` to its target, which keeps the allocation and
/// therefore the address from being reused while the entry exists.
fn owner_of(target: &Weak<dyn Expire>) -> usize {
    target.as_ptr() as *const () as usize
}

enum TimerCommand {
    Schedule {
        deadline: Instant,
        delivery: DeliveryId,
        target: Weak<dyn Expire>,
    },
    /// Disarms the given deliveries of one target. `deliveries` is sorted.
    Cancel {
        owner: usize,
        deliveries: Vec<DeliveryId>,
    },
    Shutdown,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    owner: usize,
    delivery: DeliveryId,
    target: Weak<dyn Expire>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Cheap handle used by groups to arm the timer.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    sender: Sender<TimerCommand>,
}

impl TimerHandle {
    /// Arms the timer. At `deadline` the timer thread calls
    /// `target.expire(delivery)` unless the target is gone by then.
    ///
    /// Returns `false` if the timer has been shut down.
    pub fn schedule(&self, deadline: Instant, delivery: DeliveryId, target: Weak<dyn Expire>) -> bool {
        self.sender
            .send(TimerCommand::Schedule {
                deadline,
                delivery,
                target,
            })
            .is_ok()
    }

    /// Disarms deliveries of `target` that are no longer pending.
    ///
    /// Expiring a disarmed delivery is harmless, so this is best effort and
    /// does nothing once the timer has been shut down.
    pub fn cancel(&self, target: &Weak<dyn Expire>, mut deliveries: Vec<DeliveryId>) {
        if deliveries.is_empty() {
            return;
        }
        deliveries.sort_unstable();
        let _ = self.sender.send(TimerCommand::Cancel {
            owner: owner_of(target),
            deliveries,
        });
    }
}

/// The thread that waits out send delays for every group of a registry.
pub(crate) struct Timer {
    handle: TimerHandle,
    armed: Arc<AtomicUsize>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn spawn() -> Self {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let armed = Arc::new(AtomicUsize::new(0));
        let thread = {
            let armed = armed.clone();
            std::thread::spawn(move || Self::timer_thread(receiver, &armed))
        };

        Self {
            handle: TimerHandle { sender },
            armed,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// Number of entries the timer thread is currently waiting on.
    ///
    /// Updated by the timer thread after every command it processed, so it
    /// lags behind commands that are still in flight.
    pub fn armed(&self) -> usize {
        self.armed.load(AtomicOrdering::Relaxed)
    }

    /// Stops the timer thread and waits for it to exit.
    ///
    /// An expiry that is executing when this is called finishes before this
    /// function returns; entries that have not expired yet are dropped.
    pub fn shutdown(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(thread) = thread {
            let dropped = self.armed();
            // The receiver only disappears when the thread has exited already.
            let _ = self.handle.sender.send(TimerCommand::Shutdown);
            if thread.join().is_err() {
                tracing::error!("timer thread panicked");
            }
            tracing::debug!(dropped, "timer stopped");
        }
    }

    fn timer_thread(receiver: Receiver<TimerCommand>, armed: &AtomicUsize) {
        let mut entries = BinaryHeap::<Reverse<TimerEntry>>::new();
        let mut seq = 0u64;

        loop {
            let command = match entries.peek() {
                Some(Reverse(next)) => match receiver.recv_deadline(next.deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match receiver.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            match command {
                Some(TimerCommand::Schedule {
                    deadline,
                    delivery,
                    target,
                }) => {
                    entries.push(Reverse(TimerEntry {
                        deadline,
                        seq,
                        owner: owner_of(&target),
                        delivery,
                        target,
                    }));
                    seq += 1;
                }
                Some(TimerCommand::Cancel { owner, deliveries }) => {
                    let before = entries.len();
                    entries.retain(|Reverse(entry)| {
                        entry.owner != owner || deliveries.binary_search(&entry.delivery).is_err()
                    });
                    tracing::trace!(disarmed = before - entries.len(), "timer entries disarmed");
                }
                Some(TimerCommand::Shutdown) => break,
                None => {}
            }

            let now = Instant::now();
            while entries
                .peek()
                .is_some_and(|Reverse(next)| next.deadline <= now)
            {
                if let Some(Reverse(entry)) = entries.pop() {
                    match entry.target.upgrade() {
                        Some(target) => target.expire(entry.delivery),
                        None => tracing::trace!(delivery = entry.delivery, "target of expired delivery is gone"),
                    }
                }
            }
            armed.store(entries.len(), AtomicOrdering::Relaxed);
        }

        armed.store(0, AtomicOrdering::Relaxed);
        tracing::trace!(dropped = entries.len(), "timer thread exits");
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
