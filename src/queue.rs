use std::{collections::VecDeque, ops::Deref};

use crate::error::RelayError;

/// A single message payload.
///
/// Messages are moved, never copied: from the writer into the delay
/// scheduler, from there into the queue of the group and finally to the
/// reader that pops it.
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    bytes: Box<[u8]>,
}

impl Message {
    /// Creates a message from the first `max_len` bytes of `payload`.
    pub(crate) fn truncated(payload: &[u8], max_len: usize) -> Self {
        let len = payload.len().min(max_len);
        Self {
            bytes: payload[..len].into(),
        }
    }

    pub fn into_bytes(self) -> Box<[u8]> {
        self.bytes
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }
}

impl Deref for Message {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// FIFO of delivered messages with a byte budget.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    messages: VecDeque<Message>,
    used: usize,
    max: usize,
}

impl MessageQueue {
    pub fn new(max_storage_size: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            used: 0,
            max: max_storage_size,
        }
    }

    /// Appends `message` if it fits into the remaining budget.
    ///
    /// On failure the queue is left untouched and the message is dropped.
    pub fn try_push(&mut self, message: Message) -> Result<(), RelayError> {
        let len = message.len();
        if self.used + len > self.max {
            return Err(RelayError::BudgetExceeded {
                len,
                used: self.used,
                max: self.max,
            });
        }

        self.used += len;
        self.messages.push_back(message);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Message> {
        let message = self.messages.pop_front()?;
        self.used -= message.len();
        Some(message)
    }

    /// Drops every queued message and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.messages.len();
        self.messages.clear();
        self.used = 0;
        count
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn used_bytes(&self) -> usize {
        debug_assert_eq!(
            self.used,
            self.messages.iter().map(|m| m.len()).sum::<usize>()
        );
        self.used
    }
}
