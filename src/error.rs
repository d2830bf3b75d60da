use crate::{registry::GroupId, scheduler::DeliveryId};

/// Indicates a failed group operation.
///
/// None of these conditions is fatal. Most of them never reach the writer of a
/// message: a delivery that exceeds the byte budget is only logged, and an
/// empty group is reported as `None` by [`Group::read`](crate::group::Group::read)
/// rather than as an error.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    /// The group does not exist, or the registry has already been shut down.
    #[error("Group {0} not found")]
    GroupNotFound(GroupId),

    /// Group names must be non-empty.
    #[error("Invalid group name {0:?}")]
    InvalidGroupName(String),

    /// Delivering the message would exceed the byte budget of the group.
    ///
    /// The message is discarded.
    #[error("Byte budget exceeded: {used} + {len} > {max}")]
    BudgetExceeded { len: usize, used: usize, max: usize },

    /// Copying a payload from or to the caller failed.
    #[error("Buffer fault: {0}")]
    BufferFault(#[source] std::io::Error),

    /// The delivery was already fired or cancelled.
    #[error("Delivery {0} already reached a terminal state")]
    AlreadyTerminal(DeliveryId),

    /// The group has been torn down.
    #[error("Group {0} is closed")]
    Closed(GroupId),

    /// The registry has been shut down and does not create groups anymore.
    #[error("Registry has been shut down")]
    ShutDown,
}

impl From<RelayError> for std::io::Error {
    fn from(err: RelayError) -> Self {
        let kind = match &err {
            RelayError::BufferFault(inner) => inner.kind(),
            RelayError::GroupNotFound(_) => std::io::ErrorKind::NotFound,
            RelayError::InvalidGroupName(_) => std::io::ErrorKind::InvalidInput,
            RelayError::Closed(_) | RelayError::ShutDown => std::io::ErrorKind::BrokenPipe,
            RelayError::BudgetExceeded { .. } | RelayError::AlreadyTerminal(_) => {
                std::io::ErrorKind::Other
            }
        };
        std::io::Error::new(kind, err)
    }
}
