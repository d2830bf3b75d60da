//! Control commands.
//!
//! Every command consists of a one byte command code followed by a fixed
//! size body. All integers are in network byte order.

use std::time::Duration;

use zerocopy::{network_endian::U64, AsBytes, FromBytes, FromZeroes, Unaligned};

pub type CommandCode = u8;

pub mod code {
    use super::CommandCode;

    pub const INSTALL_GROUP: CommandCode = 1;
    pub const SET_SEND_DELAY: CommandCode = 2;
    pub const REVOKE_DELAYED_MESSAGES: CommandCode = 3;
    pub const SLEEP_ON_BARRIER: CommandCode = 4;
    pub const AWAKE_BARRIER: CommandCode = 5;
}

/// Size of the name field of [`InstallGroup`], including the terminating NUL.
pub const GROUP_NAME_SIZE: usize = 16;

pub trait CommandBody: AsBytes + FromBytes + FromZeroes + Unaligned {
    fn code() -> CommandCode;
}

macro_rules! impl_command_body {
    ($kind:ident) => {
        paste::paste! {
            impl CommandBody for $kind {
                fn code() -> CommandCode {
                    code::[< $kind:snake:upper >]
                }
            }
        }
    };
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid command code: {0}")]
    InvalidCommand(CommandCode),

    #[error("Invalid body size: expected {expected}, got {actual}")]
    InvalidBodySize { expected: usize, actual: usize },

    #[error("Invalid group name")]
    InvalidGroupName,
}

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct InstallGroup {
    pub name: [u8; GROUP_NAME_SIZE],
}
impl_command_body!(InstallGroup);

impl InstallGroup {
    /// Encodes `name`, which must be non-empty, free of NUL bytes and shorter
    /// than [`GROUP_NAME_SIZE`].
    pub fn new(name: &str) -> Result<Self, CommandError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= GROUP_NAME_SIZE || bytes.contains(&0) {
            return Err(CommandError::InvalidGroupName);
        }

        let mut install = Self::new_zeroed();
        install.name[..bytes.len()].copy_from_slice(bytes);
        Ok(install)
    }

    /// The group name up to the first NUL byte.
    pub fn name(&self) -> Result<&str, CommandError> {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(GROUP_NAME_SIZE);
        match std::str::from_utf8(&self.name[..len]) {
            Ok(name) if !name.is_empty() => Ok(name),
            _ => Err(CommandError::InvalidGroupName),
        }
    }
}

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SetSendDelay {
    pub millis: U64,
}
impl_command_body!(SetSendDelay);

impl SetSendDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            millis: U64::new(delay.as_millis().try_into().unwrap_or(u64::MAX)),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.millis.get())
    }
}

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct RevokeDelayedMessages {}
impl_command_body!(RevokeDelayedMessages);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct SleepOnBarrier {}
impl_command_body!(SleepOnBarrier);

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct AwakeBarrier {}
impl_command_body!(AwakeBarrier);

/// A decoded command referencing the bytes it was decoded from.
#[derive(Debug)]
pub enum Command<'a> {
    InstallGroup(&'a InstallGroup),
    SetSendDelay(&'a SetSendDelay),
    RevokeDelayedMessages,
    SleepOnBarrier,
    AwakeBarrier,
}

fn body_ref<T: CommandBody>(body: &[u8]) -> Result<&T, CommandError> {
    T::ref_from(body).ok_or(CommandError::InvalidBodySize {
        expected: std::mem::size_of::<T>(),
        actual: body.len(),
    })
}

impl<'a> Command<'a> {
    pub fn decode(code: CommandCode, body: &'a [u8]) -> Result<Self, CommandError> {
        match code {
            code::INSTALL_GROUP => Ok(Command::InstallGroup(body_ref(body)?)),
            code::SET_SEND_DELAY => Ok(Command::SetSendDelay(body_ref(body)?)),
            code::REVOKE_DELAYED_MESSAGES => {
                body_ref::<RevokeDelayedMessages>(body)?;
                Ok(Command::RevokeDelayedMessages)
            }
            code::SLEEP_ON_BARRIER => {
                body_ref::<SleepOnBarrier>(body)?;
                Ok(Command::SleepOnBarrier)
            }
            code::AWAKE_BARRIER => {
                body_ref::<AwakeBarrier>(body)?;
                Ok(Command::AwakeBarrier)
            }
            _ => Err(CommandError::InvalidCommand(code)),
        }
    }
}

/// Splits a command body into its code and bytes, ready for
/// [`Command::decode`].
pub fn encode<T: CommandBody>(body: &T) -> (CommandCode, &[u8]) {
    (T::code(), body.as_bytes())
}
