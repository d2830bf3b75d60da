//! Device front end.
//!
//! The [`Device`] is the entry point for clients: it installs groups, hands
//! out [`GroupHandle`]s and executes [control commands](crate::protocol). A
//! handle behaves like an open file of its group. Every
//! [`write`](std::io::Write::write) sends one message, every
//! [`read`](std::io::Read::read) receives one message (or nothing), and
//! closing the handle flushes the delayed messages of the group.
//!
//! # Example
//! ```
//! use synchmess::{device::Device, protocol::{self, InstallGroup, SetSendDelay}};
//! use std::{io::{Read, Write}, time::Duration};
//!
//! let device = Device::new();
//! let installed = device.install_group(&InstallGroup::new("first")?)?;
//!
//! let mut handle = device.open(installed.id)?;
//! let delay = SetSendDelay::new(Duration::from_secs(120));
//! let (code, body) = protocol::encode(&delay);
//! handle.control(code, body)?;
//! handle.write(b"First write")?;
//! drop(handle);
//!
//! let mut handle = device.open(installed.id)?;
//! let mut buf = [0; 50];
//! let len = handle.read(&mut buf)?;
//! assert_eq!(&buf[..len], b"First write");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{
    io::{Read, Write},
    sync::Arc,
};

use crate::{
    config::{ConfigError, RelayConfig},
    error::RelayError,
    group::Group,
    protocol::{Command, CommandCode, CommandError, InstallGroup},
    registry::{GroupId, GroupRegistry},
};

/// Prefix of the path under which installed groups are published.
pub const GROUP_PATH_PREFIX: &str = "/dev/synch/synchmess";

/// Indicates a failed control command.
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("Malformed command: {0}")]
    Command(#[from] CommandError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The command is valid, but not on this kind of handle.
    #[error("Command {0} is not supported here")]
    Unsupported(CommandCode),
}

/// A group installed through [`Device::install_group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledGroup {
    pub id: GroupId,
    pub path: String,
}

/// Result of a successful control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Installed(InstalledGroup),
    DelaySet,
    Revoked(usize),
    Woken,
    Awoken(usize),
}

pub struct Device {
    registry: GroupRegistry,
}

impl Device {
    pub fn new() -> Self {
        Self {
            registry: GroupRegistry::new(),
        }
    }

    pub fn with_config(config: RelayConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            registry: GroupRegistry::with_config(config)?,
        })
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    /// Creates the group named in `request`, or returns the existing one.
    #[tracing::instrument(skip(self, request))]
    pub fn install_group(&self, request: &InstallGroup) -> Result<InstalledGroup, ControlError> {
        let group = self.registry.create_or_get(request.name()?)?;
        Ok(InstalledGroup {
            id: group.id(),
            path: format!("{GROUP_PATH_PREFIX}{}", group.id()),
        })
    }

    /// Opens a handle to an installed group.
    pub fn open(&self, id: GroupId) -> Result<GroupHandle, RelayError> {
        let group = self.registry.get(id)?;
        tracing::trace!(group = id, "group opened");
        Ok(GroupHandle { group })
    }

    /// Executes a device level command. Only group installation is one.
    pub fn control(&self, code: CommandCode, body: &[u8]) -> Result<ControlReply, ControlError> {
        match Command::decode(code, body)? {
            Command::InstallGroup(request) => {
                self.install_group(request).map(ControlReply::Installed)
            }
            _ => Err(ControlError::Unsupported(code)),
        }
    }

    /// Tears down every group, see [`GroupRegistry::shutdown`].
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

/// An open group.
///
/// Dropping the handle flushes the delayed messages of the group.
pub struct GroupHandle {
    group: Arc<Group>,
}

impl GroupHandle {
    pub fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// Reads one message from `reader` and writes it to the group.
    ///
    /// At most the maximum message size is read, anything beyond is left in
    /// the reader. Returns the number of bytes accepted.
    pub fn write_from<R: Read>(&self, reader: R) -> Result<usize, RelayError> {
        let max_len = self.group.max_message_size();
        let mut payload = Vec::with_capacity(max_len);
        reader
            .take(max_len as u64)
            .read_to_end(&mut payload)
            .map_err(RelayError::BufferFault)?;
        self.group.write(&payload)
    }

    /// Pops one message and copies up to `max_len` bytes of it to `writer`.
    ///
    /// The rest of the message is discarded. Returns the number of bytes
    /// copied, zero if there was no message. If `writer` fails, the message
    /// is lost and [`RelayError::BufferFault`] is returned.
    pub fn read_into<W: Write>(&self, mut writer: W, max_len: usize) -> Result<usize, RelayError> {
        let Some(message) = self.group.read() else {
            return Ok(0);
        };

        let len = message.len().min(max_len);
        if len < message.len() {
            tracing::debug!(group = self.group.id(), len, discarded = message.len() - len, "partial read");
        }
        writer
            .write_all(&message[..len])
            .map_err(RelayError::BufferFault)?;
        Ok(len)
    }

    /// Executes a group level command.
    ///
    /// [`SleepOnBarrier`](crate::protocol::SleepOnBarrier) blocks until the
    /// group is woken up.
    #[tracing::instrument(skip(self, body), fields(group = self.group.id()))]
    pub fn control(&self, code: CommandCode, body: &[u8]) -> Result<ControlReply, ControlError> {
        match Command::decode(code, body)? {
            Command::InstallGroup(_) => Err(ControlError::Unsupported(code)),
            Command::SetSendDelay(delay) => {
                self.group.set_delay(delay.delay());
                Ok(ControlReply::DelaySet)
            }
            Command::RevokeDelayedMessages => {
                Ok(ControlReply::Revoked(self.group.revoke_all_pending()))
            }
            Command::SleepOnBarrier => {
                self.group.sleep()?;
                Ok(ControlReply::Woken)
            }
            Command::AwakeBarrier => Ok(ControlReply::Awoken(self.group.awake())),
        }
    }
}

impl Read for GroupHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let max_len = buf.len();
        let mut out = buf;
        Ok(self.read_into(&mut out, max_len)?)
    }
}

impl Write for GroupHandle {
    /// Sends `buf` as a single message.
    ///
    /// Returns the number of bytes accepted, which is less than `buf.len()`
    /// when the message had to be truncated. The remaining bytes are not
    /// meant to be written again, so this should not be used with
    /// [`Write::write_all`].
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.group.write(buf)?)
    }

    /// Delivers all delayed messages of the group now.
    fn flush(&mut self) -> std::io::Result<()> {
        self.group.flush();
        Ok(())
    }
}

impl Drop for GroupHandle {
    fn drop(&mut self) {
        let outcome = self.group.flush();
        tracing::trace!(group = self.group.id(), ?outcome, "group closed");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        protocol::{self, AwakeBarrier, RevokeDelayedMessages, SetSendDelay, SleepOnBarrier},
        test::*,
    };
    use std::{thread, time::Duration};

    struct FaultyIo;

    impl Read for FaultyIo {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::InvalidData.into())
        }
    }

    impl Write for FaultyIo {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::InvalidData.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn install_is_idempotent() -> Result<()> {
        init_logger();

        let device = Device::new();
        let first = device.install_group(&InstallGroup::new("first")?)?;
        let again = device.install_group(&InstallGroup::new("first")?)?;
        let second = device.install_group(&InstallGroup::new("second")?)?;

        assert_eq!(first, again);
        assert_eq!(first.id, 1);
        assert_eq!(first.path, "/dev/synch/synchmess1");
        assert_eq!(second.id, 2);

        let install = InstallGroup::new("third")?;
        let (code, body) = protocol::encode(&install);
        match device.control(code, body)? {
            ControlReply::Installed(installed) => assert_eq!(installed.id, 3),
            other => panic!("unexpected reply: {other:?}"),
        }

        let awake_barrier = AwakeBarrier {};
        let (code, body) = protocol::encode(&awake_barrier);
        assert!(matches!(
            device.control(code, body),
            Err(ControlError::Unsupported(_))
        ));

        Ok(())
    }

    #[test]
    fn read_write_through_handles() -> Result<()> {
        init_logger();

        let device = Device::new();
        let installed = device.install_group(&InstallGroup::new("rw")?)?;
        let mut handle = device.open(installed.id)?;

        assert_eq!(handle.write(b"First write")?, 11);
        assert_eq!(handle.write(b"Second write")?, 12);

        let mut buf = [0; 50];
        let len = handle.read(&mut buf)?;
        assert_eq!(&buf[..len], b"First write");

        // Short buffers get a prefix and the rest of the message is gone.
        let mut short = [0; 6];
        assert_eq!(handle.read(&mut short)?, 6);
        assert_eq!(&short, b"Second");
        assert_eq!(handle.read(&mut buf)?, 0);

        assert!(matches!(device.open(42), Err(RelayError::GroupNotFound(42))));
        Ok(())
    }

    #[test]
    fn close_flushes_delayed_messages() -> Result<()> {
        init_logger();

        let device = Device::new();
        let installed = device.install_group(&InstallGroup::new("close")?)?;

        let mut handle = device.open(installed.id)?;
        let delay = SetSendDelay::new(Duration::from_millis(120_000));
        let (code, body) = protocol::encode(&delay);
        assert_eq!(handle.control(code, body)?, ControlReply::DelaySet);

        handle.write(b"First write")?;
        handle.write(b"Second write")?;
        let mut buf = [0; 50];
        assert_eq!(handle.read(&mut buf)?, 0);
        drop(handle);

        let mut handle = device.open(installed.id)?;
        let len = handle.read(&mut buf)?;
        assert_eq!(&buf[..len], b"First write");
        let len = handle.read(&mut buf)?;
        assert_eq!(&buf[..len], b"Second write");

        Ok(())
    }

    #[test]
    fn revoke_through_control() -> Result<()> {
        init_logger();

        let device = Device::new();
        let installed = device.install_group(&InstallGroup::new("revoke")?)?;
        let handle = device.open(installed.id)?;

        let delay = SetSendDelay::new(Duration::from_secs(60));
        let (code, body) = protocol::encode(&delay);
        handle.control(code, body)?;
        handle.write_from(&b"doomed"[..])?;

        let revoke_delayed_messages = RevokeDelayedMessages {};
        let (code, body) = protocol::encode(&revoke_delayed_messages);
        assert_eq!(handle.control(code, body)?, ControlReply::Revoked(1));

        let mut out = vec![];
        assert_eq!(handle.read_into(&mut out, 50)?, 0);
        assert!(out.is_empty());

        let install = InstallGroup::new("nested")?;
        let (code, body) = protocol::encode(&install);
        assert!(matches!(
            handle.control(code, body),
            Err(ControlError::Unsupported(_))
        ));

        Ok(())
    }

    #[test]
    fn buffer_faults_are_reported() -> Result<()> {
        init_logger();

        let device = Device::new();
        let installed = device.install_group(&InstallGroup::new("faults")?)?;
        let handle = device.open(installed.id)?;

        assert!(matches!(
            handle.write_from(FaultyIo),
            Err(RelayError::BufferFault(_))
        ));
        assert_eq!(handle.group().pending_len(), 0);
        assert_eq!(handle.group().queued_len(), 0);

        handle.write_from(&[7u8; 80][..])?;
        assert_eq!(handle.group().queued_bytes(), 50);
        assert!(matches!(
            handle.read_into(FaultyIo, 50),
            Err(RelayError::BufferFault(_))
        ));
        assert_eq!(handle.group().queued_len(), 0);

        Ok(())
    }

    #[test]
    fn sleep_and_awake_through_control() -> Result<()> {
        init_logger();

        let device = Device::new();
        let installed = device.install_group(&InstallGroup::new("barrier")?)?;

        thread::scope(|s| -> Result<()> {
            let mut sleepers = vec![];
            for _ in 0..2 {
                let handle = device.open(installed.id)?;
                sleepers.push(s.spawn(move || {
                    let sleep_on_barrier = SleepOnBarrier {};
                    let (code, body) = protocol::encode(&sleep_on_barrier);
                    handle.control(code, body)
                }));
            }

            let handle = device.open(installed.id)?;
            assert!(wait_until(Duration::from_secs(5), || {
                handle.group().sleepers() == 2
            }));

            let awake_barrier = AwakeBarrier {};
            let (code, body) = protocol::encode(&awake_barrier);
            assert_eq!(handle.control(code, body)?, ControlReply::Awoken(2));

            for sleeper in sleepers {
                assert_eq!(sleeper.join().unwrap()?, ControlReply::Woken);
            }
            Ok(())
        })
    }

    #[test]
    fn shutdown_invalidates_handles() -> Result<()> {
        init_logger();

        let device = Device::new();
        let installed = device.install_group(&InstallGroup::new("stale")?)?;
        let mut handle = device.open(installed.id)?;

        device.shutdown();
        assert!(matches!(
            device.open(installed.id),
            Err(RelayError::GroupNotFound(_))
        ));
        let err = handle.write(b"late").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        Ok(())
    }
}
