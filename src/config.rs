use std::time::Duration;

/// Indicates an error within the relay configuration.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The maximum message size is zero.
    #[error("Maximum message size must be greater than zero")]
    MessageSizeZero,

    /// The per-group storage budget is zero.
    #[error("Maximum storage size must be greater than zero")]
    StorageSizeZero,

    /// A single message would never fit into the storage budget.
    #[error("Maximum message size ({message}) exceeds maximum storage size ({storage})")]
    MessageLargerThanStorage { message: usize, storage: usize },
}

/// Process-wide tunables, fixed when the registry is created.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The maximum size of a single message in bytes.
    ///
    /// Longer writes are truncated silently.
    ///
    /// The default is 50 bytes.
    pub max_message_size: usize,

    /// The maximum number of bytes queued per group.
    ///
    /// Deliveries that would exceed this budget are dropped.
    ///
    /// The default is 500 bytes.
    pub max_storage_size: usize,

    /// The send delay a newly created group starts with.
    ///
    /// The default is zero, i.e., messages are delivered immediately.
    pub default_delay: Duration,
}

impl RelayConfig {
    /// Validates the configuration.
    ///
    /// See [`RelayConfig`] and [`ConfigError`] for details.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::MessageSizeZero);
        }

        if self.max_storage_size == 0 {
            return Err(ConfigError::StorageSizeZero);
        }

        if self.max_message_size > self.max_storage_size {
            return Err(ConfigError::MessageLargerThanStorage {
                message: self.max_message_size,
                storage: self.max_storage_size,
            });
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_size: 50,
            max_storage_size: 500,
            default_delay: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RelayConfig::default();
        assert_eq!(config.max_message_size, 50);
        assert_eq!(config.max_storage_size, 500);
        assert_eq!(config.default_delay, Duration::ZERO);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_invalid_sizes() {
        let config = RelayConfig {
            max_message_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MessageSizeZero));

        let config = RelayConfig {
            max_storage_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::StorageSizeZero));

        let config = RelayConfig {
            max_message_size: 64,
            max_storage_size: 32,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MessageLargerThanStorage {
                message: 64,
                storage: 32
            })
        );
    }
}
