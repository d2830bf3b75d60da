use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::{
    config::{ConfigError, RelayConfig},
    error::RelayError,
    group::Group,
    timer::Timer,
};

/// The identifier of a group.
///
/// Identifiers are assigned sequentially starting at 1 and are never reused
/// within the lifetime of a registry.
pub type GroupId = u64;

/// Owns every group of the process.
///
/// Groups are created on first use and live until the registry is shut down,
/// either explicitly through [`Self::shutdown`] or when it is dropped. Both
/// the name index and the id index are concurrent maps, so creating and
/// looking up groups is safe from any number of threads.
pub struct GroupRegistry {
    config: RelayConfig,
    groups: DashMap<String, Arc<Group>, ahash::RandomState>,
    ids: DashMap<GroupId, Arc<Group>, ahash::RandomState>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
    timer: Timer,
}

impl GroupRegistry {
    /// Creates a registry with the default configuration.
    pub fn new() -> Self {
        Self::with_valid_config(RelayConfig::default())
    }

    /// Creates a registry with the given configuration.
    ///
    /// See [`RelayConfig`] for the available options.
    pub fn with_config(config: RelayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: RelayConfig) -> Self {
        Self {
            config,
            groups: DashMap::default(),
            ids: DashMap::default(),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            timer: Timer::spawn(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Returns the group called `name`, creating it if it does not exist.
    ///
    /// Concurrent calls with the same name all observe the same group, which
    /// is constructed exactly once.
    #[tracing::instrument(skip(self))]
    pub fn create_or_get(&self, name: &str) -> Result<Arc<Group>, RelayError> {
        if name.is_empty() {
            return Err(RelayError::InvalidGroupName(name.to_owned()));
        }

        if let Some(group) = self.groups.get(name) {
            return Ok(group.clone());
        }

        match self.groups.entry(name.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                // Checked while holding the shard lock: shutdown clears each
                // shard after setting the flag, so nothing can be inserted
                // behind its back.
                if self.shut_down.load(Ordering::SeqCst) {
                    return Err(RelayError::ShutDown);
                }

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let group = Group::new(id, name.to_owned(), &self.config, self.timer.handle());
                self.ids.insert(id, group.clone());
                entry.insert(group.clone());

                tracing::debug!(group = id, "group created");
                Ok(group)
            }
        }
    }

    /// Looks up a group by its identifier.
    pub fn get(&self, id: GroupId) -> Result<Arc<Group>, RelayError> {
        self.ids
            .get(&id)
            .map(|group| group.clone())
            .ok_or(RelayError::GroupNotFound(id))
    }

    /// Looks up a group by its name.
    pub fn find(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(name).map(|group| group.clone())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Tears down every group.
    ///
    /// Pending deliveries are cancelled and the timer thread is joined, so no
    /// delivery is in flight once this returns. Threads sleeping on a barrier
    /// are woken with [`RelayError::Closed`]. Afterwards lookups fail with
    /// [`RelayError::GroupNotFound`] and no new groups are created.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut count = 0;
        self.groups.retain(|_, group| {
            group.shutdown();
            count += 1;
            false
        });
        self.ids.clear();
        self.timer.shutdown();

        tracing::debug!(groups = count, "registry shut down");
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GroupRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;
    use std::{collections::HashSet, thread, time::Duration};

    #[test]
    fn create_or_get_is_idempotent() -> Result<()> {
        init_logger();

        let registry = GroupRegistry::new();
        let first = registry.create_or_get("first")?;
        let second = registry.create_or_get("second")?;
        let again = registry.create_or_get("first")?;

        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.name(), "first");
        assert_eq!(registry.len(), 2);

        assert!(Arc::ptr_eq(&registry.get(2)?, &second));
        assert!(Arc::ptr_eq(&registry.find("second").unwrap(), &second));
        assert!(registry.find("third").is_none());
        assert!(matches!(registry.get(3), Err(RelayError::GroupNotFound(3))));

        Ok(())
    }

    #[test]
    fn rejects_empty_names() {
        init_logger();

        let registry = GroupRegistry::new();
        assert!(matches!(
            registry.create_or_get(""),
            Err(RelayError::InvalidGroupName(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_creation_yields_one_group() -> Result<()> {
        init_logger();

        let registry = GroupRegistry::new();
        let ids = thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let registry = &registry;
                    s.spawn(move || {
                        let name = if i % 2 == 0 { "even" } else { "odd" };
                        registry.create_or_get(name).map(|group| group.id())
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<std::result::Result<HashSet<_>, _>>()
        })?;

        assert_eq!(ids, HashSet::from([1, 2]));
        assert_eq!(registry.len(), 2);

        Ok(())
    }

    #[test]
    fn shutdown_releases_everything() -> Result<()> {
        init_logger();

        let registry = GroupRegistry::new();
        let group = registry.create_or_get("doomed")?;
        group.set_delay(Duration::from_millis(50));
        group.write(b"pending")?;

        registry.shutdown();
        assert!(registry.is_shut_down());
        assert!(registry.is_empty());
        assert!(matches!(registry.get(group.id()), Err(RelayError::GroupNotFound(_))));
        assert!(matches!(registry.create_or_get("new"), Err(RelayError::ShutDown)));

        thread::sleep(Duration::from_millis(100));
        assert!(group.read().is_none());
        assert_eq!(group.pending_len(), 0);

        // Shutting down twice is harmless.
        registry.shutdown();
        Ok(())
    }

    #[test]
    fn rejects_invalid_config() {
        let config = RelayConfig {
            max_message_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            GroupRegistry::with_config(config),
            Err(ConfigError::MessageSizeZero)
        ));
    }

    #[test]
    fn applies_config_to_new_groups() -> Result<()> {
        init_logger();

        let registry = GroupRegistry::with_config(RelayConfig {
            max_message_size: 4,
            max_storage_size: 8,
            default_delay: Duration::from_secs(60),
        })?;
        let group = registry.create_or_get("configured")?;

        assert_eq!(group.delay(), Duration::from_secs(60));
        assert_eq!(group.write(b"abcdef")?, 4);
        assert_eq!(group.write(b"ghij")?, 4);
        assert_eq!(group.write(b"klmn")?, 4);

        let outcome = group.flush();
        assert_eq!((outcome.delivered, outcome.dropped), (2, 1));
        assert_eq!(&*group.read().unwrap(), b"abcd");
        assert_eq!(&*group.read().unwrap(), b"ghij");
        assert!(group.read().is_none());

        Ok(())
    }
}
