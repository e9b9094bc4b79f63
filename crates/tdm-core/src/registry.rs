//! Registry of channel records.
//!
//! Constructed at startup and handed to the driver, the monitor and the trunk
//! engines. The list lock is only ever held to look records up or to copy the
//! list; no channel lock is taken while it is held.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MutexGuard, RwLock};

use crate::channel::{Channel, ChannelHandle};
use crate::types::ChannelId;

/// All channel records, keyed by channel number
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<BTreeMap<ChannelId, Arc<ChannelHandle>>>,
    generation: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, returning the one it replaced
    pub fn insert(&self, handle: Arc<ChannelHandle>) -> Option<Arc<ChannelHandle>> {
        let previous = self.channels.write().insert(handle.id(), handle);
        self.generation.fetch_add(1, Ordering::AcqRel);
        previous
    }

    pub fn remove(&self, id: ChannelId) -> Option<Arc<ChannelHandle>> {
        let removed = self.channels.write().remove(&id);
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn get(&self, id: ChannelId) -> Option<Arc<ChannelHandle>> {
        self.channels.read().get(&id).cloned()
    }

    /// Copy of the record list in channel order
    pub fn snapshot(&self) -> Vec<Arc<ChannelHandle>> {
        self.channels.read().values().cloned().collect()
    }

    /// Bumped on every structural change
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

/// Lock two distinct channels in channel-number order.
///
/// The guards come back in argument order.
pub fn lock_pair<'a>(a: &'a ChannelHandle, b: &'a ChannelHandle) -> (MutexGuard<'a, Channel>, MutexGuard<'a, Channel>) {
    debug_assert!(a.id() != b.id(), "lock_pair on a single channel");
    if a.id() < b.id() {
        let first = a.lock();
        let second = b.lock();
        (first, second)
    } else {
        let second = b.lock();
        let first = a.lock();
        (first, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::signaling::SignalingFamily;
    use crate::config::ChannelConfig;
    use crate::types::Descriptor;

    fn handle(n: u32) -> Arc<ChannelHandle> {
        let config = ChannelConfig::new(ChannelId(n), SignalingFamily::FxoLoopStart);
        Arc::new(ChannelHandle::new(Channel::new(config, Descriptor(n as i32), None)))
    }

    #[test]
    fn test_generation_tracks_structure() {
        let registry = ChannelRegistry::new();
        let start = registry.generation();
        registry.insert(handle(2));
        registry.insert(handle(1));
        assert_eq!(registry.generation(), start + 2);

        let ids: Vec<_> = registry.snapshot().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![ChannelId(1), ChannelId(2)]);

        assert!(registry.remove(ChannelId(9)).is_none());
        assert_eq!(registry.generation(), start + 2);
        assert!(registry.remove(ChannelId(1)).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lock_pair_returns_argument_order() {
        let a = handle(5);
        let b = handle(3);
        let (first, second) = lock_pair(&a, &b);
        assert_eq!(first.id(), ChannelId(5));
        assert_eq!(second.id(), ChannelId(3));
    }
}
