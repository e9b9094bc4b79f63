//! Shared handles passed to every channel operation.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::collaborator::CallControl;
use crate::config::TimingConfig;
use crate::line::LineInterface;
use crate::types::{ChannelId, OwnerId};

/// Collaborator handles and the owner index shared by the driver's tasks
pub struct DriverContext {
    pub line: Arc<dyn LineInterface>,
    pub control: Arc<dyn CallControl>,
    pub timing: TimingConfig,

    /// Which channel record each owner is attached to.
    ///
    /// Entries are only inserted or removed while holding that channel's lock.
    pub owners: DashMap<OwnerId, ChannelId>,

    /// Wakes the monitor so it rebuilds its poll set
    pub monitor_wake: Notify,
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("timing", &self.timing)
            .field("owners", &self.owners)
            .finish_non_exhaustive()
    }
}

impl DriverContext {
    pub fn new(line: Arc<dyn LineInterface>, control: Arc<dyn CallControl>, timing: TimingConfig) -> Self {
        Self {
            line,
            control,
            timing,
            owners: DashMap::new(),
            monitor_wake: Notify::new(),
        }
    }

    /// Channel an owner is attached to
    pub fn channel_of(&self, owner: OwnerId) -> Option<ChannelId> {
        self.owners.get(&owner).map(|entry| *entry.value())
    }

    pub fn wake_monitor(&self) {
        self.monitor_wake.notify_one();
    }
}
