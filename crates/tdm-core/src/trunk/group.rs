//! Trunk group records and D-channel state.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{ChannelDesignator, TrunkProtocol};
use crate::channel::ChannelHandle;
use crate::config::TrunkConfig;
use crate::context::DriverContext;
use crate::error::Cause;
use crate::types::{ChannelId, LegIndex, TrunkGroupId};

/// State of one D-channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DChannelStatus {
    /// Configured, link state not yet known
    Provisioned,
    /// Physical link clear, protocol not yet up
    NotInAlarm,
    Up,
    Down,
}

/// A bearer channel at its position on a span
#[derive(Debug, Clone)]
pub struct BearerSlot {
    pub logical_span: u8,
    pub offset: u8,
    pub handle: Arc<ChannelHandle>,
}

/// Mutable group state, guarded by the group lock
#[derive(Debug)]
pub struct GroupState {
    pub dchannels: Vec<DChannelStatus>,
    /// D-channel currently carrying signalling
    pub active: Option<usize>,
    /// Bearer index of the restart in flight during a reset cycle
    pub reset_cursor: Option<usize>,
    /// A reset cycle is running
    pub resetting: bool,
    /// When the last reset cycle finished
    pub last_reset: Instant,
    pub last_idle_dial: Option<Instant>,
}

impl GroupState {
    fn new(dchannels: usize) -> Self {
        Self {
            dchannels: vec![DChannelStatus::Provisioned; dchannels],
            active: None,
            reset_cursor: None,
            resetting: false,
            last_reset: Instant::now(),
            last_idle_dial: None,
        }
    }

    pub fn is_up(&self) -> bool {
        self.dchannels.contains(&DChannelStatus::Up)
    }
}

/// One trunk group: spans sharing a protocol instance
pub struct TrunkGroup {
    id: TrunkGroupId,
    config: TrunkConfig,
    protocol: Arc<dyn TrunkProtocol>,
    bearers: Vec<BearerSlot>,
    crvs: Vec<(u16, Arc<ChannelHandle>)>,
    /// Logical span carrying each D-channel
    dchannel_spans: Vec<u8>,
    state: Mutex<GroupState>,
}

impl std::fmt::Debug for TrunkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrunkGroup")
            .field("id", &self.id)
            .field("bearers", &self.bearers.len())
            .field("crvs", &self.crvs.len())
            .finish_non_exhaustive()
    }
}

impl TrunkGroup {
    pub fn new(
        config: TrunkConfig,
        protocol: Arc<dyn TrunkProtocol>,
        bearers: Vec<BearerSlot>,
        crvs: Vec<(u16, Arc<ChannelHandle>)>,
    ) -> Self {
        let dchannel_spans: Vec<u8> = config
            .spans
            .iter()
            .flat_map(|span| span.dchannels.iter().map(move |_| span.logical_span))
            .collect();
        Self {
            id: config.group,
            state: Mutex::new(GroupState::new(dchannel_spans.len())),
            dchannel_spans,
            config,
            protocol,
            bearers,
            crvs,
        }
    }

    pub fn id(&self) -> TrunkGroupId {
        self.id
    }

    pub fn config(&self) -> &TrunkConfig {
        &self.config
    }

    pub fn protocol(&self) -> &Arc<dyn TrunkProtocol> {
        &self.protocol
    }

    pub fn bearers(&self) -> &[BearerSlot] {
        &self.bearers
    }

    /// Group lock; take it before any channel lock
    pub fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock()
    }

    pub fn is_up(&self) -> bool {
        self.state.lock().is_up()
    }

    pub fn dchannel_status(&self) -> Vec<DChannelStatus> {
        self.state.lock().dchannels.clone()
    }

    /// Every record of the group, bearers first
    pub fn records(&self) -> impl Iterator<Item = &Arc<ChannelHandle>> {
        self.bearers.iter().map(|b| &b.handle).chain(self.crvs.iter().map(|(_, h)| h))
    }

    pub fn record(&self, id: ChannelId) -> Option<&Arc<ChannelHandle>> {
        self.records().find(|h| h.id() == id)
    }

    /// Bearer addressed by span and offset; an implicit span is the active D-channel's
    pub fn bearer(&self, designator: ChannelDesignator) -> Option<&Arc<ChannelHandle>> {
        let span = if designator.explicit {
            designator.logical_span
        } else {
            let active = self.state.lock().active;
            active
                .and_then(|d| self.dchannel_spans.get(d).copied())
                .or_else(|| self.dchannel_spans.first().copied())?
        };
        self.bearers
            .iter()
            .find(|b| b.logical_span == span && b.offset == designator.offset)
            .map(|b| &b.handle)
    }

    pub fn crv(&self, crv: u16) -> Option<&Arc<ChannelHandle>> {
        self.crvs.iter().find(|(c, _)| *c == crv).map(|(_, h)| h)
    }

    /// Record currently bound to a protocol call
    pub fn find_call(&self, call: super::CallRef) -> Option<Arc<ChannelHandle>> {
        self.records()
            .find(|h| h.lock().trunk().and_then(|t| t.call) == Some(call))
            .cloned()
    }

    /// First bearer able to take a new call, scanning from the top when `descending`
    pub fn free_bearer(&self, descending: bool) -> Option<Arc<ChannelHandle>> {
        let free = |slot: &&BearerSlot| is_free(&slot.handle);
        let found = if descending {
            self.bearers.iter().rev().find(free)
        } else {
            self.bearers.iter().find(free)
        };
        found.map(|slot| slot.handle.clone())
    }

    /// Bearers with no call, owner or restart outstanding
    pub fn free_count(&self) -> usize {
        self.bearers.iter().filter(|slot| is_free(&slot.handle)).count()
    }

    /// Records carrying an administrative idle call not yet asked to clear
    pub fn idle_calls(&self) -> Vec<Arc<ChannelHandle>> {
        self.bearers
            .iter()
            .rev()
            .filter(|slot| {
                slot.handle
                    .lock()
                    .trunk()
                    .is_some_and(|t| t.idle_call && !t.idle_released)
            })
            .map(|slot| slot.handle.clone())
            .collect()
    }

    /// Raise or clear alarm on every record; raising tears every call down
    pub(crate) fn set_alarm(&self, ctx: &DriverContext, alarm: bool) {
        for handle in self.records() {
            let mut ch = handle.lock();
            ch.in_alarm = alarm;
            if !alarm {
                continue;
            }
            for index in LegIndex::ALL {
                if let Some(owner) = ch.owner(index) {
                    ctx.control.soft_hangup(owner, Cause::NetworkOutOfOrder);
                }
            }
            if let Some(trunk) = ch.trunk.as_mut() {
                if let Some(call) = trunk.call {
                    debug!("Destroying {} on {} after link loss", call, handle.id());
                    self.protocol.destroy_call(call);
                }
                trunk.reset_call();
                trunk.resetting = false;
            }
        }
        if alarm {
            warn!("{} in alarm, all calls cleared", self.id);
        } else {
            info!("{} alarm cleared", self.id);
        }
    }
}

/// Record can take a new call
pub(crate) fn is_free(handle: &ChannelHandle) -> bool {
    let ch = handle.lock();
    if ch.in_alarm() || !ch.is_unowned() {
        return false;
    }
    if ch.guard_until().is_some_and(|until| Instant::now() < until) {
        return false;
    }
    ch.trunk().is_some_and(|t| t.call.is_none() && !t.resetting && t.real_call.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, SignalingFamily, TrunkBinding};
    use crate::config::{ChannelConfig, SpanConfig};
    use crate::testing::MockTrunkProtocol;
    use crate::trunk::CallRef;
    use crate::types::{Descriptor, SpanId};

    fn group(bearers: u8) -> TrunkGroup {
        let id = TrunkGroupId(1);
        let span = SpanConfig {
            span: SpanId(1),
            logical_span: 0,
            dchannels: vec![ChannelId(24)],
            bearers: (1..=bearers as u32).map(ChannelId).collect(),
            crvs: Vec::new(),
        };
        let slots = (1..=bearers)
            .map(|offset| {
                let config = ChannelConfig::new(ChannelId(offset as u32), SignalingFamily::Pri);
                let binding = TrunkBinding::new(id, 0, offset, None);
                let channel = Channel::new(config, Descriptor(offset as i32), Some(binding));
                BearerSlot {
                    logical_span: 0,
                    offset,
                    handle: Arc::new(ChannelHandle::new(channel)),
                }
            })
            .collect();
        TrunkGroup::new(TrunkConfig::new(id, vec![span]), Arc::new(MockTrunkProtocol::new()), slots, Vec::new())
    }

    #[test]
    fn test_bearer_lookup_by_designator() {
        let group = group(3);
        let found = group.bearer(ChannelDesignator::new(0, 2)).unwrap();
        assert_eq!(found.id(), ChannelId(2));
        assert!(group.bearer(ChannelDesignator::new(1, 2)).is_none());
        assert!(group.bearer(ChannelDesignator::new(0, 9)).is_none());
        assert_eq!(group.bearer(ChannelDesignator::implicit(3)).unwrap().id(), ChannelId(3));
    }

    #[test]
    fn test_free_bearer_skips_busy_records() {
        let group = group(3);
        assert_eq!(group.free_count(), 3);
        group.bearers()[2].handle.lock().trunk.as_mut().unwrap().call = Some(CallRef(7));
        group.bearers()[0].handle.lock().trunk.as_mut().unwrap().resetting = true;

        assert_eq!(group.free_count(), 1);
        assert_eq!(group.free_bearer(true).unwrap().id(), ChannelId(2));
        assert_eq!(group.find_call(CallRef(7)).unwrap().id(), ChannelId(3));
    }

    #[test]
    fn test_dchannel_state_starts_provisioned() {
        let group = group(1);
        assert_eq!(group.dchannel_status(), vec![DChannelStatus::Provisioned]);
        assert!(!group.is_up());
    }
}
