//! Binding protocol calls to channel records.
//!
//! An event names a channel designator and a call reference. The designator
//! picks the "principle" record. When the call is bound to a different record
//! (the far end moved it, or both ends seized at once) the call is rebound to
//! the principle record under both channel locks, so no observer ever sees two
//! records claiming the same call or owner.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::group::TrunkGroup;
use super::protocol::{CallRef, ChannelDesignator};
use crate::channel::{Channel, ChannelHandle, TrunkBinding};
use crate::context::DriverContext;
use crate::registry::lock_pair;
use crate::types::LegIndex;

/// Record addressed by a designator, binding a call-reference record to its bearer
pub fn principle(group: &TrunkGroup, designator: ChannelDesignator) -> Option<Arc<ChannelHandle>> {
    let Some(crv) = designator.crv else {
        return group.bearer(designator).cloned();
    };
    let record = group.crv(crv)?.clone();
    if designator.offset > 0 {
        let bearer_designator = ChannelDesignator { crv: None, ..designator };
        match group.bearer(bearer_designator) {
            Some(bearer) => assign_bearer(&record, bearer),
            None => warn!("Call reference {} names missing bearer {}", crv, bearer_designator),
        }
    }
    Some(record)
}

/// Let a call-reference record ride on a bearer
pub fn assign_bearer(record: &ChannelHandle, bearer: &ChannelHandle) {
    let (mut crv, mut carrier) = lock_pair(record, bearer);
    let already = crv.trunk.as_ref().and_then(|t| t.bearer) == Some(carrier.id());
    if already {
        return;
    }
    let Some(physical) = carrier.physical() else {
        return;
    };
    if crv.trunk.as_ref().is_some_and(|t| t.bearer.is_some()) {
        warn!("{} already rides a bearer, not moving it to {}", crv.id(), carrier.id());
        return;
    }
    let parked = crv.legs.set_physical(physical);
    let crv_id = crv.id();
    let carrier_id = carrier.id();
    if let Some(trunk) = crv.trunk.as_mut() {
        trunk.parked = parked;
        trunk.bearer = Some(carrier_id);
    }
    if let Some(trunk) = carrier.trunk.as_mut() {
        trunk.real_call = Some(crv_id);
    }
    debug!("{} now rides bearer {}", crv_id, carrier_id);
}

/// Undo [`assign_bearer`]
pub fn release_bearer(record: &mut Channel, bearer: &mut Channel) {
    if let Some(trunk) = bearer.trunk.as_mut() {
        trunk.real_call = None;
    }
    let parked = record.trunk.as_mut().and_then(|t| {
        t.bearer = None;
        t.parked.take()
    });
    if let Some(parked) = parked {
        record.legs.set_physical(parked);
    }
    debug!("{} released bearer {}", record.id(), bearer.id());
}

fn holds(channel: &Channel, call: CallRef) -> bool {
    channel.trunk.as_ref().and_then(|t| t.call) == Some(call)
}

fn move_call(from: &mut TrunkBinding, to: &mut TrunkBinding) {
    to.call = from.call.take();
    to.idle_call = from.idle_call;
    to.proceeding = from.proceeding;
    to.progress = from.progress;
    to.alerting = from.alerting;
    to.setup_ack = from.setup_ack;
    to.already_hungup = from.already_hungup;
    to.overlap_since = from.overlap_since;
    to.queued_digits = std::mem::take(&mut from.queued_digits);
    to.idle_answered = from.idle_answered.take();
    from.reset_call();
}

/// Make sure `call` is bound to `target`, moving it from whichever record holds it.
///
/// Returns the record the event applies to, or `None` when no record holds
/// the call or the target is busy with another call.
pub fn fixup(
    group: &TrunkGroup,
    ctx: &DriverContext,
    target: &Arc<ChannelHandle>,
    call: CallRef,
) -> Option<Arc<ChannelHandle>> {
    {
        let ch = target.lock();
        if holds(&ch, call) {
            return Some(target.clone());
        }
        // A bearer carrying a call-reference record answers for that record's call
        if let Some(real) = ch.trunk.as_ref().and_then(|t| t.real_call) {
            drop(ch);
            if group.record(real).is_some_and(|r| holds(&r.lock(), call)) {
                return Some(target.clone());
            }
        }
    }

    let Some(holder) = group.find_call(call) else {
        warn!("{} is not bound to any channel of {}", call, group.id());
        return None;
    };
    if Arc::ptr_eq(&holder, target) {
        return Some(holder);
    }

    let (mut from, mut to) = lock_pair(&holder, target);
    if !holds(&from, call) {
        warn!("{} moved while being fixed up", call);
        return None;
    }
    let target_busy = !to.is_unowned() || to.trunk.as_ref().is_some_and(|t| t.call.is_some());
    if target_busy {
        warn!("{} wants {} but it is busy", call, to.id());
        return None;
    }

    let leg = std::mem::take(from.legs.call_mut(LegIndex::Real));
    *to.legs.call_mut(LegIndex::Real) = leg;
    if let (Some(src), Some(dst)) = (from.trunk.as_mut(), to.trunk.as_mut()) {
        move_call(src, dst);
    }
    to.exten = std::mem::take(&mut from.exten);
    to.caller = std::mem::take(&mut from.caller);
    to.outgoing = std::mem::replace(&mut from.outgoing, false);
    to.dialing = std::mem::replace(&mut from.dialing, false);
    if let Some(owner) = to.owner(LegIndex::Real) {
        ctx.owners.insert(owner, to.id());
    }
    info!("Moved {} from {} to {}", call, from.id(), to.id());
    Some(target.clone())
}

/// Resolve an event's designator and call to the record it applies to
pub fn resolve(
    group: &TrunkGroup,
    ctx: &DriverContext,
    designator: ChannelDesignator,
    call: CallRef,
) -> Option<Arc<ChannelHandle>> {
    let Some(target) = principle(group, designator) else {
        warn!("{} names unconfigured channel {} on {}", call, designator, group.id());
        return None;
    };
    fixup(group, ctx, &target, call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SignalingFamily;
    use crate::config::{ChannelConfig, CrvConfig, SpanConfig, TrunkConfig};
    use crate::testing::{MockCallControl, MockLine, MockTrunkProtocol};
    use crate::trunk::group::BearerSlot;
    use crate::types::{CallState, ChannelId, Descriptor, OwnerId, SpanId, TrunkGroupId};

    fn record(n: u32, offset: u8, crv: Option<u16>) -> Arc<ChannelHandle> {
        let config = ChannelConfig::new(ChannelId(n), SignalingFamily::Pri);
        let binding = TrunkBinding::new(TrunkGroupId(1), 0, offset, crv);
        Arc::new(ChannelHandle::new(Channel::new(config, Descriptor(n as i32), Some(binding))))
    }

    fn group() -> TrunkGroup {
        let span = SpanConfig {
            span: SpanId(1),
            logical_span: 0,
            dchannels: vec![ChannelId(24)],
            bearers: vec![ChannelId(1), ChannelId(2)],
            crvs: vec![CrvConfig {
                crv: 5,
                channel: ChannelId(100),
            }],
        };
        let bearers = (1..=2)
            .map(|n| BearerSlot {
                logical_span: 0,
                offset: n as u8,
                handle: record(n, n as u8, None),
            })
            .collect();
        TrunkGroup::new(
            TrunkConfig::new(TrunkGroupId(1), vec![span]),
            Arc::new(MockTrunkProtocol::new()),
            bearers,
            vec![(5, record(100, 0, Some(5)))],
        )
    }

    fn context() -> DriverContext {
        DriverContext::new(Arc::new(MockLine::new()), Arc::new(MockCallControl::new()), Default::default())
    }

    #[test]
    fn test_fixup_moves_call_and_owner_atomically() {
        let group = group();
        let ctx = context();
        let holder = group.bearers()[0].handle.clone();
        let target = group.bearers()[1].handle.clone();
        {
            let mut ch = holder.lock();
            ch.legs.call_mut(LegIndex::Real).owner = Some(OwnerId(42));
            ch.legs.set_state(LegIndex::Real, CallState::Dialing);
            ch.trunk.as_mut().unwrap().call = Some(CallRef(9));
            ch.trunk.as_mut().unwrap().proceeding = true;
            ctx.owners.insert(OwnerId(42), ch.id());
        }

        let resolved = fixup(&group, &ctx, &target, CallRef(9)).unwrap();
        assert_eq!(resolved.id(), ChannelId(2));

        let from = holder.lock();
        let to = target.lock();
        assert!(from.is_unowned());
        assert_eq!(from.trunk().unwrap().call, None);
        assert_eq!(to.owner(LegIndex::Real), Some(OwnerId(42)));
        assert_eq!(to.state(LegIndex::Real), CallState::Dialing);
        assert_eq!(to.trunk().unwrap().call, Some(CallRef(9)));
        assert!(to.trunk().unwrap().proceeding);
        assert_eq!(ctx.channel_of(OwnerId(42)), Some(ChannelId(2)));
    }

    #[test]
    fn test_fixup_refuses_busy_target() {
        let group = group();
        let ctx = context();
        let holder = group.bearers()[0].handle.clone();
        let target = group.bearers()[1].handle.clone();
        holder.lock().trunk.as_mut().unwrap().call = Some(CallRef(9));
        target.lock().trunk.as_mut().unwrap().call = Some(CallRef(10));

        assert!(fixup(&group, &ctx, &target, CallRef(9)).is_none());
        assert_eq!(holder.lock().trunk().unwrap().call, Some(CallRef(9)));
    }

    #[test]
    fn test_unknown_call_is_not_resolved() {
        let group = group();
        let ctx = context();
        assert!(resolve(&group, &ctx, ChannelDesignator::new(0, 1), CallRef(77)).is_none());
        assert!(resolve(&group, &ctx, ChannelDesignator::new(0, 9), CallRef(77)).is_none());
    }

    #[test]
    fn test_crv_designator_binds_bearer() {
        let group = group();
        let record = principle(&group, ChannelDesignator::new(0, 2).with_crv(5)).unwrap();
        assert_eq!(record.id(), ChannelId(100));

        let crv = record.lock();
        assert_eq!(crv.physical(), Some(Descriptor(2)));
        assert_eq!(crv.trunk().unwrap().bearer, Some(ChannelId(2)));
        assert_eq!(crv.trunk().unwrap().parked, Some(Descriptor(100)));
        drop(crv);
        let bearer = group.bearers()[1].handle.lock();
        assert_eq!(bearer.trunk().unwrap().real_call, Some(ChannelId(100)));
    }
}
