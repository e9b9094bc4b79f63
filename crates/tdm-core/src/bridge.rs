//! Native (hardware) bridging of two channel legs.
//!
//! The pair is linked as master and slave and the conference bus carries the
//! audio, either as a direct cross-connect or through the master's
//! conference. The bridge task only watches for frames the hardware cannot
//! carry (digits, call-progress and hangup) and hands the first one back.
//!
//! Every iteration re-reads both sides under their locks. If any owner, leg,
//! descriptor, three-way flag or call state moved since the bridge was set
//! up, the bridge unlinks and returns [`TdmError::Retry`] so the caller can
//! start over with fresh handles.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelHandle, SlaveLink, MAX_SLAVES};
use crate::collaborator::Frame;
use crate::conference::{self, MasterView};
use crate::context::DriverContext;
use crate::error::{Result, TdmError};
use crate::line::PollInterest;
use crate::registry::{lock_pair, ChannelRegistry};
use crate::types::{CallState, ChannelId, Descriptor, LegIndex, OwnerId, Tone};

/// Longest wait between identity checks
pub const BRIDGE_POLL: Duration = Duration::from_millis(100);

/// How a native bridge ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeExit {
    /// A frame the hardware does not carry, read on behalf of `from`
    Frame { from: OwnerId, frame: Frame },
    Cancelled,
}

/// What one side of the bridge looked like when it was set up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Side {
    owner: OwnerId,
    channel: ChannelId,
    index: LegIndex,
    real_owner: Option<OwnerId>,
    descriptor: Option<Descriptor>,
    real_in_three_way: bool,
    state: CallState,
}

impl Side {
    fn observe(ch: &Channel, owner: OwnerId) -> Option<Self> {
        let index = ch.legs.index_of(owner)?;
        Some(Self {
            owner,
            channel: ch.id(),
            index,
            real_owner: ch.legs.owner(LegIndex::Real),
            descriptor: ch.legs.descriptor(index),
            real_in_three_way: ch.legs.call(LegIndex::Real).in_three_way,
            state: ch.legs.state(index),
        })
    }
}

/// Which side masters the pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Roles {
    a_is_master: bool,
    in_conference: bool,
}

fn roles(a: &Channel, ai: LegIndex, b: &Channel, bi: LegIndex) -> Option<Roles> {
    let in_three_way = |ch: &Channel, idx: LegIndex| ch.legs.call(idx).in_three_way;
    match (ai, bi) {
        (LegIndex::Real, LegIndex::Real) => {
            if !in_three_way(a, LegIndex::CallWait) && !in_three_way(b, LegIndex::Real) {
                Some(Roles {
                    a_is_master: true,
                    in_conference: true,
                })
            } else if !in_three_way(b, LegIndex::CallWait) && !in_three_way(a, LegIndex::Real) {
                Some(Roles {
                    a_is_master: false,
                    in_conference: true,
                })
            } else {
                warn!("Both {} and {} are contended by three-way calls", a.id(), b.id());
                None
            }
        }
        (LegIndex::Real, other) if in_three_way(b, other) => Some(Roles {
            a_is_master: false,
            in_conference: false,
        }),
        (other, LegIndex::Real) if in_three_way(a, other) => Some(Roles {
            a_is_master: true,
            in_conference: false,
        }),
        _ => None,
    }
}

fn link(master: &mut Channel, slave: &mut Channel) -> bool {
    if let Some(view) = slave.master {
        warn!("{} is already slaved to {}", slave.id(), view.master);
        return false;
    }
    if master.slaves.len() >= MAX_SLAVES {
        warn!("{} already has {} slaves", master.id(), MAX_SLAVES);
        return false;
    }
    master.slaves.push(SlaveLink {
        channel: slave.id(),
        law: slave.config().law,
    });
    slave.master = Some(MasterView {
        master: master.id(),
        number: None,
        native: false,
    });
    debug!("Linked {} to master {}", slave.id(), master.id());
    true
}

fn unlink(master: &mut Channel, slave: &mut Channel) {
    master.slaves.retain(|s| s.channel != slave.id());
    if master.slaves.is_empty() {
        master.in_conference = false;
    }
    if slave.master.is_some_and(|view| view.master == master.id()) {
        slave.master = None;
    }
    debug!("Unlinked {} from master {}", slave.id(), master.id());
}

/// Recompute conference membership for a master and its slave
fn update(ctx: &DriverContext, master: &mut Channel, slave: &mut Channel) {
    let line = ctx.line.as_ref();
    conference::recompute(line, master);
    let slave_id = slave.id();
    if let Some(view) = slave.master.as_mut() {
        view.number = master.conference.number;
        view.native = conference::is_slave_native(master) == Some(slave_id);
    }
    conference::recompute(line, slave);
}

/// Ringback toward the far party while a three-way leg is still ringing
fn three_way_tone(ch: &Channel, ctx: &DriverContext, index: LegIndex) {
    let ringing = index == LegIndex::ThreeWay
        && ch.legs.call(LegIndex::ThreeWay).in_three_way
        && ch.legs.owner(LegIndex::Real).is_some()
        && ch.legs.call(LegIndex::Real).in_three_way
        && ch.legs.state(LegIndex::Real) == CallState::Ringing;
    if ringing {
        debug!("Playing ringback on {} while its three-way party rings", ch.id());
        ch.play_tone(ctx.line.as_ref(), index, Some(Tone::Ringback));
    } else {
        ch.play_tone(ctx.line.as_ref(), index, None);
    }
}

fn handle_for(registry: &ChannelRegistry, ctx: &DriverContext, owner: OwnerId) -> Result<Arc<ChannelHandle>> {
    ctx.channel_of(owner)
        .and_then(|id| registry.get(id))
        .ok_or(TdmError::UnknownOwner(owner))
}

struct Linked {
    master_is_a: bool,
    echo_disabled: bool,
}

/// Bridge two owners through the hardware until a frame needs attention,
/// the bridge is cancelled or the topology changes under it.
///
/// Fails with [`TdmError::InvalidState`] when the legs cannot be bridged
/// natively, leaving the caller to bridge in software.
pub async fn native_bridge(
    registry: &ChannelRegistry,
    ctx: &Arc<DriverContext>,
    a: OwnerId,
    b: OwnerId,
    cancel: &CancellationToken,
) -> Result<BridgeExit> {
    let ha = handle_for(registry, ctx, a)?;
    let hb = handle_for(registry, ctx, b)?;
    if ha.id() == hb.id() {
        return Err(TdmError::invalid_state(format!("{} and {} share {}", a, b, ha.id())));
    }

    let (sides, linked) = {
        let (mut ca, mut cb) = lock_pair(&ha, &hb);
        let side_a = Side::observe(&ca, a).ok_or(TdmError::UnknownOwner(a))?;
        let side_b = Side::observe(&cb, b).ok_or(TdmError::UnknownOwner(b))?;
        let Some(roles) = roles(&ca, side_a.index, &cb, side_b.index) else {
            return Err(TdmError::invalid_state(format!(
                "cannot natively bridge {} leg {} with {} leg {}",
                ca.id(),
                side_a.index,
                cb.id(),
                side_b.index
            )));
        };

        three_way_tone(&ca, ctx, side_a.index);
        three_way_tone(&cb, ctx, side_b.index);

        let (master, slave) = if roles.a_is_master {
            (&mut *ca, &mut *cb)
        } else {
            (&mut *cb, &mut *ca)
        };
        if !link(master, slave) {
            return Err(TdmError::invalid_state(format!("unable to link {} to {}", slave.id(), master.id())));
        }
        master.in_conference = roles.in_conference;

        let line = ctx.line.as_ref();
        let echo_disabled = !master.config().echo_cancel_when_bridged || !slave.config().echo_cancel_when_bridged;
        if echo_disabled {
            master.disable_echo(line);
            slave.disable_echo(line);
        }
        update(ctx, master, slave);
        info!("Native bridge {} (master) with {}", master.id(), slave.id());

        // Compare against the linked state from here on
        let side_a = Side::observe(&ca, a).unwrap_or(side_a);
        let side_b = Side::observe(&cb, b).unwrap_or(side_b);
        (
            [side_a, side_b],
            Linked {
                master_is_a: roles.a_is_master,
                echo_disabled,
            },
        )
    };

    let handles = [ha, hb];
    let result = bridge_loop(registry, ctx, &handles, &sides, cancel).await;
    teardown(ctx, &handles, &linked);
    result
}

fn still_same(registry: &ChannelRegistry, ctx: &DriverContext, handle: &ChannelHandle, side: &Side) -> bool {
    if ctx.channel_of(side.owner) != Some(side.channel) || registry.get(side.channel).is_none() {
        return false;
    }
    let ch = handle.lock();
    Side::observe(&ch, side.owner).as_ref() == Some(side)
}

async fn bridge_loop(
    registry: &ChannelRegistry,
    ctx: &Arc<DriverContext>,
    handles: &[Arc<ChannelHandle>; 2],
    sides: &[Side; 2],
    cancel: &CancellationToken,
) -> Result<BridgeExit> {
    let interests: Vec<PollInterest> = sides
        .iter()
        .filter_map(|side| side.descriptor)
        .map(|descriptor| PollInterest {
            descriptor,
            writable: false,
        })
        .collect();
    let mut first = 0;

    loop {
        for (handle, side) in handles.iter().zip(sides) {
            if !still_same(registry, ctx, handle, side) {
                debug!("{} changed under the bridge, asking for a retry", side.channel);
                return Err(TdmError::Retry(format!("{} changed during native bridge", side.channel)));
            }
        }

        let ready = tokio::select! {
            _ = cancel.cancelled() => return Ok(BridgeExit::Cancelled),
            ready = ctx.line.poll(&interests, BRIDGE_POLL) => ready,
        };
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                warn!("Bridge poll failed: {}", e);
                tokio::time::sleep(BRIDGE_POLL).await;
                continue;
            }
        };

        // Alternate which side is read first
        for offset in 0..2 {
            let i = (first + offset) % 2;
            let side = &sides[i];
            let Some(descriptor) = side.descriptor else {
                continue;
            };
            if !ready.iter().any(|r| r.descriptor == descriptor && (r.event || r.readable)) {
                continue;
            }
            let handle = &handles[i];
            let result = {
                let mut ch = handle.lock();
                match ch.read_frame(ctx, side.owner) {
                    Ok(result) => result,
                    Err(_) => return Err(TdmError::Retry(format!("{} left {}", side.owner, side.channel))),
                }
            };
            if let Some(followup) = result.followup {
                followup.dispatch(handle, ctx);
            }
            match result.frame {
                Frame::Null | Frame::Voice(_) => {}
                frame => {
                    debug!("Bridge on {} returning {:?}", side.channel, frame);
                    return Ok(BridgeExit::Frame {
                        from: side.owner,
                        frame,
                    });
                }
            }
        }
        first = 1 - first;
    }
}

fn teardown(ctx: &DriverContext, handles: &[Arc<ChannelHandle>; 2], linked: &Linked) {
    let (mut ca, mut cb) = lock_pair(&handles[0], &handles[1]);
    let (master, slave) = if linked.master_is_a {
        (&mut *ca, &mut *cb)
    } else {
        (&mut *cb, &mut *ca)
    };
    unlink(master, slave);
    let line = ctx.line.as_ref();
    if linked.echo_disabled {
        for ch in [&mut *master, &mut *slave] {
            if ch.legs.state(LegIndex::Real) == CallState::Up {
                ch.enable_echo(line);
            }
        }
    }
    conference::recompute(line, master);
    conference::recompute(line, slave);
    info!("Native bridge between {} and {} ended", master.id(), slave.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SignalingFamily;
    use crate::collaborator::Control;
    use crate::config::ChannelConfig;
    use crate::line::LineEvent;
    use crate::testing::{MockCallControl, MockLine};
    use crate::types::{AppliedConf, ConfMode, Law};

    struct Pair {
        line: Arc<MockLine>,
        ctx: Arc<DriverContext>,
        registry: Arc<ChannelRegistry>,
        owners: [OwnerId; 2],
    }

    fn answered_pair(law_b: Law) -> Pair {
        let line = Arc::new(MockLine::new());
        let control = Arc::new(MockCallControl::new());
        let ctx = Arc::new(DriverContext::new(line.clone(), control, Default::default()));
        let registry = Arc::new(ChannelRegistry::new());
        let mut owners = [OwnerId(0); 2];
        for (i, law) in [Law::Mulaw, law_b].into_iter().enumerate() {
            let mut config = ChannelConfig::new(ChannelId(i as u32 + 1), SignalingFamily::FxsLoopStart);
            config.law = law;
            let mut channel = Channel::open(line.as_ref(), config, None).unwrap();
            owners[i] = channel
                .create_owner(&ctx, LegIndex::Real, CallState::Up, "", false)
                .unwrap();
            registry.insert(Arc::new(ChannelHandle::new(channel)));
        }
        line.clear_calls();
        Pair {
            line,
            ctx,
            registry,
            owners,
        }
    }

    fn handle(pair: &Pair, n: u32) -> Arc<ChannelHandle> {
        pair.registry.get(ChannelId(n)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_laws_cross_connect() {
        let pair = answered_pair(Law::Mulaw);
        let cancel = CancellationToken::new();
        let (registry, ctx, owners) = (pair.registry.clone(), pair.ctx.clone(), pair.owners);
        let bridge = {
            let cancel = cancel.clone();
            tokio::spawn(async move { native_bridge(&registry, &ctx, owners[0], owners[1], &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pair.line.conf(Descriptor(1)), AppliedConf::Monitor(ChannelId(2)));
        assert_eq!(pair.line.conf(Descriptor(2)), AppliedConf::Monitor(ChannelId(1)));
        assert_eq!(handle(&pair, 2).lock().master.map(|m| m.master), Some(ChannelId(1)));

        pair.line.inject(Descriptor(2), LineEvent::Digit('5'));
        let exit = bridge.await.unwrap().unwrap();
        assert_eq!(
            exit,
            BridgeExit::Frame {
                from: pair.owners[1],
                frame: Frame::Dtmf('5'),
            }
        );
        assert!(handle(&pair, 2).lock().master.is_none());
        assert!(handle(&pair, 1).lock().slaves.is_empty());
        assert_eq!(pair.line.conf(Descriptor(1)), AppliedConf::Unattached);
        assert_eq!(pair.line.conf(Descriptor(2)), AppliedConf::Unattached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_laws_share_master_conference() {
        let pair = answered_pair(Law::Alaw);
        let cancel = CancellationToken::new();
        let (registry, ctx, owners) = (pair.registry.clone(), pair.ctx.clone(), pair.owners);
        let bridge = {
            let cancel = cancel.clone();
            tokio::spawn(async move { native_bridge(&registry, &ctx, owners[0], owners[1], &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let member = AppliedConf::Member {
            number: crate::types::ConfNumber(1),
            mode: ConfMode::RealAndPseudo,
        };
        assert_eq!(pair.line.conf(Descriptor(1)), member);
        assert_eq!(pair.line.conf(Descriptor(2)), member);

        cancel.cancel();
        assert_eq!(bridge.await.unwrap().unwrap(), BridgeExit::Cancelled);
        assert_eq!(pair.line.conf(Descriptor(1)), AppliedConf::Unattached);
        assert_eq!(pair.line.conf(Descriptor(2)), AppliedConf::Unattached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixup_during_bridge_asks_for_retry() {
        let pair = answered_pair(Law::Mulaw);
        let cancel = CancellationToken::new();
        let (registry, ctx, owners) = (pair.registry.clone(), pair.ctx.clone(), pair.owners);
        let bridge = {
            let cancel = cancel.clone();
            tokio::spawn(async move { native_bridge(&registry, &ctx, owners[0], owners[1], &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle(&pair, 1)
            .lock()
            .fixup(&pair.ctx, pair.owners[0], OwnerId(99))
            .unwrap();

        let result = bridge.await.unwrap();
        assert!(matches!(result, Err(TdmError::Retry(_))));
        assert!(handle(&pair, 2).lock().master.is_none());
        assert!(!handle(&pair, 1).lock().in_conference);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_frame_ends_bridge() {
        let pair = answered_pair(Law::Mulaw);
        let cancel = CancellationToken::new();
        let (registry, ctx, owners) = (pair.registry.clone(), pair.ctx.clone(), pair.owners);
        let bridge = tokio::spawn(async move { native_bridge(&registry, &ctx, owners[0], owners[1], &cancel).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pair.line.inject(Descriptor(1), LineEvent::OnHook);
        let exit = bridge.await.unwrap().unwrap();
        assert_eq!(
            exit,
            BridgeExit::Frame {
                from: pair.owners[0],
                frame: Frame::Control(Control::Hangup),
            }
        );
    }

    #[test]
    fn test_three_way_contention_refuses_bridge() {
        let pair = answered_pair(Law::Mulaw);
        handle(&pair, 1).lock().legs.call_mut(LegIndex::Real).in_three_way = true;
        handle(&pair, 2).lock().legs.call_mut(LegIndex::Real).in_three_way = true;
        let a = handle(&pair, 1);
        let b = handle(&pair, 2);
        let (ca, cb) = lock_pair(&a, &b);
        assert_eq!(roles(&ca, LegIndex::Real, &cb, LegIndex::Real), None);
    }
}
