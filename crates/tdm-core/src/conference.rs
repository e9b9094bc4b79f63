//! Conference-bus membership for a channel's legs.
//!
//! [`recompute`] derives the placement every leg should have from the
//! channel's three-way flags and master/slave links, then issues only the
//! hardware changes needed to get there. Each leg remembers the assignment
//! last applied to it, so re-running with an unchanged topology touches no
//! hardware.
//!
//! A channel's conference number belongs to the leg that allocated it.
//! Dropping any other leg restores it to unattached; dropping the owning leg
//! tears the conference down and a remaining member allocates a fresh one.

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::line::LineInterface;
use crate::types::{AppliedConf, ChannelId, ConfMode, ConfNumber, ConfRequest, LegIndex};

/// Conference number held by a channel and the leg that allocated it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConferenceState {
    pub number: Option<ConfNumber>,
    pub owner: Option<LegIndex>,
}

/// What a slave knows about its master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterView {
    pub master: ChannelId,
    /// Master's conference number, used when the pair is not slave-native
    pub number: Option<ConfNumber>,
    /// The pair uses a direct cross-connect
    pub native: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Unattached,
    /// Member of this channel's own conference
    Own(ConfMode),
    /// Member of the master's conference
    Foreign(ConfNumber, ConfMode),
    Monitor(ChannelId),
}

fn mode_for(index: LegIndex) -> ConfMode {
    match index {
        LegIndex::Real => ConfMode::RealAndPseudo,
        _ => ConfMode::TalkerListener,
    }
}

/// The single slave eligible for a direct cross-connect, if any.
///
/// Requires no allocated leg in a three-way, exactly one slave and the same
/// companding law on both sides.
pub fn is_slave_native(channel: &Channel) -> Option<ChannelId> {
    if channel.legs.three_way_members() > 0 {
        return None;
    }
    match channel.slaves.as_slice() {
        [only] if only.law == channel.config.law => Some(only.channel),
        _ => None,
    }
}

fn targets(channel: &Channel) -> [Target; 3] {
    let mut targets = [Target::Unattached; 3];
    for idx in LegIndex::ALL {
        if channel.legs.is_allocated(idx) && channel.legs.call(idx).in_three_way {
            targets[idx.as_usize()] = Target::Own(mode_for(idx));
        }
    }

    let real = LegIndex::Real.as_usize();
    let real_in_three_way = channel.legs.call(LegIndex::Real).in_three_way;
    if channel.in_conference && !real_in_three_way {
        targets[real] = match is_slave_native(channel) {
            Some(slave) => Target::Monitor(slave),
            None => Target::Own(ConfMode::RealAndPseudo),
        };
    }

    if let Some(view) = channel.master {
        targets[real] = if view.native {
            Target::Monitor(view.master)
        } else {
            match view.number {
                Some(number) => Target::Foreign(number, ConfMode::RealAndPseudo),
                None => Target::Unattached,
            }
        };
    }
    targets
}

fn apply(line: &dyn LineInterface, channel: &mut Channel, index: LegIndex, request: ConfRequest) -> Option<Option<ConfNumber>> {
    let descriptor = channel.legs.descriptor(index)?;
    match line.set_conf(descriptor, request) {
        Ok(joined) => Some(joined),
        Err(e) => {
            warn!("Unable to set conference on {} leg {}: {}", channel.id, index, e);
            None
        }
    }
}

fn detach(line: &dyn LineInterface, channel: &mut Channel, index: LegIndex) {
    if channel.legs.hardware(index).applied_conf == AppliedConf::Unattached {
        return;
    }
    if apply(line, channel, index, ConfRequest::Unattached).is_some() {
        channel.legs.hardware_mut(index).applied_conf = AppliedConf::Unattached;
        debug!("Removed {} leg {} from conference", channel.id, index);
    }
}

/// Bring every leg's conference assignment in line with the channel topology.
///
/// Returns the number of hardware conference requests issued.
pub fn recompute(line: &dyn LineInterface, channel: &mut Channel) -> usize {
    let targets = targets(channel);
    let mut issued = 0;

    // The owning leg left: tear the conference down before anything else
    if let Some(owner) = channel.conference.owner {
        if !matches!(targets[owner.as_usize()], Target::Own(_)) {
            let ours = channel.conference.number;
            for idx in LegIndex::ALL {
                if let AppliedConf::Member { number, .. } = channel.legs.hardware(idx).applied_conf {
                    if Some(number) == ours {
                        detach(line, channel, idx);
                        issued += 1;
                    }
                }
            }
            debug!("Tore down conference {:?} on {}", ours, channel.id);
            channel.conference = ConferenceState::default();
        }
    }

    for idx in LegIndex::ALL {
        let applied = channel.legs.hardware(idx).applied_conf;
        let stale = match targets[idx.as_usize()] {
            Target::Unattached => applied != AppliedConf::Unattached,
            Target::Own(mode) => match (applied, channel.conference.number) {
                (AppliedConf::Member { number, mode: m }, Some(ours)) => number != ours || m != mode,
                (AppliedConf::Unattached, _) => false,
                _ => true,
            },
            Target::Foreign(number, mode) => {
                applied != AppliedConf::Unattached && applied != AppliedConf::Member { number, mode }
            }
            Target::Monitor(peer) => applied != AppliedConf::Unattached && applied != AppliedConf::Monitor(peer),
        };
        if stale {
            detach(line, channel, idx);
            issued += 1;
        }
    }

    let mut members = 0;
    for idx in LegIndex::ALL {
        let applied = channel.legs.hardware(idx).applied_conf;
        match targets[idx.as_usize()] {
            Target::Unattached => {}
            Target::Own(mode) => {
                members += 1;
                if let (AppliedConf::Member { number, .. }, Some(ours)) = (applied, channel.conference.number) {
                    if number == ours {
                        continue;
                    }
                }
                let request = ConfRequest::Join {
                    number: channel.conference.number,
                    mode,
                };
                issued += 1;
                if let Some(joined) = apply(line, channel, idx, request) {
                    let Some(number) = joined.or(channel.conference.number) else {
                        warn!("No conference number returned for {} leg {}", channel.id, idx);
                        continue;
                    };
                    if channel.conference.number.is_none() {
                        channel.conference = ConferenceState {
                            number: Some(number),
                            owner: Some(idx),
                        };
                        debug!("{} leg {} allocated conference {}", channel.id, idx, number.0);
                    }
                    channel.legs.hardware_mut(idx).applied_conf = AppliedConf::Member { number, mode };
                }
            }
            Target::Foreign(number, mode) => {
                if applied == (AppliedConf::Member { number, mode }) {
                    continue;
                }
                issued += 1;
                let request = ConfRequest::Join {
                    number: Some(number),
                    mode,
                };
                if apply(line, channel, idx, request).is_some() {
                    channel.legs.hardware_mut(idx).applied_conf = AppliedConf::Member { number, mode };
                }
            }
            Target::Monitor(peer) => {
                if applied == AppliedConf::Monitor(peer) {
                    continue;
                }
                issued += 1;
                if apply(line, channel, idx, ConfRequest::Monitor(peer)).is_some() {
                    channel.legs.hardware_mut(idx).applied_conf = AppliedConf::Monitor(peer);
                }
            }
        }
    }

    if members == 0 {
        channel.conference = ConferenceState::default();
    }
    issued
}
