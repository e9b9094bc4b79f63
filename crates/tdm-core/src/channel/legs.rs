//! Leg arena for a physical channel.
//!
//! Every channel carries three legs. The hardware half of a leg (descriptor,
//! linear mode, last applied conference) is pinned to its index: index 0 is
//! always the physical line. The call half (owner, state, three-way flag,
//! pending indications) lives in one of three stable slots, and an
//! index-to-slot map says which slot is currently presented at which index.
//! Swapping two legs exchanges two map entries and nothing else, so a swap is
//! never observed half done.

use crate::collaborator::Control;
use crate::types::{AppliedConf, CallState, Descriptor, LegIndex, OwnerId};

/// Indications waiting to be delivered on the next read of a leg
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingEvents {
    pub answer: bool,
    pub ringing: bool,
    pub busy: bool,
    pub congestion: bool,
    pub flash: bool,
    pub hold: bool,
    pub unhold: bool,
}

impl PendingEvents {
    /// Remove and return the highest priority pending indication
    pub fn take_next(&mut self) -> Option<Control> {
        let order: [(&mut bool, Control); 7] = [
            (&mut self.ringing, Control::Ringing),
            (&mut self.busy, Control::Busy),
            (&mut self.congestion, Control::Congestion),
            (&mut self.answer, Control::Answer),
            (&mut self.flash, Control::Flash),
            (&mut self.hold, Control::Hold),
            (&mut self.unhold, Control::Unhold),
        ];
        for (flag, control) in order {
            if *flag {
                *flag = false;
                return Some(control);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        *self == PendingEvents::default()
    }
}

/// Call identity carried by a leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegCall {
    pub owner: Option<OwnerId>,
    pub state: CallState,
    pub in_three_way: bool,
    /// Dial-plan execution has started for this leg's owner
    pub in_pbx: bool,
    pub pending: PendingEvents,
}

impl Default for LegCall {
    fn default() -> Self {
        Self {
            owner: None,
            state: CallState::Down,
            in_three_way: false,
            in_pbx: false,
            pending: PendingEvents::default(),
        }
    }
}

/// Hardware resources pinned to a leg index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegHardware {
    pub descriptor: Option<Descriptor>,
    pub linear: bool,
    pub applied_conf: AppliedConf,
}

/// The three legs of a channel
#[derive(Debug, Clone)]
pub struct LegSlots {
    hardware: [LegHardware; 3],
    calls: [LegCall; 3],
    map: [usize; 3],
}

impl LegSlots {
    /// Create the leg set with the physical descriptor on the real leg
    pub fn new(physical: Descriptor) -> Self {
        let mut hardware: [LegHardware; 3] = Default::default();
        hardware[0].descriptor = Some(physical);
        Self {
            hardware,
            calls: Default::default(),
            map: [0, 1, 2],
        }
    }

    pub fn call(&self, index: LegIndex) -> &LegCall {
        &self.calls[self.map[index.as_usize()]]
    }

    pub fn call_mut(&mut self, index: LegIndex) -> &mut LegCall {
        &mut self.calls[self.map[index.as_usize()]]
    }

    pub fn hardware(&self, index: LegIndex) -> &LegHardware {
        &self.hardware[index.as_usize()]
    }

    pub fn hardware_mut(&mut self, index: LegIndex) -> &mut LegHardware {
        &mut self.hardware[index.as_usize()]
    }

    pub fn descriptor(&self, index: LegIndex) -> Option<Descriptor> {
        self.hardware(index).descriptor
    }

    pub fn owner(&self, index: LegIndex) -> Option<OwnerId> {
        self.call(index).owner
    }

    pub fn state(&self, index: LegIndex) -> CallState {
        self.call(index).state
    }

    pub fn set_state(&mut self, index: LegIndex, state: CallState) {
        self.call_mut(index).state = state;
    }

    /// Whether a leg has hardware behind it
    pub fn is_allocated(&self, index: LegIndex) -> bool {
        self.hardware(index).descriptor.is_some()
    }

    /// Replace the descriptor of the real leg, returning the previous one
    pub fn set_physical(&mut self, descriptor: Descriptor) -> Option<Descriptor> {
        self.hardware[0].applied_conf = AppliedConf::Unattached;
        self.hardware[0].descriptor.replace(descriptor)
    }

    /// Exchange the call identity presented at two indices
    pub fn swap(&mut self, a: LegIndex, b: LegIndex) {
        self.map.swap(a.as_usize(), b.as_usize());
    }

    /// Find the leg an owner is attached to
    pub fn index_of(&self, owner: OwnerId) -> Option<LegIndex> {
        LegIndex::ALL.into_iter().find(|idx| self.owner(*idx) == Some(owner))
    }

    /// Number of legs with an owner
    pub fn owner_count(&self) -> usize {
        LegIndex::ALL.iter().filter(|idx| self.owner(**idx).is_some()).count()
    }

    /// Attach pseudo hardware to a software leg
    pub fn attach(&mut self, index: LegIndex, descriptor: Descriptor) {
        let hw = self.hardware_mut(index);
        hw.descriptor = Some(descriptor);
        hw.linear = false;
        hw.applied_conf = AppliedConf::Unattached;
    }

    /// Detach hardware and clear the call identity of a software leg.
    ///
    /// Returns the descriptor that must be closed.
    pub fn detach(&mut self, index: LegIndex) -> Option<Descriptor> {
        debug_assert!(index != LegIndex::Real, "the real leg owns the physical line");
        let descriptor = self.hardware_mut(index).descriptor.take();
        *self.hardware_mut(index) = LegHardware::default();
        *self.call_mut(index) = LegCall::default();
        descriptor
    }

    /// Reset the call identity of a leg, keeping its hardware
    pub fn clear_call(&mut self, index: LegIndex) {
        *self.call_mut(index) = LegCall::default();
    }

    /// Number of legs actively joined in a three-way conference
    pub(crate) fn three_way_members(&self) -> usize {
        LegIndex::ALL
            .iter()
            .filter(|idx| self.is_allocated(**idx) && self.call(**idx).in_three_way)
            .count()
    }
}
