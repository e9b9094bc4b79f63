//! Channel records and the subchannel state machine.
//!
//! A [`Channel`] is created per configured hardware channel at load and lives
//! for the driver's lifetime. It carries three legs (see [`legs`]): the real
//! leg bound to the physical line, a call-waiting leg and a three-way leg,
//! the latter two backed by pseudo descriptors joined through the conference
//! bus. Every mutation happens under the record's mutex in
//! [`ChannelHandle`].

pub mod callerid;
pub mod digits;
pub mod distinctive;
pub(crate) mod events;
pub mod legs;
pub(crate) mod ops;
pub mod signaling;

use std::io;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use std::sync::Arc;

use crate::collaborator::NewCall;
use crate::conference::{ConferenceState, MasterView};
use crate::config::ChannelConfig;
use crate::context::DriverContext;
use crate::error::{Result, TdmError};
use crate::line::{BufferPolicy, GainTable, LineInterface};
use crate::trunk::protocol::{CallRef, ChannelDesignator};
use crate::types::{
    CallState, CallerInfo, ChannelId, Descriptor, EchoCommand, HookCommand, Law, LegIndex, OwnerId,
    Polarity, Tone, TrunkGroupId,
};

use callerid::CallerIdSpill;
use distinctive::CadenceTracker;

pub use events::Followup;
pub use legs::{LegCall, LegHardware, LegSlots, PendingEvents};
pub use ops::{ChannelOption, HangupOutcome, Indication};
pub use signaling::{DialTrigger, Signal, SignalingBehavior, SignalingClass, SignalingFamily};

/// Maximum number of slaves natively bridged to one master
pub const MAX_SLAVES: usize = 4;

/// A channel slaved to this one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveLink {
    pub channel: ChannelId,
    pub law: Law,
}

/// Digital trunk state of a bearer or call-reference record
#[derive(Debug, Clone)]
pub struct TrunkBinding {
    pub group: TrunkGroupId,
    pub logical_span: u8,
    /// Bearer offset within the span; 0 for call-reference records
    pub offset: u8,
    pub crv: Option<u16>,
    /// Protocol call bound to this record
    pub call: Option<CallRef>,
    /// A restart is outstanding
    pub resetting: bool,
    /// Carries an administrative idle call
    pub idle_call: bool,
    /// Surplus idle call already asked to clear
    pub idle_released: bool,
    pub proceeding: bool,
    pub progress: bool,
    pub alerting: bool,
    pub setup_ack: bool,
    /// Hangup already signalled in one direction
    pub already_hungup: bool,
    /// Last overlap digit received while collecting an inbound number
    pub overlap_since: Option<Instant>,
    /// Digits sent before the far end acknowledged the setup
    pub queued_digits: String,
    /// Bearer carrying this call-reference record
    pub bearer: Option<ChannelId>,
    /// Call-reference record riding on this bearer
    pub real_call: Option<ChannelId>,
    /// Own pseudo descriptor of a call-reference record while it rides a bearer
    pub parked: Option<Descriptor>,
    /// Signalled when an idle call is answered
    pub idle_answered: Option<Arc<Notify>>,
}

impl TrunkBinding {
    pub fn new(group: TrunkGroupId, logical_span: u8, offset: u8, crv: Option<u16>) -> Self {
        Self {
            group,
            logical_span,
            offset,
            crv,
            call: None,
            resetting: false,
            idle_call: false,
            idle_released: false,
            proceeding: false,
            progress: false,
            alerting: false,
            setup_ack: false,
            already_hungup: false,
            overlap_since: None,
            queued_digits: String::new(),
            bearer: None,
            real_call: None,
            parked: None,
            idle_answered: None,
        }
    }

    pub fn designator(&self) -> ChannelDesignator {
        let designator = ChannelDesignator::new(self.logical_span, self.offset);
        match self.crv {
            Some(crv) => designator.with_crv(crv),
            None => designator,
        }
    }

    /// Clear per-call protocol state
    pub fn reset_call(&mut self) {
        self.call = None;
        self.idle_call = false;
        self.idle_released = false;
        self.proceeding = false;
        self.progress = false;
        self.alerting = false;
        self.setup_ack = false;
        self.already_hungup = false;
        self.overlap_since = None;
        self.queued_digits.clear();
        self.idle_answered = None;
    }
}

/// Whether a channel can take a new call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Idle,
    /// Busy but able to present a waiting call
    CallWait,
    /// In use
    Busy,
    /// Alarmed, guarded, resetting or otherwise out of service
    Unavailable,
}

/// Administrative view of a channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub channel: u32,
    pub signaling: SignalingFamily,
    pub context: String,
    pub state: CallState,
    pub owners: usize,
    pub in_alarm: bool,
    pub dnd: bool,
    pub conference: Option<u32>,
    pub trunk_call: Option<u32>,
    pub resetting: bool,
}

/// Runtime state of one channel
pub struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) family: SignalingFamily,
    pub(crate) behavior: &'static dyn SignalingBehavior,
    pub(crate) config: ChannelConfig,
    pub(crate) legs: LegSlots,

    pub(crate) master: Option<MasterView>,
    pub(crate) slaves: Vec<SlaveLink>,
    pub(crate) conference: ConferenceState,
    pub(crate) in_conference: bool,

    pub(crate) in_alarm: bool,
    pub(crate) outgoing: bool,
    /// Hardware is sending digits; audio is discarded
    pub(crate) dialing: bool,
    /// Dial string waiting for hook-complete or wink
    pub(crate) pending_dial: Option<String>,
    /// Digits sent after answer
    pub(crate) post_answer_dial: Option<String>,
    pub(crate) exten: String,
    pub(crate) caller: CallerInfo,

    /// Per-call copies of configured features
    pub(crate) hide_callerid: bool,
    pub(crate) call_waiting: bool,
    pub(crate) dnd: bool,

    pub(crate) spill: Option<CallerIdSpill>,
    pub(crate) rings: u32,
    pub(crate) call_wait_rings: u32,
    pub(crate) flash_time: Option<Instant>,
    pub(crate) gain_bump: f32,
    pub(crate) echo_on: bool,
    pub(crate) tdd: bool,
    pub(crate) relax_dtmf: bool,
    /// Digital data mode: no gain or echo cancellation
    pub(crate) audio_mode_data: bool,
    pub(crate) polarity: Polarity,
    /// When an answer on polarity reversal was seen
    pub(crate) polarity_since: Option<Instant>,
    /// The real leg's owner is not the active party; line events are absorbed
    /// until the station picks up or flashes
    pub(crate) absorb_events: bool,
    pub(crate) guard_until: Option<Instant>,
    /// Last message-waiting state sent to the station
    pub(crate) mwi: Option<bool>,
    pub(crate) cadence: CadenceTracker,
    pub(crate) ring_context: Option<String>,
    pub(crate) trunk: Option<TrunkBinding>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("legs", &self.legs)
            .field("conference", &self.conference)
            .field("in_alarm", &self.in_alarm)
            .field("trunk", &self.trunk)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(config: ChannelConfig, physical: Descriptor, trunk: Option<TrunkBinding>) -> Self {
        let family = config.signaling;
        Self {
            id: config.channel,
            family,
            behavior: family.behavior(),
            legs: LegSlots::new(physical),
            master: None,
            slaves: Vec::new(),
            conference: ConferenceState::default(),
            in_conference: false,
            in_alarm: false,
            outgoing: false,
            dialing: false,
            pending_dial: None,
            post_answer_dial: None,
            exten: String::new(),
            caller: CallerInfo::default(),
            hide_callerid: config.hide_callerid,
            call_waiting: config.call_waiting,
            dnd: false,
            spill: None,
            rings: 0,
            call_wait_rings: 0,
            flash_time: None,
            gain_bump: 0.0,
            echo_on: false,
            tdd: false,
            relax_dtmf: false,
            audio_mode_data: false,
            polarity: Polarity::Idle,
            polarity_since: None,
            absorb_events: false,
            guard_until: None,
            mwi: None,
            cadence: CadenceTracker::new(),
            ring_context: None,
            trunk,
            config,
        }
    }

    /// Open the hardware for a configured channel and build its record
    pub fn open(line: &dyn LineInterface, config: ChannelConfig, trunk: Option<TrunkBinding>) -> Result<Self> {
        let descriptor = if trunk.as_ref().is_some_and(|t| t.crv.is_some()) {
            line.open_pseudo()
        } else {
            line.open(config.channel)
        }
        .map_err(|e| TdmError::hardware(config.channel, e))?;

        let channel = Self::new(config, descriptor, trunk);
        channel.log_hw("set law", line.set_law(descriptor, channel.config.law));
        channel.log_hw("set buffer policy", line.set_buffer_policy(descriptor, BufferPolicy::default()));
        channel.apply_gains(line);
        if let Some(params) = channel.log_hw("get params", line.get_params(descriptor)) {
            channel.log_hw("set params", line.set_params(descriptor, &params));
        }
        info!("Opened {} ({:?})", channel.id, channel.family);
        Ok(channel)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn family(&self) -> SignalingFamily {
        self.family
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn legs(&self) -> &LegSlots {
        &self.legs
    }

    pub fn state(&self, index: LegIndex) -> CallState {
        self.legs.state(index)
    }

    pub fn owner(&self, index: LegIndex) -> Option<OwnerId> {
        self.legs.owner(index)
    }

    pub fn in_alarm(&self) -> bool {
        self.in_alarm
    }

    pub fn dnd(&self) -> bool {
        self.dnd
    }

    pub fn exten(&self) -> &str {
        &self.exten
    }

    pub fn caller(&self) -> &CallerInfo {
        &self.caller
    }

    pub fn conference(&self) -> ConferenceState {
        self.conference
    }

    pub fn trunk(&self) -> Option<&TrunkBinding> {
        self.trunk.as_ref()
    }

    pub fn spill(&self) -> Option<&CallerIdSpill> {
        self.spill.as_ref()
    }

    pub fn hide_callerid(&self) -> bool {
        self.hide_callerid
    }

    pub fn call_waiting_enabled(&self) -> bool {
        self.call_waiting
    }

    pub fn guard_until(&self) -> Option<Instant> {
        self.guard_until
    }

    pub fn ring_context(&self) -> Option<&str> {
        self.ring_context.as_deref()
    }

    pub fn physical(&self) -> Option<Descriptor> {
        self.legs.descriptor(LegIndex::Real)
    }

    /// No leg has an owner
    pub fn is_unowned(&self) -> bool {
        self.legs.owner_count() == 0
    }

    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            channel: self.id.0,
            signaling: self.family,
            context: self.config.context.clone(),
            state: self.legs.state(LegIndex::Real),
            owners: self.legs.owner_count(),
            in_alarm: self.in_alarm,
            dnd: self.dnd,
            conference: self.conference.number.map(|n| n.0),
            trunk_call: self.trunk.as_ref().and_then(|t| t.call).map(|c| c.0),
            resetting: self.trunk.as_ref().is_some_and(|t| t.resetting),
        }
    }

    /// Log a failed hardware call and carry on
    pub(crate) fn log_hw<T>(&self, what: &str, result: io::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Unable to {} on {}: {}", what, self.id, e);
                None
            }
        }
    }

    /// Hook commands always go to the physical line
    pub(crate) fn set_hook(&self, line: &dyn LineInterface, command: HookCommand) -> bool {
        match self.physical() {
            Some(descriptor) => self.log_hw("set hook", line.set_hook(descriptor, command)).is_some(),
            None => false,
        }
    }

    /// Ring a station: force on-hook first so the ring command is accepted
    pub(crate) fn ring_phone(&self, line: &dyn LineInterface) -> bool {
        self.set_hook(line, HookCommand::OnHook);
        self.set_hook(line, HookCommand::Ring)
    }

    pub(crate) fn play_tone(&self, line: &dyn LineInterface, index: LegIndex, tone: Option<Tone>) {
        if let Some(descriptor) = self.legs.descriptor(index) {
            self.log_hw("play tone", line.play_tone(descriptor, tone));
        }
    }

    pub(crate) fn enable_echo(&mut self, line: &dyn LineInterface) {
        let taps = self.config.echo_cancel_taps;
        if self.echo_on || taps == 0 || self.audio_mode_data {
            return;
        }
        if let Some(descriptor) = self.physical() {
            if self.log_hw("enable echo canceller", line.echo_cancel(descriptor, EchoCommand::Enable { taps })).is_some() {
                self.echo_on = true;
                debug!("Enabled echo cancellation on {}", self.id);
            }
        }
    }

    pub(crate) fn train_echo(&self, line: &dyn LineInterface) {
        let ms = self.config.echo_training_ms;
        if !self.echo_on || ms == 0 {
            return;
        }
        if let Some(descriptor) = self.physical() {
            self.log_hw("train echo canceller", line.echo_cancel(descriptor, EchoCommand::Train { ms }));
        }
    }

    pub(crate) fn disable_echo(&mut self, line: &dyn LineInterface) {
        if !self.echo_on {
            return;
        }
        if let Some(descriptor) = self.physical() {
            self.log_hw("disable echo canceller", line.echo_cancel(descriptor, EchoCommand::Disable));
        }
        self.echo_on = false;
        debug!("Disabled echo cancellation on {}", self.id);
    }

    /// Load gain tables for the configured gains plus any receive bump
    pub(crate) fn apply_gains(&self, line: &dyn LineInterface) {
        let Some(descriptor) = self.physical() else {
            return;
        };
        let table = GainTable::compute(
            self.config.law,
            self.config.rx_gain + self.gain_bump,
            self.config.tx_gain,
        );
        self.log_hw("set gains", line.set_gains(descriptor, &table));
    }

    /// Raise the receive gain by `delta_db` above the configured value
    pub fn bump_gain(&mut self, line: &dyn LineInterface, delta_db: f32) {
        self.gain_bump = delta_db;
        self.apply_gains(line);
    }

    /// Return to the configured gains
    pub fn restore_gain(&mut self, line: &dyn LineInterface) {
        self.gain_bump = 0.0;
        self.apply_gains(line);
    }

    /// Back a software leg with a pseudo descriptor
    pub(crate) fn alloc_sub(&mut self, line: &dyn LineInterface, index: LegIndex) -> Result<()> {
        if self.legs.is_allocated(index) {
            return Err(TdmError::invalid_state(format!("{} leg {} already allocated", self.id, index)));
        }
        let descriptor = line
            .open_pseudo()
            .map_err(|e| TdmError::exhausted(format!("no pseudo channel for {} leg {}: {}", self.id, index, e)))?;
        self.log_hw("set law", line.set_law(descriptor, self.config.law));
        self.log_hw("set buffer policy", line.set_buffer_policy(descriptor, BufferPolicy::default()));
        self.legs.attach(index, descriptor);
        debug!("Allocated {} leg {} on pseudo {:?}", self.id, index, descriptor);
        Ok(())
    }

    /// Release a software leg and close its pseudo descriptor
    pub(crate) fn unalloc_sub(&mut self, ctx: &DriverContext, index: LegIndex) {
        if index == LegIndex::Real {
            warn!("Refusing to release the real leg of {}", self.id);
            return;
        }
        if let Some(owner) = self.legs.owner(index) {
            ctx.owners.remove(&owner);
        }
        if let Some(descriptor) = self.legs.detach(index) {
            ctx.line.close(descriptor);
            debug!("Released {} leg {}", self.id, index);
        }
    }

    /// Ask the collaborator for a call object on a leg and attach it
    pub(crate) fn create_owner(
        &mut self,
        ctx: &DriverContext,
        index: LegIndex,
        state: CallState,
        extension: &str,
        administrative: bool,
    ) -> Option<OwnerId> {
        let request = NewCall {
            channel: self.id,
            leg: index,
            state,
            context: self.ring_context.clone().unwrap_or_else(|| self.config.context.clone()),
            extension: extension.to_string(),
            caller: self.caller.clone(),
            language: self.config.language.clone(),
            administrative,
        };
        let Some(owner) = ctx.control.new_call(&request) else {
            warn!("Unable to allocate call object on {} leg {}", self.id, index);
            return None;
        };
        let call = self.legs.call_mut(index);
        call.owner = Some(owner);
        call.state = state;
        ctx.owners.insert(owner, self.id);
        debug!("{} leg {} now owned by {}", self.id, index, owner);
        Some(owner)
    }

    /// Detach an owner from its leg
    pub(crate) fn release_owner(&mut self, ctx: &DriverContext, index: LegIndex) -> Option<OwnerId> {
        let call = self.legs.call_mut(index);
        let owner = call.owner.take()?;
        call.pending = PendingEvents::default();
        ctx.owners.remove(&owner);
        Some(owner)
    }

    pub(crate) fn set_state(&mut self, ctx: &DriverContext, index: LegIndex, state: CallState) {
        let call = self.legs.call_mut(index);
        if call.state == state {
            return;
        }
        call.state = state;
        if let Some(owner) = call.owner {
            ctx.control.state_changed(owner, state);
        }
    }

    /// Whether this channel can accept an outbound request
    pub fn availability(&self, line: &dyn LineInterface, now: Instant) -> Availability {
        if self.in_alarm || self.dnd {
            return Availability::Unavailable;
        }
        if self.guard_until.is_some_and(|until| now < until) {
            return Availability::Unavailable;
        }

        if self.is_unowned() {
            if let Some(trunk) = &self.trunk {
                if trunk.resetting || trunk.call.is_some() {
                    return Availability::Busy;
                }
                return Availability::Idle;
            }
            if self.family.class() == SignalingClass::Station {
                let off_hook = self
                    .physical()
                    .and_then(|d| self.log_hw("get params", line.get_params(d)))
                    .is_some_and(|p| p.off_hook);
                if off_hook {
                    debug!("{} off hook, can't use", self.id);
                    return Availability::Busy;
                }
            }
            return Availability::Idle;
        }

        if self.family.class() != SignalingClass::Station || !self.call_waiting {
            return Availability::Busy;
        }
        if self.legs.is_allocated(LegIndex::CallWait) {
            return Availability::Busy;
        }
        let real_state = self.legs.state(LegIndex::Real);
        if real_state != CallState::Up && (real_state != CallState::Ringing || self.outgoing) {
            return Availability::Busy;
        }
        let three_way = self.legs.call(LegIndex::ThreeWay);
        if three_way.owner.is_some() && !three_way.in_three_way {
            return Availability::Busy;
        }
        Availability::CallWait
    }

    /// Write as much of a pending spill as the line accepts
    pub(crate) fn write_spill(&mut self, line: &dyn LineInterface) {
        let Some(descriptor) = self.physical() else {
            return;
        };
        let Some(spill) = self.spill.as_mut() else {
            return;
        };
        match line.write(descriptor, spill.remaining()) {
            Ok(written) => {
                if spill.advance(written) {
                    debug!("Finished {:?} spill on {}", spill.kind(), self.id);
                    self.spill = None;
                }
            }
            Err(e) => {
                warn!("Unable to write spill on {}: {}", self.id, e);
                self.spill = None;
            }
        }
    }
}

/// A channel record behind its lock
#[derive(Debug)]
pub struct ChannelHandle {
    id: ChannelId,
    group: Option<TrunkGroupId>,
    inner: Mutex<Channel>,
}

impl ChannelHandle {
    pub fn new(channel: Channel) -> Self {
        Self {
            id: channel.id,
            group: channel.trunk.as_ref().map(|t| t.group),
            inner: Mutex::new(channel),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Trunk group whose lock must be taken before this channel's
    pub fn trunk_group(&self) -> Option<TrunkGroupId> {
        self.group
    }

    pub fn lock(&self) -> MutexGuard<'_, Channel> {
        self.inner.lock()
    }
}
