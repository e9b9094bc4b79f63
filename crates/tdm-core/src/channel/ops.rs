//! Owner-facing operations on a channel record.
//!
//! Every method takes the owner on whose behalf it runs and resolves it to a
//! leg first; an owner no longer attached to the channel is reported as
//! [`TdmError::UnknownOwner`] (or, for hangup, absorbed as a no-op).

use std::io;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::callerid::{mdmf_message, sdmf_message, CallerIdSpill, SpillKind, SpillWindow};
use super::events::{self, EventResult};
use super::signaling::{DialTrigger, SignalingClass};
use super::{Availability, Channel};
use crate::collaborator::Frame;
use crate::conference;
use crate::config::CallerIdMode;
use crate::context::DriverContext;
use crate::error::{Result, TdmError};
use crate::types::{CallState, CallerInfo, HookCommand, LegIndex, OwnerId, Polarity, Tone};

/// Bytes per audio frame in companded mode
pub const READ_SIZE: usize = 160;

/// Call-progress conditions the collaborator can indicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indication {
    Busy,
    Ringing,
    Congestion,
    Proceeding,
    Progress,
    Hold,
    Unhold,
    /// Hook flash toward a trunk
    Flash,
    /// Stop any tone
    Stop,
}

/// Per-call options
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelOption {
    /// Raise the receive gain by this many dB; zero restores the configured gain
    RxGain(f32),
    EchoCancel(bool),
    /// Telecommunications device for the deaf mode
    Tdd(bool),
    /// `false` switches the channel to digital data mode
    AudioMode(bool),
    RelaxDtmf(bool),
}

/// What a hangup did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HangupOutcome {
    /// The owner was attached and has been released
    pub released: bool,
    /// No leg has an owner any more
    pub idle: bool,
}

impl Channel {
    pub(crate) fn leg_of(&self, owner: OwnerId) -> Result<LegIndex> {
        self.legs.index_of(owner).ok_or(TdmError::UnknownOwner(owner))
    }

    /// Remove the configured number of leading digits
    pub(crate) fn strip_destination<'a>(&self, destination: &'a str) -> Result<&'a str> {
        let strip = self.config.strip_digits;
        if destination.len() < strip {
            return Err(TdmError::invalid_argument(format!(
                "number '{}' is shorter than the strip length {}",
                destination, strip
            )));
        }
        destination
            .get(strip..)
            .ok_or_else(|| TdmError::invalid_argument(format!("malformed number '{}'", destination)))
    }

    /// Claim a leg for an outbound request
    pub(crate) fn claim_leg(&mut self, ctx: &DriverContext, availability: Availability) -> Result<OwnerId> {
        let index = match availability {
            Availability::Idle => LegIndex::Real,
            Availability::CallWait => {
                self.alloc_sub(ctx.line.as_ref(), LegIndex::CallWait)?;
                LegIndex::CallWait
            }
            Availability::Busy | Availability::Unavailable => {
                return Err(TdmError::invalid_state(format!("{} is busy", self.id)));
            }
        };
        match self.create_owner(ctx, index, CallState::Down, "", false) {
            Some(owner) => Ok(owner),
            None => {
                if index != LegIndex::Real {
                    self.unalloc_sub(ctx, index);
                }
                Err(TdmError::exhausted(format!("no call object for {}", self.id)))
            }
        }
    }

    /// Place an outbound call on an analog line
    pub(crate) fn dial(&mut self, ctx: &DriverContext, owner: OwnerId, destination: &str, caller: &CallerInfo) -> Result<()> {
        let index = self.leg_of(owner)?;
        let state = self.legs.state(index);
        if !state.can_dial() {
            return Err(TdmError::invalid_state(format!(
                "dial on {} leg {} in state {:?}",
                self.id, index, state
            )));
        }
        if let Some(descriptor) = self.legs.descriptor(index) {
            self.log_hw("flush", ctx.line.flush(descriptor));
        }
        self.outgoing = true;
        self.caller = caller.clone();
        self.rings = 0;

        match self.family.class() {
            SignalingClass::Station => self.dial_station(ctx, index, destination),
            SignalingClass::LoopTrunk | SignalingClass::EarAndMouth => self.dial_trunk(ctx, index, destination),
            SignalingClass::Digital => Err(TdmError::invalid_state(format!(
                "{} is a trunk bearer and is dialled through its trunk group",
                self.id
            ))),
            SignalingClass::Clear => Err(TdmError::invalid_state(format!("{} carries no signalling", self.id))),
        }
    }

    fn dial_station(&mut self, ctx: &DriverContext, index: LegIndex, destination: &str) -> Result<()> {
        let line = ctx.line.as_ref();
        if index == LegIndex::Real {
            let physical = self
                .physical()
                .ok_or_else(|| TdmError::internal(format!("{} has no line", self.id)))?;

            if self.config.callerid_mode != CallerIdMode::Off {
                let now = chrono::Local::now().naive_local();
                let message = match self.config.callerid_mode {
                    CallerIdMode::Mdmf => mdmf_message(&self.caller, false, now),
                    _ => sdmf_message(&self.caller, false, now),
                };
                if self.spill.is_some() {
                    warn!("Spill already pending on {}, replacing it", self.id);
                }
                let data = line.modulate_callerid(&message, self.config.law);
                self.spill = Some(CallerIdSpill::new(SpillKind::CallerId, data, self.config.cid_rings));
            }
            self.log_hw("set cadence", line.set_cadence(physical, None));

            // Digits for a station are dialled once it answers
            self.post_answer_dial = match self.strip_destination(destination) {
                Ok(digits) if !digits.is_empty() => Some(format!("Tw{}", digits)),
                Ok(_) => None,
                Err(e) => {
                    warn!("Not dialling after answer on {}: {}", self.id, e);
                    None
                }
            };

            line.set_hook(physical, HookCommand::Ring)
                .map_err(|e| TdmError::hardware(self.id, e))?;
            self.dialing = true;
            info!("Ringing {}", self.id);
        } else {
            self.call_wait_rings = 0;
            self.play_tone(line, LegIndex::Real, Some(Tone::CallWaiting));
            self.play_tone(line, index, Some(Tone::Ringback));
            info!("Presenting waiting call on {}", self.id);
        }

        self.set_state(ctx, index, CallState::Ringing);
        self.legs.call_mut(index).pending.ringing = true;
        Ok(())
    }

    fn dial_trunk(&mut self, ctx: &DriverContext, index: LegIndex, destination: &str) -> Result<()> {
        let line = ctx.line.as_ref();
        let number = self.strip_destination(destination)?;
        let (main, after_answer) = match number.split_once('w') {
            Some((main, rest)) => (main, Some(rest)),
            None => (number, None),
        };
        let ani = self
            .caller
            .number
            .clone()
            .or_else(|| self.config.caller_number.clone());
        let dial = self
            .behavior
            .dial_string(main, ani.as_deref(), self.config.pulse_dial)
            .ok_or_else(|| TdmError::invalid_state(format!("{} cannot dial", self.id)))?;
        let physical = self
            .physical()
            .ok_or_else(|| TdmError::internal(format!("{} has no line", self.id)))?;

        if let Some(seizure) = self.behavior.seizure() {
            line.set_hook(physical, seizure)
                .map_err(|e| TdmError::hardware(self.id, e))?;
        }
        self.post_answer_dial = after_answer.filter(|d| !d.is_empty()).map(|d| format!("T{}", d));

        match self.behavior.dial_trigger() {
            DialTrigger::None => {
                if let Err(e) = line.dial(physical, &dial) {
                    self.set_hook(line, HookCommand::OnHook);
                    return Err(TdmError::hardware(self.id, e));
                }
            }
            trigger => {
                debug!("Deferring dialing on {} until {:?}", self.id, trigger);
                self.pending_dial = Some(dial);
            }
        }

        self.dialing = true;
        self.exten = main.to_string();
        self.set_state(ctx, index, CallState::Dialing);
        info!("Dialing '{}' on {}", main, self.id);
        Ok(())
    }

    /// Answer a call; a no-op once the leg is up
    pub(crate) fn answer(&mut self, ctx: &DriverContext, owner: OwnerId) -> Result<()> {
        let index = self.leg_of(owner)?;
        let previous = self.legs.state(index);
        if previous == CallState::Up {
            return Ok(());
        }
        let line = ctx.line.as_ref();
        self.set_state(ctx, index, CallState::Up);

        match self.family.class() {
            SignalingClass::Station | SignalingClass::LoopTrunk | SignalingClass::EarAndMouth => {
                if self.config.hangup_on_polarity_switch {
                    self.polarity_since = Some(Instant::now());
                }
                self.set_hook(line, HookCommand::OffHook);
                self.play_tone(line, index, None);
                self.dialing = false;
                if index == LegIndex::Real
                    && self.legs.call(LegIndex::ThreeWay).in_three_way
                    && previous == CallState::Ringing
                {
                    debug!("Finally swapping real and three-way on {}", self.id);
                    self.play_tone(line, LegIndex::ThreeWay, None);
                    self.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
                }
                self.enable_echo(line);
                self.train_echo(line);
            }
            SignalingClass::Digital => {
                self.play_tone(line, index, None);
                self.dialing = false;
                self.enable_echo(line);
                self.train_echo(line);
            }
            SignalingClass::Clear => {}
        }
        info!("Answered {} leg {}", self.id, index);
        Ok(())
    }

    /// Release an owner, handing the line to any remaining leg
    pub(crate) fn hangup(&mut self, ctx: &DriverContext, owner: OwnerId) -> HangupOutcome {
        let Some(index) = self.legs.index_of(owner) else {
            debug!("Hangup for {} which is not on {}", owner, self.id);
            return HangupOutcome {
                released: false,
                idle: self.is_unowned(),
            };
        };
        let line = ctx.line.as_ref();
        let state = self.legs.state(index);
        info!("Hangup on {} leg {} in {:?}", self.id, index, state);

        self.restore_gain(line);
        self.exten.clear();
        self.release_owner(ctx, index);
        {
            let call = self.legs.call_mut(index);
            call.state = CallState::Down;
            call.in_pbx = false;
        }
        self.polarity = Polarity::Idle;
        if self.legs.hardware(index).linear {
            if let Some(descriptor) = self.legs.descriptor(index) {
                self.log_hw("set linear", line.set_linear(descriptor, false));
            }
            self.legs.hardware_mut(index).linear = false;
        }

        match index {
            LegIndex::Real => self.hand_off_real(ctx),
            LegIndex::CallWait => {
                if self.legs.call(LegIndex::CallWait).in_three_way {
                    // Part of a three-way placed on hold: the third party becomes the waiting call
                    let third = self.legs.call_mut(LegIndex::ThreeWay);
                    third.pending.hold = true;
                    third.in_three_way = false;
                    self.legs.swap(LegIndex::CallWait, LegIndex::ThreeWay);
                    self.unalloc_sub(ctx, LegIndex::ThreeWay);
                } else {
                    self.unalloc_sub(ctx, LegIndex::CallWait);
                }
            }
            LegIndex::ThreeWay => {
                let waiting = self.legs.call_mut(LegIndex::CallWait);
                if waiting.in_three_way {
                    waiting.pending.hold = true;
                    waiting.in_three_way = false;
                }
                self.legs.call_mut(LegIndex::Real).in_three_way = false;
                self.unalloc_sub(ctx, LegIndex::ThreeWay);
            }
        }

        let idle = self.is_unowned();
        if idle {
            self.reset_idle(ctx, state);
        } else {
            conference::recompute(line, self);
        }
        HangupOutcome { released: true, idle }
    }

    fn hand_off_real(&mut self, ctx: &DriverContext) {
        let waiting = self.legs.is_allocated(LegIndex::CallWait);
        let third = self.legs.is_allocated(LegIndex::ThreeWay);

        if waiting && third {
            if self.legs.call(LegIndex::CallWait).in_three_way {
                debug!("{} was flipped to the waiting call, moving back and unowning", self.id);
                self.legs.swap(LegIndex::CallWait, LegIndex::Real);
                self.unalloc_sub(ctx, LegIndex::CallWait);
                self.absorb_events = true;
            } else {
                debug!("{} ditching the three-way, keeping the waiting call", self.id);
                self.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
                self.unalloc_sub(ctx, LegIndex::ThreeWay);
                self.absorb_events = !self.legs.call(LegIndex::Real).in_three_way;
                self.legs.call_mut(LegIndex::Real).in_three_way = false;
            }
        } else if waiting {
            self.legs.swap(LegIndex::CallWait, LegIndex::Real);
            self.unalloc_sub(ctx, LegIndex::CallWait);
            let real = self.legs.call_mut(LegIndex::Real);
            if real.state != CallState::Up {
                real.pending.answer = true;
            }
            real.pending.unhold = true;
        } else if third {
            self.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
            self.unalloc_sub(ctx, LegIndex::ThreeWay);
            if !self.legs.call(LegIndex::Real).in_three_way {
                debug!("Three-way call on {} was incomplete, unowning", self.id);
                self.absorb_events = true;
            }
            self.legs.call_mut(LegIndex::Real).in_three_way = false;
        }
    }

    /// Return the channel to idle once the last owner is gone
    fn reset_idle(&mut self, ctx: &DriverContext, last_state: CallState) {
        let line = ctx.line.as_ref();
        let class = self.family.class();

        for index in [LegIndex::CallWait, LegIndex::ThreeWay] {
            if self.legs.is_allocated(index) {
                self.unalloc_sub(ctx, index);
            }
        }
        self.legs.clear_call(LegIndex::Real);
        self.absorb_events = false;
        self.outgoing = false;
        self.rings = 0;
        self.call_wait_rings = 0;
        self.ring_context = None;
        self.cadence.reset();
        self.pending_dial = None;
        self.post_answer_dial = None;
        self.caller = CallerInfo::default();
        self.flash_time = None;
        self.polarity_since = None;

        if let Some(physical) = self.physical() {
            self.log_hw("set law", line.set_law(physical, self.config.law));
        }
        if !matches!(class, SignalingClass::Digital | SignalingClass::Clear) {
            self.set_hook(line, HookCommand::OnHook);
        }

        let off_hook = class == SignalingClass::Station
            && self
                .physical()
                .and_then(|d| self.log_hw("get params", line.get_params(d)))
                .is_some_and(|p| p.off_hook);
        // Someone still holding the receiver hears congestion
        let tone = if off_hook { Some(Tone::Congestion) } else { None };
        self.play_tone(line, LegIndex::Real, tone);

        if self.behavior.needs_hangup_guard() && last_state != CallState::Reserved {
            self.guard_until = Some(Instant::now() + ctx.timing.hangup_guard);
        }

        self.spill = None;
        self.disable_echo(line);
        self.tdd = false;
        self.audio_mode_data = false;
        self.relax_dtmf = false;
        self.dialing = false;
        self.call_waiting = self.config.call_waiting;
        self.hide_callerid = self.config.hide_callerid;
        conference::recompute(line, self);
        debug!("{} is idle", self.id);
        ctx.wake_monitor();
    }

    pub(crate) fn indicate(&mut self, ctx: &DriverContext, owner: OwnerId, indication: Indication) -> Result<()> {
        let index = self.leg_of(owner)?;
        let line = ctx.line.as_ref();
        let state = self.legs.state(index);
        let class = self.family.class();
        debug!("Indicating {:?} on {} leg {}", indication, self.id, index);

        match indication {
            Indication::Busy => self.play_tone(line, index, Some(Tone::Busy)),
            Indication::Ringing => {
                let ringing_in = state == CallState::Ring && class == SignalingClass::LoopTrunk;
                if state != CallState::Up && !ringing_in {
                    self.play_tone(line, index, Some(Tone::Ringback));
                }
            }
            Indication::Congestion => self.play_tone(line, index, Some(Tone::Congestion)),
            Indication::Proceeding | Indication::Progress | Indication::Hold | Indication::Unhold => {}
            Indication::Flash => {
                if matches!(class, SignalingClass::LoopTrunk | SignalingClass::EarAndMouth) {
                    self.pending_dial = None;
                    let physical = self
                        .physical()
                        .ok_or_else(|| TdmError::internal(format!("{} has no line", self.id)))?;
                    ctx.line
                        .set_hook(physical, HookCommand::Flash)
                        .map_err(|e| TdmError::hardware(self.id, e))?;
                }
            }
            Indication::Stop => self.play_tone(line, index, None),
        }
        Ok(())
    }

    pub(crate) fn send_digit(&mut self, ctx: &DriverContext, owner: OwnerId, digit: char) -> Result<()> {
        let index = self.leg_of(owner)?;
        if !matches!(digit, '0'..='9' | '*' | '#' | 'A'..='D') {
            return Err(TdmError::invalid_argument(format!("'{}' is not a dialable digit", digit)));
        }
        let descriptor = self
            .legs
            .descriptor(index)
            .ok_or_else(|| TdmError::internal(format!("{} leg {} has no descriptor", self.id, index)))?;
        ctx.line
            .dial(descriptor, &format!("T{}", digit))
            .map_err(|e| TdmError::hardware(self.id, e))?;
        if index == LegIndex::Real {
            self.dialing = true;
        }
        Ok(())
    }

    /// Send text as TDD tones; ignored unless TDD mode is on
    pub(crate) fn send_text(&mut self, ctx: &DriverContext, owner: OwnerId, text: &str) -> Result<()> {
        let index = self.leg_of(owner)?;
        if text.is_empty() || !self.tdd {
            return Ok(());
        }
        let descriptor = self
            .legs
            .descriptor(index)
            .ok_or_else(|| TdmError::internal(format!("{} leg {} has no descriptor", self.id, index)))?;
        let data = ctx.line.modulate_tdd(text, self.config.law);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + READ_SIZE).min(data.len());
            match ctx.line.write(descriptor, &data[offset..end]) {
                Ok(0) => {
                    warn!("Short TDD write on {}", self.id);
                    break;
                }
                Ok(written) => offset += written,
                Err(e) => return Err(TdmError::hardware(self.id, e)),
            }
        }
        Ok(())
    }

    /// Next frame for an owner: pending indications, then line events, then audio
    pub(crate) fn read_frame(&mut self, ctx: &DriverContext, owner: OwnerId) -> Result<EventResult> {
        let index = self.leg_of(owner)?;

        if let Some(control) = self.legs.call_mut(index).pending.take_next() {
            match control {
                crate::collaborator::Control::Ringing => self.set_state(ctx, index, CallState::Ringing),
                crate::collaborator::Control::Answer => self.set_state(ctx, index, CallState::Up),
                _ => {}
            }
            return Ok(EventResult::frame(Frame::Control(control)));
        }

        let line = ctx.line.as_ref();
        if index == LegIndex::Real || self.legs.owner(LegIndex::Real).is_none() {
            if let Some(physical) = self.physical() {
                match line.get_event(physical) {
                    Ok(Some(event)) => return Ok(events::handle_event(self, ctx, index, event)),
                    Ok(None) => {}
                    Err(e) => warn!("Unable to read event on {}: {}", self.id, e),
                }
            }
        }

        if index == LegIndex::Real {
            let up = self.legs.state(LegIndex::Real) == CallState::Up;
            let due = self
                .spill
                .as_ref()
                .is_some_and(|spill| up || spill.window(self.rings) == SpillWindow::Open);
            if due {
                self.write_spill(line);
            }
        }

        let Some(descriptor) = self.legs.descriptor(index) else {
            return Ok(EventResult::null());
        };
        let size = if self.legs.hardware(index).linear {
            READ_SIZE * 2
        } else {
            READ_SIZE
        };
        let mut buf = vec![0u8; size];
        let read = match line.read(descriptor, &mut buf) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(EventResult::null()),
            Err(e) => {
                warn!("Read failed on {} leg {}: {}", self.id, index, e);
                return Ok(EventResult::null());
            }
        };
        if read == 0 {
            return Ok(EventResult::null());
        }

        let state = self.legs.state(index);
        let muted = self.dialing
            || (index != LegIndex::Real && state != CallState::Up)
            || (index == LegIndex::CallWait && !self.legs.call(LegIndex::CallWait).in_three_way);
        if muted {
            return Ok(EventResult::null());
        }
        buf.truncate(read);
        Ok(EventResult::frame(Frame::Voice(Bytes::from(buf))))
    }

    pub(crate) fn write_frame(&mut self, ctx: &DriverContext, owner: OwnerId, frame: &Frame) -> Result<()> {
        let index = self.leg_of(owner)?;
        let data = match frame {
            Frame::Voice(data) => data,
            Frame::Null => return Ok(()),
            other => {
                debug!("Ignoring {:?} written to {}", other, self.id);
                return Ok(());
            }
        };
        if self.dialing {
            debug!("Dropping frame while dialing on {}", self.id);
            return Ok(());
        }
        if self.absorb_events {
            debug!("Dropping frame, no active owner on {}", self.id);
            return Ok(());
        }
        if self.spill.is_some() {
            debug!("Dropping frame during caller id spill on {}", self.id);
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }
        if let Some(descriptor) = self.legs.descriptor(index) {
            self.log_hw("write", ctx.line.write(descriptor, data));
        }
        Ok(())
    }

    pub(crate) fn set_option(&mut self, ctx: &DriverContext, owner: OwnerId, option: ChannelOption) -> Result<()> {
        self.leg_of(owner)?;
        let line = ctx.line.as_ref();
        match option {
            ChannelOption::RxGain(delta) => {
                if delta.abs() < f32::EPSILON {
                    self.restore_gain(line);
                } else {
                    self.bump_gain(line, delta);
                }
            }
            ChannelOption::EchoCancel(true) => {
                self.enable_echo(line);
                self.train_echo(line);
            }
            ChannelOption::EchoCancel(false) => self.disable_echo(line),
            ChannelOption::Tdd(on) => self.tdd = on,
            ChannelOption::AudioMode(audio) => {
                self.audio_mode_data = !audio;
                if !audio {
                    self.disable_echo(line);
                }
            }
            ChannelOption::RelaxDtmf(relax) => self.relax_dtmf = relax,
        }
        debug!("Set {:?} on {}", option, self.id);
        Ok(())
    }

    /// Move a leg from one owner to another, returning the leg it sits on
    pub(crate) fn fixup(&mut self, ctx: &DriverContext, old: OwnerId, new: OwnerId) -> Result<LegIndex> {
        let index = self.leg_of(old)?;
        self.legs.call_mut(index).owner = Some(new);
        ctx.owners.remove(&old);
        ctx.owners.insert(new, self.id);
        if self.legs.state(index) == CallState::Ringing {
            self.play_tone(ctx.line.as_ref(), index, Some(Tone::Ringback));
        }
        conference::recompute(ctx.line.as_ref(), self);
        debug!("Fixed up {} from {} to {}", self.id, old, new);
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::signaling::SignalingFamily;
    use crate::config::ChannelConfig;
    use crate::testing::{LineCall, MockCallControl, MockLine};
    use crate::types::ChannelId;
    use std::sync::Arc;

    fn setup(family: SignalingFamily) -> (Arc<MockLine>, Arc<MockCallControl>, DriverContext, Channel) {
        let line = Arc::new(MockLine::new());
        let control = Arc::new(MockCallControl::new());
        let ctx = DriverContext::new(line.clone(), control.clone(), Default::default());
        let config = ChannelConfig::new(ChannelId(4), family);
        let channel = Channel::open(line.as_ref(), config, None).unwrap();
        line.clear_calls();
        (line, control, ctx, channel)
    }

    #[test]
    fn test_hangup_is_idempotent() {
        let (line, _control, ctx, mut ch) = setup(SignalingFamily::FxsGroundStart);
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        ch.answer(&ctx, owner).unwrap();

        let first = ch.hangup(&ctx, owner);
        assert!(first.released && first.idle);
        assert!(ch.guard_until.is_some());
        let issued = line.calls().len();

        let second = ch.hangup(&ctx, owner);
        assert!(!second.released);
        assert_eq!(line.calls().len(), issued);
    }

    #[test]
    fn test_dial_rejects_busy_state() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxsLoopStart);
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        ch.answer(&ctx, owner).unwrap();
        let err = ch.dial(&ctx, owner, "5551212", &CallerInfo::default()).unwrap_err();
        assert!(matches!(err, TdmError::InvalidState(_)));
    }

    #[test]
    fn test_dial_short_number_fails() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxsLoopStart);
        ch.config.strip_digits = 3;
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        let err = ch.dial(&ctx, owner, "12", &CallerInfo::default()).unwrap_err();
        assert!(matches!(err, TdmError::InvalidArgument(_)));
    }

    #[test]
    fn test_loop_trunk_dial_waits_for_hook_complete() {
        let (line, _control, ctx, mut ch) = setup(SignalingFamily::FxsLoopStart);
        ch.config.strip_digits = 1;
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        ch.dial(&ctx, owner, "95551212w42", &CallerInfo::default()).unwrap();

        let physical = ch.physical().unwrap();
        assert_eq!(ch.state(LegIndex::Real), CallState::Dialing);
        assert_eq!(ch.pending_dial.as_deref(), Some("T5551212w"));
        assert_eq!(ch.post_answer_dial.as_deref(), Some("T42"));
        assert!(line.calls().contains(&LineCall::SetHook(physical, HookCommand::Start)));

        line.inject(physical, crate::line::LineEvent::HookComplete);
        ch.read_frame(&ctx, owner).unwrap();
        assert!(line.calls().contains(&LineCall::Dial(physical, "T5551212w".to_string())));
        assert!(ch.pending_dial.is_none());
    }

    #[test]
    fn test_feature_group_d_dial_string() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FeatD);
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        let caller = CallerInfo {
            number: Some("2565551000".into()),
            ..Default::default()
        };
        ch.dial(&ctx, owner, "5551212", &caller).unwrap();
        assert_eq!(ch.pending_dial.as_deref(), Some("T*2565551000*5551212*"));
    }

    #[test]
    fn test_station_dial_rings_and_queues_spill() {
        let (line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        ch.dial(&ctx, owner, "", &CallerInfo::default()).unwrap();

        assert!(line
            .calls()
            .contains(&LineCall::SetHook(ch.physical().unwrap(), HookCommand::Ring)));
        assert!(ch.spill.is_some());
        assert!(ch.dialing);
        let frame = ch.read_frame(&ctx, owner).unwrap().frame;
        assert_eq!(frame, Frame::Control(crate::collaborator::Control::Ringing));
        assert_eq!(ch.state(LegIndex::Real), CallState::Ringing);
    }

    #[test]
    fn test_answer_is_idempotent() {
        let (line, _control, ctx, mut ch) = setup(SignalingFamily::FxsLoopStart);
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        ch.answer(&ctx, owner).unwrap();
        let issued = line.calls().len();
        ch.answer(&ctx, owner).unwrap();
        assert_eq!(line.calls().len(), issued);
    }

    #[test]
    fn test_hangup_hands_line_to_waiting_call() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        let active = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        ch.answer(&ctx, active).unwrap();
        let waiting = ch.claim_leg(&ctx, Availability::CallWait).unwrap();
        ch.set_state(&ctx, LegIndex::CallWait, CallState::Ringing);

        let outcome = ch.hangup(&ctx, active);
        assert!(outcome.released && !outcome.idle);
        assert_eq!(ch.owner(LegIndex::Real), Some(waiting));
        assert!(!ch.legs.is_allocated(LegIndex::CallWait));
        assert!(ch.legs.call(LegIndex::Real).pending.answer);
        assert_eq!(ch.legs.owner_count(), 1);
    }

    #[test]
    fn test_gain_option_round_trip() {
        let (line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        ch.config.rx_gain = 2.0;
        ch.apply_gains(line.as_ref());
        let physical = ch.physical().unwrap();
        let before = line.gains(physical).unwrap();
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();

        ch.set_option(&ctx, owner, ChannelOption::RxGain(6.0)).unwrap();
        assert_ne!(line.gains(physical).unwrap(), before);
        ch.set_option(&ctx, owner, ChannelOption::RxGain(0.0)).unwrap();
        assert_eq!(line.gains(physical).unwrap(), before);
    }

    #[test]
    fn test_write_dropped_while_dialing() {
        let (line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        let owner = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        ch.dialing = true;
        ch.write_frame(&ctx, owner, &Frame::Voice(Bytes::from_static(&[0xff; 160])))
            .unwrap();
        assert!(!line.calls().iter().any(|c| matches!(c, LineCall::Write(..))));
    }

    #[test]
    fn test_fixup_moves_owner() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        let old = ch.claim_leg(&ctx, Availability::Idle).unwrap();
        let new = OwnerId(9000);
        assert_eq!(ch.fixup(&ctx, old, new).unwrap(), LegIndex::Real);
        assert_eq!(ch.owner(LegIndex::Real), Some(new));
        assert_eq!(ctx.channel_of(old), None);
        assert_eq!(ctx.channel_of(new), Some(ch.id()));
        assert!(matches!(ch.fixup(&ctx, old, new), Err(TdmError::UnknownOwner(_))));
    }
}
