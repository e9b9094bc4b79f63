//! Hardware event handling.
//!
//! Events on a channel with an owner arrive through that owner's frame reads
//! and go through [`handle_event`]; events on a channel nobody owns are picked
//! up by the monitor and go through [`handle_idle_event`]. Both run under the
//! channel lock. Anything that must call into the collaborator at length, or
//! spawn a task, is returned as a [`Followup`] for the caller to run after
//! the lock is released.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::digits;
use super::signaling::{DialTrigger, Signal, SignalingClass};
use super::{Channel, ChannelHandle};
use crate::collaborator::{Control, Frame};
use crate::conference;
use crate::config::CallerIdStart;
use crate::context::DriverContext;
use crate::error::Cause;
use crate::line::LineEvent;
use crate::types::{CallState, HookCommand, LegIndex, OwnerId, Polarity, Tone};

/// An on-hook this soon after a flash is hook bounce
pub const MIN_FLASH_TO_HANGUP: Duration = Duration::from_millis(2000);

/// Polarity reversals this soon after answer do not hang up
pub const POLARITY_ANSWER_DELAY: Duration = Duration::from_millis(600);

/// Work that must run after the channel lock is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    /// Collect digits for a freshly seized leg
    CollectDigits { owner: OwnerId },
    /// Hand the owner straight to the dial plan
    StartPbx {
        owner: OwnerId,
        context: String,
        extension: String,
    },
}

impl Followup {
    /// Run the followup. The channel lock must not be held.
    pub(crate) fn dispatch(self, handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>) {
        match self {
            Followup::CollectDigits { owner } => {
                tokio::spawn(digits::collect(handle.clone(), ctx.clone(), owner));
            }
            Followup::StartPbx {
                owner,
                context,
                extension,
            } => {
                if ctx.control.start_pbx(owner, &context, &extension) {
                    return;
                }
                warn!("Unable to start dial plan for {} on {}", owner, handle.id());
                let channel = handle.lock();
                if let Some(index) = channel.legs.index_of(owner) {
                    channel.play_tone(ctx.line.as_ref(), index, Some(Tone::Congestion));
                }
            }
        }
    }
}

/// Outcome of an event on an owned channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResult {
    /// Frame handed to the reading owner
    pub frame: Frame,
    pub followup: Option<Followup>,
}

impl EventResult {
    pub(crate) fn null() -> Self {
        Self {
            frame: Frame::Null,
            followup: None,
        }
    }

    pub(crate) fn frame(frame: Frame) -> Self {
        Self { frame, followup: None }
    }

    fn control(control: Control) -> Self {
        Self::frame(Frame::Control(control))
    }
}

/// Handle an event read by the owner of leg `index`
pub(crate) fn handle_event(ch: &mut Channel, ctx: &DriverContext, index: LegIndex, event: LineEvent) -> EventResult {
    let signal = ch.behavior.decode(event);
    debug!("{} leg {} got {:?} ({:?})", ch.id, index, event, signal);

    if ch.absorb_events || (index != LegIndex::Real && ch.legs.owner(LegIndex::Real).is_none()) {
        absorb(ch, ctx, signal);
        return EventResult::null();
    }

    let line = ctx.line.as_ref();
    match signal {
        Signal::Digit(digit) => EventResult::frame(Frame::Dtmf(digit)),
        Signal::PulseStart => {
            if !ch.dialing {
                ch.play_tone(line, index, None);
            }
            EventResult::null()
        }
        Signal::DialComplete => dial_complete(ch, ctx, index),
        Signal::HookComplete => release_pending_dial(ch, ctx, DialTrigger::HookComplete),
        Signal::Wink => release_pending_dial(ch, ctx, DialTrigger::Wink),
        Signal::NoAlarm => {
            ch.in_alarm = false;
            info!("Alarm cleared on {}", ch.id);
            EventResult::null()
        }
        Signal::Alarm => {
            ch.in_alarm = true;
            warn!("Detected alarm on {}", ch.id);
            on_hook(ch, ctx, index)
        }
        Signal::OnHook => on_hook(ch, ctx, index),
        Signal::OffHook => station_off_hook(ch, ctx, index),
        Signal::Ring => trunk_ring(ch, ctx, index),
        Signal::Flash => flash(ch, ctx, index),
        Signal::RingCycleDone => ring_cycle_done(ch, ctx),
        Signal::Polarity => polarity(ch, ctx, index),
        Signal::RingerOn | Signal::RingBegin | Signal::Ignore => EventResult::null(),
    }
}

fn release_pending_dial(ch: &mut Channel, ctx: &DriverContext, trigger: DialTrigger) -> EventResult {
    if ch.in_alarm || ch.behavior.dial_trigger() != trigger {
        return EventResult::null();
    }
    let Some(dial) = ch.pending_dial.take() else {
        debug!("Ignoring {:?} on {}", trigger, ch.id);
        return EventResult::null();
    };
    if let Some(descriptor) = ch.physical() {
        if ch.log_hw("dial", ctx.line.dial(descriptor, &dial)).is_some() {
            ch.dialing = true;
            debug!("Sent deferred dial string on {}", ch.id);
        }
    }
    EventResult::null()
}

fn dial_complete(ch: &mut Channel, ctx: &DriverContext, index: LegIndex) -> EventResult {
    if ch.in_alarm {
        return EventResult::null();
    }
    let line = ctx.line.as_ref();
    if let Some(descriptor) = ch.physical() {
        if ch.log_hw("check dialing", line.is_dialing(descriptor)).unwrap_or(false) {
            return EventResult::null();
        }
    }
    ch.enable_echo(line);
    ch.train_echo(line);
    ch.dialing = false;

    match ch.legs.state(index) {
        CallState::DialingOffHook => {
            ch.set_state(ctx, index, CallState::Up);
            EventResult::control(Control::Answer)
        }
        CallState::Dialing => {
            if ch.family.class() == SignalingClass::EarAndMouth {
                // Wait for answer supervision
                ch.set_state(ctx, index, CallState::Ringing);
                EventResult::null()
            } else if !ch.config.answer_on_polarity_switch {
                ch.set_state(ctx, index, CallState::Up);
                ch.polarity = Polarity::Reversed;
                EventResult::control(Control::Answer)
            } else {
                ch.polarity = Polarity::Idle;
                EventResult::null()
            }
        }
        _ => EventResult::null(),
    }
}

fn on_hook(ch: &mut Channel, ctx: &DriverContext, index: LegIndex) -> EventResult {
    let line = ctx.line.as_ref();
    if ch.family.class() == SignalingClass::Station {
        if index != LegIndex::Real {
            warn!("Got a hangup on {} leg {}", ch.id, index);
        } else if ch.legs.owner(LegIndex::CallWait).is_some() {
            ch.legs.swap(LegIndex::CallWait, LegIndex::Real);
            info!("{} still has a waiting call, ringing phone", ch.id);
            ch.unalloc_sub(ctx, LegIndex::CallWait);
            ch.absorb_events = true;
            if ch.legs.state(LegIndex::Real) != CallState::Up {
                ch.dialing = true;
            }
            ch.ring_phone(line);
        } else if let Some(third) = ch.legs.owner(LegIndex::ThreeWay) {
            three_way_on_hook(ch, ctx, third);
        }
    }
    ch.disable_echo(line);
    conference::recompute(line, ch);
    EventResult::control(Control::Hangup)
}

fn three_way_on_hook(ch: &mut Channel, ctx: &DriverContext, third: OwnerId) {
    let line = ctx.line.as_ref();
    let bounce = ch.flash_time.is_some_and(|t| t.elapsed() < MIN_FLASH_TO_HANGUP);
    let real = ch.legs.call(LegIndex::Real).clone();

    if bounce {
        debug!("Hook bounce after flash on {}, dropping both calls", ch.id);
        ctx.control.soft_hangup(third, Cause::NormalClearing);
    } else if real.in_pbx || real.state == CallState::Up {
        if !ch.config.transfer {
            ctx.control.soft_hangup(third, Cause::NormalClearing);
            return;
        }
        ch.legs.call_mut(LegIndex::Real).in_three_way = false;
        ch.legs.call_mut(LegIndex::ThreeWay).in_three_way = false;
        if !ch.config.transfer_to_busy && real.state == CallState::Busy {
            ch.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
            ch.absorb_events = true;
            ch.ring_phone(line);
        } else if let Some(target) = real.owner {
            if ctx.control.attempt_transfer(third, target) {
                info!("Transferred {} to {} on {}", third, target, ch.id);
            } else {
                ctx.control.soft_hangup(third, Cause::NormalClearing);
            }
        }
    } else {
        // The third party was never reached: go back to the held call
        ch.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
        ch.absorb_events = true;
        ch.ring_phone(line);
    }
}

fn station_off_hook(ch: &mut Channel, ctx: &DriverContext, index: LegIndex) -> EventResult {
    let line = ctx.line.as_ref();
    match ch.legs.state(index) {
        CallState::Ringing => {
            ch.enable_echo(line);
            ch.train_echo(line);
            ch.set_hook(line, HookCommand::OffHook);
            ch.spill = None;
            ch.dialing = false;
            if let Some(dial) = ch.post_answer_dial.take() {
                let sent = ch
                    .physical()
                    .and_then(|d| ch.log_hw("dial", line.dial(d, &dial)))
                    .is_some();
                if sent {
                    ch.dialing = true;
                    ch.set_state(ctx, index, CallState::DialingOffHook);
                    return EventResult::null();
                }
            }
            ch.set_state(ctx, index, CallState::Up);
            EventResult::control(Control::Answer)
        }
        CallState::Down => {
            ch.set_state(ctx, index, CallState::Ring);
            ch.rings = 1;
            info!("{} picked up", ch.id);
            EventResult::control(Control::OffHook)
        }
        CallState::Up => {
            // Stop any recall ringing; a held call is coming back
            ch.set_hook(line, HookCommand::OffHook);
            ch.play_tone(line, index, None);
            ch.legs.call_mut(index).pending.unhold = true;
            EventResult::null()
        }
        CallState::Reserved => {
            ch.play_tone(line, index, Some(dial_tone(ch, ctx)));
            EventResult::null()
        }
        other => {
            warn!("Off hook in unexpected state {:?} on {}", other, ch.id);
            EventResult::null()
        }
    }
}

/// Stutter dial tone when the station has messages waiting
pub(crate) fn dial_tone(ch: &Channel, ctx: &DriverContext) -> Tone {
    let waiting = ch
        .config
        .mailbox
        .as_deref()
        .is_some_and(|mailbox| ctx.control.has_voicemail(mailbox));
    if waiting {
        Tone::StutterDialTone
    } else {
        Tone::DialTone
    }
}

fn trunk_ring(ch: &mut Channel, ctx: &DriverContext, index: LegIndex) -> EventResult {
    let state = ch.legs.state(index);
    if state == CallState::PreRing {
        ch.set_state(ctx, index, CallState::Ring);
        return EventResult::control(Control::Ring);
    }
    if ch.family.class() == SignalingClass::LoopTrunk {
        // Answer supervision on loop trunks comes from dial completion or polarity
        return EventResult::null();
    }

    match state {
        CallState::Down | CallState::Ring => {
            debug!("Ring detected on {}", ch.id);
            EventResult::control(Control::Ring)
        }
        CallState::Ringing | CallState::Dialing if ch.outgoing => {
            debug!("Line answered on {}", ch.id);
            if let Some(dial) = ch.post_answer_dial.take() {
                let sent = ch
                    .physical()
                    .and_then(|d| ch.log_hw("dial", ctx.line.dial(d, &dial)))
                    .is_some();
                if sent {
                    ch.dialing = true;
                    ch.set_state(ctx, index, CallState::DialingOffHook);
                    return EventResult::null();
                }
            }
            ch.set_state(ctx, index, CallState::Up);
            EventResult::control(Control::Answer)
        }
        other => {
            warn!("Ring/off-hook in unexpected state {:?} on {}", other, ch.id);
            EventResult::null()
        }
    }
}

fn flash(ch: &mut Channel, ctx: &DriverContext, index: LegIndex) -> EventResult {
    if ch.in_alarm {
        return EventResult::null();
    }
    ch.flash_time = Some(Instant::now());
    if index != LegIndex::Real {
        warn!("Flash on {} leg {} ignored", ch.id, index);
        return EventResult::null();
    }

    let line = ctx.line.as_ref();
    let mut result = EventResult::null();

    if ch.legs.owner(LegIndex::CallWait).is_some() {
        ch.legs.swap(LegIndex::Real, LegIndex::CallWait);
        ch.play_tone(line, LegIndex::Real, None);
        if ch.legs.state(LegIndex::Real) == CallState::Ringing {
            ch.set_state(ctx, LegIndex::Real, CallState::Up);
            ch.legs.call_mut(LegIndex::Real).pending.answer = true;
        }
        ch.legs.call_mut(LegIndex::CallWait).pending.hold = true;
        ch.legs.call_mut(LegIndex::Real).pending.unhold = true;
        info!("{} flashed to the waiting call", ch.id);
    } else if ch.legs.owner(LegIndex::ThreeWay).is_none() {
        if !ch.config.three_way_calling {
            ch.legs.call_mut(LegIndex::Real).pending.flash = true;
        } else {
            let real = ch.legs.call(LegIndex::Real);
            if real.in_pbx || matches!(real.state, CallState::Up | CallState::Ring) {
                result = start_three_way(ch, ctx);
            } else {
                debug!("Flash when call not up or ringing on {}", ch.id);
            }
        }
    } else if ch.legs.call(LegIndex::ThreeWay).in_three_way {
        // Already conferenced: drop the last party
        if ch.legs.state(LegIndex::Real) != CallState::Up && ch.legs.state(LegIndex::ThreeWay) == CallState::Up {
            ch.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
        }
        if let Some(third) = ch.legs.owner(LegIndex::ThreeWay) {
            ctx.control.soft_hangup(third, Cause::NormalClearing);
        }
        ch.legs.call_mut(LegIndex::Real).in_three_way = false;
        ch.legs.call_mut(LegIndex::ThreeWay).in_three_way = false;
        info!("Dropped three-way party on {}", ch.id);
    } else {
        let real = ch.legs.call(LegIndex::Real).clone();
        let eligible = (real.in_pbx || real.state == CallState::Up)
            && (ch.config.transfer_to_busy || real.state != CallState::Busy);
        if eligible {
            ch.legs.call_mut(LegIndex::Real).in_three_way = true;
            ch.legs.call_mut(LegIndex::ThreeWay).in_three_way = true;
            let held = if real.state == CallState::Up {
                ch.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
                LegIndex::Real
            } else {
                LegIndex::ThreeWay
            };
            ch.legs.call_mut(held).pending.unhold = true;
            if real.state == CallState::Ringing {
                ch.play_tone(line, LegIndex::Real, Some(Tone::Ringback));
                ch.play_tone(line, LegIndex::ThreeWay, Some(Tone::Ringback));
            }
            info!("Built three-way conference on {}", ch.id);
        } else {
            info!("Dumping incomplete call on {}", ch.id);
            ch.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
            if let Some(third) = ch.legs.owner(LegIndex::ThreeWay) {
                ctx.control.soft_hangup(third, Cause::NormalClearing);
            }
            ch.legs.call_mut(LegIndex::Real).pending.unhold = true;
            ch.enable_echo(line);
        }
    }

    conference::recompute(line, ch);
    result
}

fn start_three_way(ch: &mut Channel, ctx: &DriverContext) -> EventResult {
    let line = ctx.line.as_ref();
    if let Err(e) = ch.alloc_sub(line, LegIndex::ThreeWay) {
        warn!("Unable to allocate three-way leg on {}: {}", ch.id, e);
        return EventResult::null();
    }
    let Some(owner) = ch.create_owner(ctx, LegIndex::ThreeWay, CallState::Reserved, "", false) else {
        ch.unalloc_sub(ctx, LegIndex::ThreeWay);
        return EventResult::null();
    };

    // The new call takes the physical line; the current call goes on hold
    ch.legs.swap(LegIndex::ThreeWay, LegIndex::Real);
    ch.disable_echo(line);
    ch.play_tone(line, LegIndex::Real, Some(Tone::DialRecall));
    ch.legs.call_mut(LegIndex::ThreeWay).pending.hold = true;
    info!("Started three-way call on {}", ch.id);

    EventResult {
        frame: Frame::Null,
        followup: Some(Followup::CollectDigits { owner }),
    }
}

fn ring_cycle_done(ch: &mut Channel, ctx: &DriverContext) -> EventResult {
    if ch.in_alarm {
        return EventResult::null();
    }
    ch.rings += 1;
    if let Some(spill) = &ch.spill {
        match spill.window(ch.rings) {
            super::callerid::SpillWindow::Missed => {
                warn!("Caller id spill on {} not finished, cancelling", ch.id);
                ch.spill = None;
            }
            super::callerid::SpillWindow::Open => ch.write_spill(ctx.line.as_ref()),
            super::callerid::SpillWindow::Early => {}
        }
    }
    EventResult::control(Control::Ringing)
}

fn polarity(ch: &mut Channel, ctx: &DriverContext, index: LegIndex) -> EventResult {
    let mut result = EventResult::null();
    if ch.polarity == Polarity::Idle {
        ch.polarity = Polarity::Reversed;
        let state = ch.legs.state(index);
        if ch.config.answer_on_polarity_switch && matches!(state, CallState::Dialing | CallState::Ringing) {
            debug!("Answering on polarity switch on {}", ch.id);
            ch.set_state(ctx, index, CallState::Up);
            ch.dialing = false;
            ch.polarity_since = Some(Instant::now());
            result = EventResult::control(Control::Answer);
        } else {
            debug!("Ignoring switch to reversed polarity on {} in {:?}", ch.id, state);
        }
    }

    let state = ch.legs.state(index);
    if ch.config.hangup_on_polarity_switch
        && ch.polarity == Polarity::Reversed
        && matches!(state, CallState::Up | CallState::Ring)
    {
        let settled = ch
            .polarity_since
            .map_or(true, |since| since.elapsed() > POLARITY_ANSWER_DELAY);
        if settled {
            debug!("Polarity reversal hangup on {}", ch.id);
            if let Some(owner) = ch.legs.owner(index) {
                ctx.control.soft_hangup(owner, Cause::NormalClearing);
            }
            ch.polarity = Polarity::Idle;
        } else {
            debug!("Polarity reversal too close to answer on {}", ch.id);
        }
    } else {
        ch.polarity = Polarity::Idle;
    }
    result
}

/// Events while the real leg's owner is not the active party
fn absorb(ch: &mut Channel, ctx: &DriverContext, signal: Signal) {
    let line = ctx.line.as_ref();
    let has_owner = ch.legs.owner(LegIndex::Real).is_some();
    if has_owner && !matches!(signal, Signal::RingCycleDone | Signal::RingerOn | Signal::HookComplete) {
        ch.legs.call_mut(LegIndex::Real).pending.unhold = true;
    }

    match signal {
        Signal::OnHook => {
            ch.disable_echo(line);
            if has_owner {
                info!("{} still has a call, ringing phone", ch.id);
                ch.ring_phone(line);
            } else {
                warn!("Absorbed on hook on {} with nobody left", ch.id);
            }
            conference::recompute(line, ch);
        }
        Signal::OffHook => {
            ch.enable_echo(line);
            ch.set_hook(line, HookCommand::OffHook);
            ch.absorb_events = false;
            ch.dialing = false;
            if has_owner && ch.legs.state(LegIndex::Real) == CallState::Ringing {
                ch.set_state(ctx, LegIndex::Real, CallState::Up);
                ch.legs.call_mut(LegIndex::Real).pending.answer = true;
            }
        }
        Signal::Flash => {
            ch.flash_time = Some(Instant::now());
            ch.absorb_events = false;
            if has_owner {
                if ch.legs.state(LegIndex::Real) != CallState::Up {
                    ch.set_state(ctx, LegIndex::Real, CallState::Up);
                    ch.legs.call_mut(LegIndex::Real).pending.answer = true;
                }
                info!("{} flashed to the other call", ch.id);
            }
            conference::recompute(line, ch);
        }
        Signal::HookComplete | Signal::RingerOn | Signal::RingCycleDone => {}
        other => debug!("Absorbed {:?} on {}", other, ch.id),
    }
}

/// Handle an event on a channel no leg owns
pub(crate) fn handle_idle_event(ch: &mut Channel, ctx: &DriverContext, event: LineEvent) -> Option<Followup> {
    let signal = ch.behavior.decode(event);
    debug!("Idle event {:?} ({:?}) on {}", event, signal, ch.id);
    let line = ctx.line.as_ref();

    match signal {
        Signal::OffHook | Signal::Flash => station_seize(ch, ctx),
        Signal::Ring | Signal::Wink => trunk_seize(ch, ctx),
        Signal::RingBegin => {
            if !ch.config.distinctive_ring.is_empty() {
                ch.cadence.reset();
                ch.cadence.ring_begin(Instant::now());
            }
            None
        }
        Signal::Polarity => idle_polarity(ch, ctx),
        Signal::NoAlarm => {
            ch.in_alarm = false;
            info!("Alarm cleared on {}", ch.id);
            None
        }
        Signal::Alarm => {
            ch.in_alarm = true;
            warn!("Detected alarm on {}", ch.id);
            idle_on_hook(ch, line);
            None
        }
        Signal::OnHook => {
            idle_on_hook(ch, line);
            None
        }
        _ => None,
    }
}

fn idle_on_hook(ch: &mut Channel, line: &dyn crate::line::LineInterface) {
    match ch.family.class() {
        SignalingClass::Station | SignalingClass::LoopTrunk | SignalingClass::EarAndMouth => {
            ch.disable_echo(line);
            ch.play_tone(line, LegIndex::Real, None);
            ch.set_hook(line, HookCommand::OnHook);
        }
        SignalingClass::Digital => {
            ch.disable_echo(line);
            ch.play_tone(line, LegIndex::Real, None);
        }
        SignalingClass::Clear => {}
    }
}

fn inbound_extension(ch: &Channel) -> String {
    if ch.config.extension.is_empty() {
        "s".to_string()
    } else {
        ch.config.extension.clone()
    }
}

fn station_seize(ch: &mut Channel, ctx: &DriverContext) -> Option<Followup> {
    if ch.in_alarm || ch.family.class() != SignalingClass::Station {
        return None;
    }
    let line = ctx.line.as_ref();
    if !ch.set_hook(line, HookCommand::OffHook) {
        return None;
    }
    if ch.spill.take().is_some() {
        debug!("Cancelled message waiting spill on {}", ch.id);
    }

    if ch.config.immediate {
        ch.enable_echo(line);
        ch.play_tone(line, LegIndex::Real, Some(Tone::Ringback));
        let extension = inbound_extension(ch);
        let Some(owner) = ch.create_owner(ctx, LegIndex::Real, CallState::Ring, &extension, false) else {
            warn!("Unable to start dial plan on {}", ch.id);
            ch.play_tone(line, LegIndex::Real, Some(Tone::Congestion));
            return None;
        };
        ch.legs.call_mut(LegIndex::Real).in_pbx = true;
        ch.exten = extension.clone();
        return Some(Followup::StartPbx {
            owner,
            context: ch.config.context.clone(),
            extension,
        });
    }

    let owner = ch.create_owner(ctx, LegIndex::Real, CallState::Reserved, "", false)?;
    let tone = dial_tone(ch, ctx);
    ch.play_tone(line, LegIndex::Real, Some(tone));
    Some(Followup::CollectDigits { owner })
}

fn trunk_seize(ch: &mut Channel, ctx: &DriverContext) -> Option<Followup> {
    if ch.in_alarm {
        return None;
    }
    if !matches!(ch.family.class(), SignalingClass::LoopTrunk | SignalingClass::EarAndMouth) {
        return None;
    }
    let line = ctx.line.as_ref();
    let Some(owner) = ch.create_owner(ctx, LegIndex::Real, CallState::Ring, "", false) else {
        ch.play_tone(line, LegIndex::Real, Some(Tone::Congestion));
        return None;
    };

    if ch.config.immediate {
        let extension = inbound_extension(ch);
        ch.enable_echo(line);
        ch.legs.call_mut(LegIndex::Real).in_pbx = true;
        ch.exten = extension.clone();
        return Some(Followup::StartPbx {
            owner,
            context: ch.config.context.clone(),
            extension,
        });
    }
    Some(Followup::CollectDigits { owner })
}

fn idle_polarity(ch: &mut Channel, ctx: &DriverContext) -> Option<Followup> {
    if ch.family.class() != SignalingClass::LoopTrunk {
        warn!("Polarity reversal on {} which is not a loop trunk", ch.id);
        return None;
    }
    if ch.config.hangup_on_polarity_switch {
        ch.polarity = Polarity::Reversed;
    }
    if ch.config.callerid_start != CallerIdStart::Polarity {
        return None;
    }
    ch.polarity = Polarity::Reversed;
    info!("Starting post-polarity caller id detection on {}", ch.id);
    let owner = ch.create_owner(ctx, LegIndex::Real, CallState::PreRing, "", false)?;
    Some(Followup::CollectDigits { owner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::signaling::SignalingFamily;
    use crate::config::ChannelConfig;
    use crate::testing::{LineCall, MockCallControl, MockLine};
    use crate::types::{ChannelId, ConfRequest};
    use std::sync::Arc;

    fn setup(family: SignalingFamily) -> (Arc<MockLine>, Arc<MockCallControl>, DriverContext, Channel) {
        let line = Arc::new(MockLine::new());
        let control = Arc::new(MockCallControl::new());
        let ctx = DriverContext::new(line.clone(), control.clone(), Default::default());
        let config = ChannelConfig::new(ChannelId(1), family);
        let channel = Channel::open(line.as_ref(), config, None).unwrap();
        line.clear_calls();
        (line, control, ctx, channel)
    }

    fn answered(ch: &mut Channel, ctx: &DriverContext) -> OwnerId {
        let owner = ch
            .create_owner(ctx, LegIndex::Real, CallState::Up, "100", false)
            .unwrap();
        ch.legs.call_mut(LegIndex::Real).in_pbx = true;
        owner
    }

    #[test]
    fn test_station_seize_plays_dial_tone() {
        let (line, control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        let followup = handle_idle_event(&mut ch, &ctx, LineEvent::RingOffHook);

        let owner = ch.owner(LegIndex::Real).unwrap();
        assert_eq!(followup, Some(Followup::CollectDigits { owner }));
        assert_eq!(ch.state(LegIndex::Real), CallState::Reserved);
        assert!(line.calls().contains(&LineCall::PlayTone(ch.physical().unwrap(), Some(Tone::DialTone))));
        assert_eq!(control.new_calls().len(), 1);
    }

    #[test]
    fn test_immediate_station_starts_at_s() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        ch.config.immediate = true;
        let followup = handle_idle_event(&mut ch, &ctx, LineEvent::RingOffHook);
        match followup {
            Some(Followup::StartPbx { extension, .. }) => assert_eq!(extension, "s"),
            other => panic!("unexpected followup {:?}", other),
        }
        assert_eq!(ch.state(LegIndex::Real), CallState::Ring);
    }

    #[test]
    fn test_flash_starts_three_way() {
        let (line, control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        let original = answered(&mut ch, &ctx);

        let result = handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::WinkFlash);

        let new_owner = ch.owner(LegIndex::Real).unwrap();
        assert_ne!(new_owner, original);
        assert_eq!(ch.owner(LegIndex::ThreeWay), Some(original));
        assert_eq!(ch.state(LegIndex::Real), CallState::Reserved);
        assert_eq!(result.followup, Some(Followup::CollectDigits { owner: new_owner }));
        assert!(line
            .calls()
            .contains(&LineCall::PlayTone(ch.physical().unwrap(), Some(Tone::DialRecall))));
        assert!(ch.legs.call(LegIndex::ThreeWay).pending.hold);
        assert_eq!(control.new_calls().len(), 2);
    }

    #[test]
    fn test_second_flash_conferences_and_third_drops() {
        let (line, control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        answered(&mut ch, &ctx);
        handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::WinkFlash);
        ch.set_state(&ctx, LegIndex::Real, CallState::Up);
        let third = ch.owner(LegIndex::Real).unwrap();

        handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::WinkFlash);
        assert!(ch.legs.call(LegIndex::Real).in_three_way);
        assert!(ch.legs.call(LegIndex::ThreeWay).in_three_way);
        assert_eq!(ch.owner(LegIndex::ThreeWay), Some(third));
        assert!(ch.conference.number.is_some());
        assert_eq!(ch.legs.three_way_members(), 2);
        assert!(line
            .calls()
            .iter()
            .any(|c| matches!(c, LineCall::SetConf(_, ConfRequest::Join { .. }))));

        handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::WinkFlash);
        assert!(!ch.legs.call(LegIndex::ThreeWay).in_three_way);
        assert_eq!(control.soft_hangups(), vec![(third, Cause::NormalClearing)]);
    }

    #[test]
    fn test_flash_without_three_way_calling_passes_flash() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        ch.config.three_way_calling = false;
        answered(&mut ch, &ctx);
        handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::WinkFlash);
        assert!(ch.legs.call(LegIndex::Real).pending.flash);
        assert!(!ch.legs.is_allocated(LegIndex::ThreeWay));
    }

    #[test]
    fn test_on_hook_with_waiting_call_rings_back() {
        let (line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        let active = answered(&mut ch, &ctx);
        ch.alloc_sub(line.as_ref(), LegIndex::CallWait).unwrap();
        let waiting = ch
            .create_owner(&ctx, LegIndex::CallWait, CallState::Up, "", false)
            .unwrap();

        let result = handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::OnHook);

        assert_eq!(result.frame, Frame::Control(Control::Hangup));
        assert_eq!(ch.owner(LegIndex::Real), Some(waiting));
        assert!(!ch.legs.is_allocated(LegIndex::CallWait));
        assert!(ch.absorb_events);
        assert_eq!(ctx.channel_of(active), None);
        assert!(line
            .calls()
            .contains(&LineCall::SetHook(ch.physical().unwrap(), HookCommand::Ring)));

        // Picking up again returns to the waiting call
        let result = handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::RingOffHook);
        assert_eq!(result.frame, Frame::Null);
        assert!(!ch.absorb_events);
        assert!(ch.legs.call(LegIndex::Real).pending.unhold);
    }

    #[test]
    fn test_outbound_station_answer() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        ch.create_owner(&ctx, LegIndex::Real, CallState::Ringing, "", false)
            .unwrap();
        ch.dialing = true;
        let result = handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::RingOffHook);
        assert_eq!(result.frame, Frame::Control(Control::Answer));
        assert_eq!(ch.state(LegIndex::Real), CallState::Up);
        assert!(!ch.dialing);
    }

    #[test]
    fn test_trunk_ring_seizes_and_collects() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxsLoopStart);
        let followup = handle_idle_event(&mut ch, &ctx, LineEvent::RingOffHook);
        let owner = ch.owner(LegIndex::Real).unwrap();
        assert_eq!(ch.state(LegIndex::Real), CallState::Ring);
        assert_eq!(followup, Some(Followup::CollectDigits { owner }));
    }

    #[test]
    fn test_em_answer_supervision() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::EmWink);
        ch.create_owner(&ctx, LegIndex::Real, CallState::Dialing, "", false)
            .unwrap();
        ch.outgoing = true;
        ch.dialing = true;

        let result = handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::DialComplete);
        assert_eq!(result.frame, Frame::Null);
        assert_eq!(ch.state(LegIndex::Real), CallState::Ringing);

        let result = handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::RingOffHook);
        assert_eq!(result.frame, Frame::Control(Control::Answer));
        assert_eq!(ch.state(LegIndex::Real), CallState::Up);
    }

    #[test]
    fn test_loop_trunk_polarity_answer_and_hangup() {
        let (_line, control, ctx, mut ch) = setup(SignalingFamily::FxsLoopStart);
        ch.config.answer_on_polarity_switch = true;
        ch.config.hangup_on_polarity_switch = true;
        let owner = ch
            .create_owner(&ctx, LegIndex::Real, CallState::Dialing, "", false)
            .unwrap();
        ch.outgoing = true;

        let result = handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::PolarityReversal);
        assert_eq!(result.frame, Frame::Control(Control::Answer));
        assert_eq!(ch.polarity, Polarity::Reversed);
        assert!(control.soft_hangups().is_empty());

        ch.polarity_since = Some(Instant::now() - Duration::from_secs(5));
        handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::PolarityReversal);
        assert_eq!(control.soft_hangups(), vec![(owner, Cause::NormalClearing)]);
    }

    #[test]
    fn test_alarm_hangs_up_owner() {
        let (_line, _control, ctx, mut ch) = setup(SignalingFamily::FxsKewlStart);
        answered(&mut ch, &ctx);
        let result = handle_event(&mut ch, &ctx, LegIndex::Real, LineEvent::Alarm);
        assert!(ch.in_alarm);
        assert_eq!(result.frame, Frame::Control(Control::Hangup));
    }

    #[test]
    fn test_idle_alarm_blocks_seizure() {
        let (_line, control, ctx, mut ch) = setup(SignalingFamily::FxoLoopStart);
        handle_idle_event(&mut ch, &ctx, LineEvent::Alarm);
        assert!(handle_idle_event(&mut ch, &ctx, LineEvent::RingOffHook).is_none());
        assert!(control.new_calls().is_empty());
        handle_idle_event(&mut ch, &ctx, LineEvent::NoAlarm);
        assert!(!ch.in_alarm);
    }
}
