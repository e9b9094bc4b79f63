//! Protocol engine for one trunk group.
//!
//! [`TrunkEngine::run`] is the group's task: it waits on the protocol stack
//! for the next event (bounded by the stack's next timer and a housekeeping
//! tick), resolves the event to a channel record and applies it, then runs
//! the periodic maintenance in [`super::maintenance`].
//!
//! Collaborator-initiated operations on bearer records (dial, answer,
//! hangup, indications and digits) arrive through the driver, which already
//! holds the channel lock; those paths only talk to the protocol stack and
//! never take the group lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dialplan::derive_plan;
use super::group::{DChannelStatus, TrunkGroup};
use super::maintenance;
use super::protocol::{CallRef, ChannelDesignator, SetupRequest, TrunkEvent};
use super::resolve::{principle, release_bearer, resolve};
use crate::channel::{Channel, ChannelHandle, Followup, Indication};
use crate::collaborator::{Control, Frame};
use crate::context::DriverContext;
use crate::error::{Cause, Result, TdmError};
use crate::registry::lock_pair;
use crate::types::{CallState, CallerInfo, LegIndex, OwnerId, Tone};

/// Upper bound on one wait for protocol events
pub const HOUSEKEEPING_TICK: Duration = Duration::from_secs(1);

/// Pause after the protocol stack reports an error
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

type Followups = Vec<(Arc<ChannelHandle>, Followup)>;

/// Drives one trunk group
#[derive(Debug)]
pub struct TrunkEngine {
    group: Arc<TrunkGroup>,
    ctx: Arc<DriverContext>,
}

impl TrunkEngine {
    pub fn new(group: Arc<TrunkGroup>, ctx: Arc<DriverContext>) -> Self {
        Self { group, ctx }
    }

    pub fn group(&self) -> &Arc<TrunkGroup> {
        &self.group
    }

    pub(crate) fn ctx(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    /// Run the group's scheduler until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting protocol engine for {}", self.group.id());
        loop {
            let wait = self
                .group
                .protocol()
                .next_timer()
                .map_or(HOUSEKEEPING_TICK, |t| t.min(HOUSEKEEPING_TICK));
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.group.protocol().next_event(wait) => match event {
                    Ok(Some(event)) => self.handle_event(event),
                    Ok(None) => {}
                    Err(e) => {
                        error!("Protocol error on {}: {}", self.group.id(), e);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                },
            }
            maintenance::tick(&self, Instant::now());
        }
        info!("Protocol engine for {} stopped", self.group.id());
    }

    /// Apply one protocol event
    pub fn handle_event(&self, event: TrunkEvent) {
        debug!("{} event {:?}", self.group.id(), event);
        let mut followups = Followups::new();
        match event {
            TrunkEvent::DChannelAlarm { dchannel, alarm } => self.dchannel_alarm(dchannel, alarm),
            TrunkEvent::DChannelUp { dchannel } => self.dchannel_up(dchannel),
            TrunkEvent::DChannelDown { dchannel } => self.dchannel_down(dchannel),
            TrunkEvent::Restart { channel } => self.restart(channel),
            TrunkEvent::RestartAck { channel } => self.restart_ack(channel),
            TrunkEvent::Setup {
                call,
                channel,
                called,
                caller,
                complete,
                flexible,
            } => self.setup(call, channel, called, caller, complete, flexible, &mut followups),
            TrunkEvent::SetupAck { call, channel } => self.with_call(channel, call, &mut followups, |ch, ctx| {
                let trunk = ch.trunk.as_mut()?;
                trunk.setup_ack = true;
                let queued = std::mem::take(&mut trunk.queued_digits);
                for digit in queued.chars() {
                    if let Err(e) = self.group.protocol().information(call, digit) {
                        warn!("Unable to send queued digit on {}: {}", ch.id, e);
                    }
                }
                queue(ctx, ch, Control::Progress);
                None
            }),
            TrunkEvent::Proceeding { call, channel } => self.with_call(channel, call, &mut followups, |ch, ctx| {
                let trunk = ch.trunk.as_mut()?;
                if !trunk.proceeding {
                    trunk.proceeding = true;
                    queue(ctx, ch, Control::Proceeding);
                }
                None
            }),
            TrunkEvent::Progress { call, channel } => self.with_call(channel, call, &mut followups, |ch, ctx| {
                ch.trunk.as_mut()?.progress = true;
                queue(ctx, ch, Control::Progress);
                None
            }),
            TrunkEvent::Alerting { call, channel } => self.with_call(channel, call, &mut followups, |ch, ctx| {
                let trunk = ch.trunk.as_mut()?;
                trunk.alerting = true;
                if !trunk.progress {
                    ch.play_tone(ctx.line.as_ref(), LegIndex::Real, Some(Tone::Ringback));
                }
                ch.legs.call_mut(LegIndex::Real).pending.ringing = true;
                None
            }),
            TrunkEvent::Answer { call, channel } => {
                self.with_call(channel, call, &mut followups, |ch, ctx| self.remote_answer(ch, ctx))
            }
            TrunkEvent::NotifyHold { call, channel } => self.with_call(channel, call, &mut followups, |ch, ctx| {
                queue(ctx, ch, Control::Hold);
                None
            }),
            TrunkEvent::NotifyRetrieve { call, channel } => self.with_call(channel, call, &mut followups, |ch, ctx| {
                queue(ctx, ch, Control::Unhold);
                None
            }),
            TrunkEvent::Facility { call, channel } => {
                debug!("Facility for {} on {} ignored", call, channel);
            }
            TrunkEvent::Digits { call, channel, digits } => {
                self.with_call(channel, call, &mut followups, |ch, ctx| self.digits(ch, ctx, &digits))
            }
            TrunkEvent::HangupRequest { call, channel, cause } => self.remote_hangup(call, channel, cause, true),
            TrunkEvent::Hangup { call, channel, cause } => self.remote_hangup(call, channel, cause, false),
            TrunkEvent::HangupAck { call, channel } => self.hangup_ack(call, channel),
        }
        for (handle, followup) in followups {
            followup.dispatch(&handle, &self.ctx);
        }
    }

    fn with_call<F>(&self, designator: ChannelDesignator, call: CallRef, followups: &mut Followups, apply: F)
    where
        F: FnOnce(&mut Channel, &DriverContext) -> Option<Followup>,
    {
        let Some(handle) = resolve(&self.group, &self.ctx, designator, call) else {
            return;
        };
        let followup = {
            let mut ch = handle.lock();
            apply(&mut ch, &self.ctx)
        };
        if let Some(followup) = followup {
            followups.push((handle, followup));
        }
    }

    fn dchannel_alarm(&self, dchannel: usize, alarm: bool) {
        if alarm {
            warn!("D-channel {} of {} in alarm", dchannel, self.group.id());
            self.dchannel_down(dchannel);
            return;
        }
        let mut state = self.group.state();
        if let Some(status) = state.dchannels.get_mut(dchannel) {
            if *status != DChannelStatus::Up {
                *status = DChannelStatus::NotInAlarm;
            }
        }
        info!("D-channel {} of {} out of alarm", dchannel, self.group.id());
    }

    fn dchannel_up(&self, dchannel: usize) {
        let was_up = {
            let mut state = self.group.state();
            let was_up = state.is_up();
            let Some(status) = state.dchannels.get_mut(dchannel) else {
                warn!("Unknown D-channel {} on {}", dchannel, self.group.id());
                return;
            };
            *status = DChannelStatus::Up;
            let active_up = state
                .active
                .is_some_and(|d| state.dchannels.get(d) == Some(&DChannelStatus::Up));
            if !active_up {
                state.active = Some(dchannel);
            }
            if !was_up {
                state.last_reset = Instant::now();
                state.resetting = false;
                state.reset_cursor = None;
            }
            was_up
        };
        info!("D-channel {} of {} is up", dchannel, self.group.id());
        if !was_up {
            self.group.set_alarm(&self.ctx, false);
        }
    }

    fn dchannel_down(&self, dchannel: usize) {
        let still_up = {
            let mut state = self.group.state();
            if let Some(status) = state.dchannels.get_mut(dchannel) {
                *status = DChannelStatus::Down;
            }
            let next = state.dchannels.iter().position(|s| *s == DChannelStatus::Up);
            if state.active == Some(dchannel) || state.active.is_none() {
                state.active = next;
            }
            if next.is_none() {
                // Abandon any reset cycle in progress
                state.resetting = false;
                state.reset_cursor = None;
            }
            next.is_some()
        };
        if still_up {
            info!("D-channel {} of {} down, switched to backup", dchannel, self.group.id());
        } else {
            warn!("Last D-channel of {} is down", self.group.id());
            self.group.set_alarm(&self.ctx, true);
        }
    }

    fn clear_record(&self, ch: &mut Channel, cause: Cause) {
        for index in LegIndex::ALL {
            if let Some(owner) = ch.owner(index) {
                self.ctx.control.soft_hangup(owner, cause);
            }
        }
        if let Some(trunk) = ch.trunk.as_mut() {
            if let Some(call) = trunk.call {
                self.group.protocol().destroy_call(call);
            }
            trunk.reset_call();
            trunk.resetting = false;
        }
    }

    fn restart(&self, channel: Option<ChannelDesignator>) {
        match channel {
            None => {
                info!("Restart on all channels of {}", self.group.id());
                for handle in self.group.records() {
                    self.clear_record(&mut handle.lock(), Cause::NormalClearing);
                }
            }
            Some(designator) => match principle(&self.group, designator) {
                Some(handle) => {
                    info!("Restart requested on {}", handle.id());
                    self.clear_record(&mut handle.lock(), Cause::NormalClearing);
                }
                None => warn!("Restart requested on unconfigured channel {}", designator),
            },
        }
    }

    fn restart_ack(&self, designator: ChannelDesignator) {
        let Some(handle) = principle(&self.group, designator) else {
            warn!("Restart acknowledged on unconfigured channel {}", designator);
            return;
        };
        if let Some(trunk) = handle.lock().trunk.as_mut() {
            trunk.resetting = false;
        }
        info!("{} restarted", handle.id());
        maintenance::advance_reset(self);
    }

    #[allow(clippy::too_many_arguments)]
    fn setup(
        &self,
        call: CallRef,
        channel: Option<ChannelDesignator>,
        called: String,
        caller: CallerInfo,
        complete: bool,
        flexible: bool,
        followups: &mut Followups,
    ) {
        let protocol = self.group.protocol();
        let requested = match channel {
            Some(designator) => match principle(&self.group, designator) {
                Some(handle) => Some(handle),
                None => {
                    warn!("Setup for unconfigured channel {} on {}", designator, self.group.id());
                    self.reject(call, Cause::RequestedChanUnavailable);
                    return;
                }
            },
            None => None,
        };

        let handle = match requested {
            Some(handle) if super::group::is_free(&handle) => handle,
            other => {
                if let Some(busy) = &other {
                    if !flexible {
                        warn!("Setup on busy {} and the far end will not move", busy.id());
                        self.reject(call, Cause::RequestedChanUnavailable);
                        return;
                    }
                    info!("Glare on {}, offering another bearer", busy.id());
                }
                match self.group.free_bearer(false) {
                    Some(handle) => handle,
                    None => {
                        warn!("No free bearer on {} for {}", self.group.id(), call);
                        self.reject(call, Cause::NormalCircuitCongestion);
                        return;
                    }
                }
            }
        };

        let mut ch = handle.lock();
        let Some(designator) = ch.trunk().map(|t| t.designator()) else {
            return;
        };
        if let Some(trunk) = ch.trunk.as_mut() {
            trunk.call = Some(call);
        }
        ch.caller = caller;
        ch.outgoing = false;
        ch.ring_context = Some(self.group.config().context.clone());
        let context = self.group.config().context.clone();
        let caller_number = ch.caller.number.clone();
        let control = &self.ctx.control;

        let overlap = self.group.config().overlap_dial
            && !complete
            && (called.is_empty() || control.can_match_more(&context, &called, caller_number.as_deref()));
        if overlap {
            if let Err(e) = protocol.setup_ack(call, designator, true) {
                warn!("Unable to acknowledge setup on {}: {}", ch.id, e);
            }
            let Some(_owner) = ch.create_owner(&self.ctx, LegIndex::Real, CallState::Ring, &called, false) else {
                self.refuse_locked(&mut ch, call, Cause::NormalCircuitCongestion);
                return;
            };
            if called.is_empty() {
                ch.play_tone(self.ctx.line.as_ref(), LegIndex::Real, Some(Tone::DialTone));
            }
            ch.exten = called;
            if let Some(trunk) = ch.trunk.as_mut() {
                trunk.overlap_since = Some(Instant::now());
            }
            info!("Collecting overlap digits for {} on {}", call, ch.id);
            return;
        }

        let extension = if called.is_empty() { "s".to_string() } else { called };
        if !control.extension_exists(&context, &extension, caller_number.as_deref()) {
            info!("Extension '{}' in context '{}' does not exist, rejecting {}", extension, context, call);
            if let Err(e) = protocol.hangup(call, Cause::Unallocated) {
                warn!("Unable to reject {}: {}", call, e);
            }
            if let Some(trunk) = ch.trunk.as_mut() {
                trunk.reset_call();
            }
            ch.ring_context = None;
            return;
        }

        if let Err(e) = protocol.proceeding(call, designator, false) {
            warn!("Unable to send proceeding on {}: {}", ch.id, e);
        }
        if let Some(trunk) = ch.trunk.as_mut() {
            trunk.proceeding = true;
        }
        let Some(owner) = ch.create_owner(&self.ctx, LegIndex::Real, CallState::Ring, &extension, false) else {
            self.refuse_locked(&mut ch, call, Cause::NormalCircuitCongestion);
            return;
        };
        ch.legs.call_mut(LegIndex::Real).in_pbx = true;
        ch.exten = extension.clone();
        info!("Accepting {} on {} to '{}'", call, ch.id, extension);
        drop(ch);
        followups.push((
            handle,
            Followup::StartPbx {
                owner,
                context,
                extension,
            },
        ));
    }

    fn reject(&self, call: CallRef, cause: Cause) {
        if let Err(e) = self.group.protocol().hangup(call, cause) {
            warn!("Unable to reject {}: {}", call, e);
        }
    }

    fn refuse_locked(&self, ch: &mut Channel, call: CallRef, cause: Cause) {
        warn!("Unable to allocate a call object on {}", ch.id);
        self.reject(call, cause);
        if let Some(trunk) = ch.trunk.as_mut() {
            trunk.reset_call();
        }
        ch.ring_context = None;
    }

    fn remote_answer(&self, ch: &mut Channel, ctx: &DriverContext) -> Option<Followup> {
        let line = ctx.line.as_ref();
        ch.play_tone(line, LegIndex::Real, None);
        if let Some(dial) = ch.post_answer_dial.take() {
            if let Some(physical) = ch.physical() {
                if ch.log_hw("dial", line.dial(physical, &dial)).is_some() {
                    ch.dialing = true;
                }
            }
        }

        let idle = ch.trunk.as_ref().is_some_and(|t| t.idle_call);
        if !idle {
            ch.legs.call_mut(LegIndex::Real).pending.answer = true;
            return None;
        }
        if let Some(notify) = ch.trunk.as_ref().and_then(|t| t.idle_answered.clone()) {
            notify.notify_one();
        }
        let owner = ch.owner(LegIndex::Real)?;
        let config = self.group.config();
        ch.set_state(ctx, LegIndex::Real, CallState::Up);
        ch.exten = config.idle_extension.clone();
        ch.legs.call_mut(LegIndex::Real).in_pbx = true;
        info!("Idle call on {} answered, entering '{}'", ch.id, config.idle_extension);
        Some(Followup::StartPbx {
            owner,
            context: config.idle_context.clone(),
            extension: config.idle_extension.clone(),
        })
    }

    fn digits(&self, ch: &mut Channel, ctx: &DriverContext, digits: &str) -> Option<Followup> {
        let collecting = ch.trunk.as_ref().is_some_and(|t| t.overlap_since.is_some());
        if !collecting {
            let owner = ch.owner(LegIndex::Real)?;
            if ch.state(LegIndex::Real) == CallState::Up || ch.legs.call(LegIndex::Real).in_pbx {
                for digit in digits.chars() {
                    ctx.control.queue_frame(owner, Frame::Dtmf(digit));
                }
            }
            return None;
        }

        ch.exten.push_str(digits);
        if let Some(trunk) = ch.trunk.as_mut() {
            trunk.overlap_since = Some(Instant::now());
        }
        ch.play_tone(ctx.line.as_ref(), LegIndex::Real, None);
        let context = ch.ring_context.clone().unwrap_or_else(|| ch.config.context.clone());
        let caller = ch.caller.number.clone();
        let exists = ctx.control.extension_exists(&context, &ch.exten, caller.as_deref());
        let more = ctx.control.can_match_more(&context, &ch.exten, caller.as_deref());
        if exists && !more {
            return self.finish_overlap(ch);
        }
        if !exists && !more {
            info!("No extension can match '{}' on {}", ch.exten, ch.id);
            if let Some(owner) = ch.owner(LegIndex::Real) {
                ctx.control.soft_hangup(owner, Cause::Unallocated);
            }
        }
        None
    }

    /// Overlap digits are complete: proceed and start the dial plan
    pub(crate) fn finish_overlap(&self, ch: &mut Channel) -> Option<Followup> {
        let trunk = ch.trunk.as_mut()?;
        trunk.overlap_since = None;
        let call = trunk.call?;
        let designator = trunk.designator();
        if !trunk.proceeding {
            trunk.proceeding = true;
            if let Err(e) = self.group.protocol().proceeding(call, designator, false) {
                warn!("Unable to send proceeding on {}: {}", ch.id, e);
            }
        }
        let owner = ch.owner(LegIndex::Real)?;
        ch.legs.call_mut(LegIndex::Real).in_pbx = true;
        let context = ch.ring_context.clone().unwrap_or_else(|| ch.config.context.clone());
        info!("Overlap dialling complete on {}: '{}'", ch.id, ch.exten);
        Some(Followup::StartPbx {
            owner,
            context,
            extension: ch.exten.clone(),
        })
    }

    /// Far end cleared or asked to clear a call
    fn remote_hangup(&self, call: CallRef, designator: ChannelDesignator, cause: Cause, request: bool) {
        let Some(handle) = resolve(&self.group, &self.ctx, designator, call) else {
            warn!("Hangup for {} on unknown channel {}", call, designator);
            return;
        };
        if cause == Cause::RequestedChanUnavailable {
            self.force_reset(&handle);
        }

        let real_call = handle.lock().trunk().and_then(|t| t.real_call);
        if let Some(real) = real_call.and_then(|id| self.group.record(id)) {
            // The bearer carries a call-reference record: every leg of it goes
            self.hangup_all(real, cause, request);
            return;
        }

        let mut ch = handle.lock();
        if ch.trunk().is_some_and(|t| t.crv.is_some()) {
            drop(ch);
            self.hangup_all(&handle, cause, request);
            return;
        }

        let already = ch.trunk().is_some_and(|t| t.already_hungup);
        if !request && already {
            // We hung up first; this completes the clearing
            self.reject(call, cause);
            if let Some(trunk) = ch.trunk.as_mut() {
                trunk.reset_call();
            }
            return;
        }
        if !request {
            if let Some(trunk) = ch.trunk.as_mut() {
                trunk.already_hungup = true;
            }
        }

        let Some(owner) = ch.owner(LegIndex::Real) else {
            debug!("{} cleared on unowned {}", call, ch.id);
            self.reject(call, cause);
            if let Some(trunk) = ch.trunk.as_mut() {
                trunk.reset_call();
            }
            return;
        };
        info!("{} got hangup{} for {}, cause {:?}", ch.id, if request { " request" } else { "" }, call, cause);
        if ch.state(LegIndex::Real) == CallState::Up {
            self.ctx.control.soft_hangup(owner, cause);
            return;
        }
        let pending = &mut ch.legs.call_mut(LegIndex::Real).pending;
        match cause {
            Cause::UserBusy => pending.busy = true,
            Cause::NetworkOutOfOrder | Cause::NormalCircuitCongestion | Cause::DestinationOutOfOrder => {
                pending.congestion = true
            }
            _ => self.ctx.control.soft_hangup(owner, cause),
        }
    }

    fn hangup_all(&self, handle: &ChannelHandle, cause: Cause, request: bool) {
        let mut ch = handle.lock();
        if !request {
            if let Some(trunk) = ch.trunk.as_mut() {
                trunk.already_hungup = true;
            }
        }
        let mut signalled = 0;
        for index in LegIndex::ALL {
            if let Some(owner) = ch.owner(index) {
                self.ctx.control.soft_hangup(owner, cause);
                signalled += 1;
            }
        }
        info!("Hanging up all {} legs of {}", signalled, ch.id);
        if signalled == 0 {
            if let Some(call) = ch.trunk().and_then(|t| t.call) {
                self.reject(call, cause);
            }
            if let Some(trunk) = ch.trunk.as_mut() {
                trunk.reset_call();
            }
            drop(ch);
            self.release_bearer_of(handle);
        }
    }

    fn force_reset(&self, handle: &ChannelHandle) {
        let mut ch = handle.lock();
        let id = ch.id;
        let Some(trunk) = ch.trunk.as_mut() else {
            return;
        };
        match self.group.protocol().reset(trunk.designator()) {
            Ok(()) => {
                trunk.resetting = true;
                info!("Forcing restart of {}", id);
            }
            Err(e) => warn!("Unable to restart {}: {}", id, e),
        }
    }

    fn hangup_ack(&self, call: CallRef, designator: ChannelDesignator) {
        let handle = match self.group.find_call(call) {
            Some(handle) => handle,
            None => match principle(&self.group, designator) {
                Some(handle) => handle,
                None => {
                    warn!("Hangup acknowledged for {} on unknown channel {}", call, designator);
                    return;
                }
            },
        };
        {
            let mut ch = handle.lock();
            if ch.owner(LegIndex::Real).is_some() {
                debug!("Hangup acknowledged on {} which still has an owner", ch.id);
            }
            if let Some(trunk) = ch.trunk.as_mut() {
                if trunk.call == Some(call) {
                    trunk.reset_call();
                }
                trunk.resetting = false;
            }
        }
        self.release_bearer_of(&handle);
    }

    /// Drop a call-reference record's bearer once its call is gone
    pub(crate) fn release_bearer_of(&self, handle: &ChannelHandle) {
        let bearer = {
            let ch = handle.lock();
            match ch.trunk() {
                Some(t) if t.call.is_none() => t.bearer,
                _ => None,
            }
        };
        let Some(bearer) = bearer.and_then(|id| self.group.record(id)) else {
            return;
        };
        let (mut crv, mut carrier) = lock_pair(handle, bearer);
        if crv.trunk().is_some_and(|t| t.call.is_none() && t.bearer == Some(carrier.id())) {
            release_bearer(&mut crv, &mut carrier);
        }
    }

    /// Place an outbound call on a record the caller has locked
    pub(crate) fn dial(&self, ch: &mut Channel, owner: OwnerId, destination: &str, caller: &CallerInfo) -> Result<()> {
        let index = ch.leg_of(owner)?;
        let state = ch.state(index);
        if !state.can_dial() {
            return Err(TdmError::invalid_state(format!("dial on {} in state {:?}", ch.id, state)));
        }
        if ch.in_alarm {
            return Err(TdmError::Alarm(ch.id));
        }
        let number = ch.strip_destination(destination)?;
        let (main, after_answer) = match number.split_once('w') {
            Some((main, rest)) => (main.to_string(), Some(rest.to_string())),
            None => (number.to_string(), None),
        };
        let config = self.group.config();
        let protocol = self.group.protocol();
        let designator = ch
            .trunk()
            .map(|t| t.designator())
            .ok_or_else(|| TdmError::internal(format!("{} is not a trunk channel", ch.id)))?;
        let call = protocol
            .new_call()
            .ok_or_else(|| TdmError::exhausted(format!("no call reference on {}", self.group.id())))?;

        let (called_plan, called) = derive_plan(config, &main);
        let calling_number = caller.number.clone().or_else(|| ch.config.caller_number.clone());
        let (calling_plan, calling) = match calling_number.as_deref() {
            Some(number) => {
                let (plan, digits) = derive_plan(config, number);
                (plan, Some(digits.to_string()))
            }
            None => (super::NumberPlan::Unknown, None),
        };
        let request = SetupRequest {
            channel: designator,
            exclusive: config.node_side == crate::config::NodeSide::Network,
            called: called.to_string(),
            called_plan,
            overlap: after_answer.is_some(),
            calling,
            calling_plan,
            calling_name: caller.name.clone().or_else(|| ch.config.caller_name.clone()),
            restricted: ch.hide_callerid,
        };
        if let Err(e) = protocol.setup(call, &request) {
            protocol.destroy_call(call);
            return Err(TdmError::protocol(
                Cause::NormalCircuitCongestion,
                format!("unable to set up call to {} on {}: {}", main, ch.id, e),
            ));
        }

        ch.post_answer_dial = after_answer.filter(|d| !d.is_empty()).map(|d| format!("T{}", d));
        if let Some(trunk) = ch.trunk.as_mut() {
            trunk.call = Some(call);
            trunk.queued_digits.clear();
        }
        ch.outgoing = true;
        ch.caller = caller.clone();
        ch.exten = main.clone();
        ch.set_state(&self.ctx, index, CallState::Dialing);
        info!("Placed {} to '{}' on {}", call, main, ch.id);
        Ok(())
    }

    /// Protocol side of answering an inbound call
    pub(crate) fn answer(&self, ch: &mut Channel) -> Result<()> {
        let id = ch.id;
        let trunk = ch
            .trunk
            .as_mut()
            .ok_or_else(|| TdmError::internal(format!("{} is not a trunk channel", id)))?;
        let call = trunk
            .call
            .ok_or_else(|| TdmError::invalid_state(format!("no call on {}", id)))?;
        trunk.proceeding = true;
        self.group
            .protocol()
            .answer(call, trunk.designator())
            .map_err(|e| TdmError::protocol(Cause::NormalCircuitCongestion, format!("answer on {}: {}", id, e)))
    }

    /// Local hangup of a record whose last owner is gone; true once the call is cleared
    pub(crate) fn hangup(&self, ch: &mut Channel, cause: Cause) -> bool {
        let id = ch.id;
        let Some(trunk) = ch.trunk.as_mut() else {
            return true;
        };
        trunk.idle_call = false;
        let Some(call) = trunk.call else {
            return true;
        };
        let protocol = self.group.protocol();
        if let Err(e) = protocol.hangup(call, cause) {
            warn!("Unable to hang up {} on {}: {}", call, id, e);
        }
        if trunk.already_hungup {
            trunk.reset_call();
            debug!("{} cleared on {}", call, id);
            true
        } else {
            trunk.already_hungup = true;
            debug!("Waiting for release of {} on {}", call, id);
            false
        }
    }

    /// Protocol side of an indication
    pub(crate) fn indicate(&self, ch: &mut Channel, indication: Indication) -> Result<()> {
        let id = ch.id;
        let outgoing = ch.outgoing;
        let up = ch.state(LegIndex::Real) == CallState::Up;
        let Some(trunk) = ch.trunk.as_mut() else {
            return Ok(());
        };
        let Some(call) = trunk.call else {
            return Ok(());
        };
        let designator = trunk.designator();
        let protocol = self.group.protocol();
        let sent = match indication {
            Indication::Busy | Indication::Congestion | Indication::Progress if !trunk.progress && !outgoing => {
                trunk.progress = true;
                protocol.progress(call, designator, true)
            }
            Indication::Ringing if !trunk.alerting && !outgoing && !up => {
                trunk.alerting = true;
                protocol.alerting(call, designator, true)
            }
            Indication::Proceeding if !trunk.proceeding && !outgoing => {
                trunk.proceeding = true;
                protocol.proceeding(call, designator, false)
            }
            Indication::Hold => protocol.notify(call, designator, true),
            Indication::Unhold => protocol.notify(call, designator, false),
            _ => Ok(()),
        };
        sent.map_err(|e| TdmError::protocol(Cause::NormalCircuitCongestion, format!("{:?} on {}: {}", indication, id, e)))
    }

    /// Overlap-send a digit; false when it must go in band instead
    pub(crate) fn send_digit(&self, ch: &mut Channel, digit: char) -> Result<bool> {
        let dialing = ch.state(LegIndex::Real) == CallState::Dialing;
        let id = ch.id;
        let Some(trunk) = ch.trunk.as_mut() else {
            return Ok(false);
        };
        let Some(call) = trunk.call else {
            return Ok(false);
        };
        if !dialing || trunk.proceeding {
            return Ok(false);
        }
        if trunk.setup_ack {
            self.group
                .protocol()
                .information(call, digit)
                .map_err(|e| TdmError::hardware(id, e))?;
        } else {
            trunk.queued_digits.push(digit);
        }
        Ok(true)
    }
}

fn queue(ctx: &DriverContext, ch: &Channel, control: Control) {
    if let Some(owner) = ch.owner(LegIndex::Real) {
        ctx.control.queue_frame(owner, Frame::Control(control));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Availability;
    use crate::testing::{ProtocolCall, TrunkFixture};

    fn setup_event(call: u32, offset: u8, called: &str) -> TrunkEvent {
        TrunkEvent::Setup {
            call: CallRef(call),
            channel: Some(ChannelDesignator::new(0, offset)),
            called: called.to_string(),
            caller: CallerInfo::default(),
            complete: true,
            flexible: false,
        }
    }

    #[tokio::test]
    async fn test_inbound_setup_starts_dial_plan() {
        let f = TrunkFixture::new(2, |_| {});
        f.control.add_extension("default", "4000");
        f.engine.handle_event(setup_event(5, 1, "4000"));

        let bearer = f.bearer(1);
        let owner = bearer.lock().owner(LegIndex::Real).unwrap();
        assert_eq!(bearer.lock().trunk().unwrap().call, Some(CallRef(5)));
        assert!(f.protocol.calls().contains(&ProtocolCall::Proceeding(CallRef(5))));
        assert_eq!(f.control.started(), vec![(owner, "default".to_string(), "4000".to_string())]);
    }

    #[tokio::test]
    async fn test_unknown_extension_is_unallocated() {
        let f = TrunkFixture::new(2, |_| {});
        f.engine.handle_event(setup_event(5, 1, "9999"));
        assert!(f
            .protocol
            .calls()
            .contains(&ProtocolCall::Hangup(CallRef(5), Cause::Unallocated)));
        assert!(f.bearer(1).lock().trunk().unwrap().call.is_none());
    }

    #[tokio::test]
    async fn test_setup_on_unconfigured_channel_rejected() {
        let f = TrunkFixture::new(2, |_| {});
        f.engine.handle_event(setup_event(5, 7, "4000"));
        assert!(f
            .protocol
            .calls()
            .contains(&ProtocolCall::Hangup(CallRef(5), Cause::RequestedChanUnavailable)));
    }

    #[tokio::test]
    async fn test_glare_moves_flexible_setup() {
        let f = TrunkFixture::new(2, |_| {});
        f.control.add_extension("default", "4000");
        f.bearer(1).lock().trunk.as_mut().unwrap().call = Some(CallRef(1));

        f.engine.handle_event(TrunkEvent::Setup {
            call: CallRef(5),
            channel: Some(ChannelDesignator::new(0, 1)),
            called: "4000".into(),
            caller: CallerInfo::default(),
            complete: true,
            flexible: true,
        });
        let bearer = f.bearer(2);
        let second = bearer.lock();
        assert_eq!(second.trunk().unwrap().call, Some(CallRef(5)));
    }

    #[tokio::test]
    async fn test_overlap_digits_complete_the_number() {
        let f = TrunkFixture::new(1, |c| c.overlap_dial = true);
        f.control.add_extension("default", "4000");
        f.engine.handle_event(TrunkEvent::Setup {
            call: CallRef(5),
            channel: Some(ChannelDesignator::new(0, 1)),
            called: "40".into(),
            caller: CallerInfo::default(),
            complete: false,
            flexible: false,
        });
        assert!(f.protocol.calls().contains(&ProtocolCall::SetupAck(CallRef(5))));
        assert!(f.control.started().is_empty());

        f.engine.handle_event(TrunkEvent::Digits {
            call: CallRef(5),
            channel: ChannelDesignator::new(0, 1),
            digits: "00".into(),
        });
        assert_eq!(f.control.started().len(), 1);
        assert_eq!(f.control.started()[0].2, "4000");
    }

    #[tokio::test]
    async fn test_remote_busy_before_answer_is_pending() {
        let f = TrunkFixture::new(1, |_| {});
        let bearer = f.bearer(1);
        let owner = {
            let mut ch = bearer.lock();
            let owner = ch.claim_leg(&f.ctx, Availability::Idle).unwrap();
            f.engine.dial(&mut ch, owner, "5551212", &CallerInfo::default()).unwrap();
            owner
        };
        let call = bearer.lock().trunk().unwrap().call.unwrap();

        f.engine.handle_event(TrunkEvent::Hangup {
            call,
            channel: ChannelDesignator::new(0, 1),
            cause: Cause::UserBusy,
        });
        assert!(bearer.lock().legs.call(LegIndex::Real).pending.busy);
        assert!(f.control.soft_hangups().is_empty());

        // Local release completes the clearing
        let cleared = {
            let mut ch = bearer.lock();
            ch.hangup(&f.ctx, owner);
            f.engine.hangup(&mut ch, Cause::NormalClearing)
        };
        assert!(cleared);
        assert!(bearer.lock().trunk().unwrap().call.is_none());
    }

    #[tokio::test]
    async fn test_local_hangup_waits_for_ack() {
        let f = TrunkFixture::new(1, |_| {});
        let bearer = f.bearer(1);
        {
            let mut ch = bearer.lock();
            let owner = ch.claim_leg(&f.ctx, Availability::Idle).unwrap();
            f.engine.dial(&mut ch, owner, "5551212", &CallerInfo::default()).unwrap();
            ch.hangup(&f.ctx, owner);
            assert!(!f.engine.hangup(&mut ch, Cause::NormalClearing));
        }
        let call = bearer.lock().trunk().unwrap().call.unwrap();
        assert!(f
            .protocol
            .calls()
            .contains(&ProtocolCall::Hangup(call, Cause::NormalClearing)));

        f.engine.handle_event(TrunkEvent::HangupAck {
            call,
            channel: ChannelDesignator::new(0, 1),
        });
        assert!(bearer.lock().trunk().unwrap().call.is_none());
        assert!(super::super::group::is_free(&bearer));
    }

    #[tokio::test]
    async fn test_dchannel_loss_alarms_and_clears_calls() {
        let f = TrunkFixture::new(1, |_| {});
        f.control.add_extension("default", "4000");
        f.engine.handle_event(setup_event(5, 1, "4000"));
        let bearer = f.bearer(1);
        let owner = bearer.lock().owner(LegIndex::Real).unwrap();

        f.engine.handle_event(TrunkEvent::DChannelDown { dchannel: 0 });

        assert!(bearer.lock().in_alarm());
        assert!(bearer.lock().trunk().unwrap().call.is_none());
        assert!(f.protocol.calls().contains(&ProtocolCall::Destroy(CallRef(5))));
        assert_eq!(f.control.soft_hangups(), vec![(owner, Cause::NetworkOutOfOrder)]);

        f.engine.handle_event(TrunkEvent::DChannelUp { dchannel: 0 });
        assert!(!bearer.lock().in_alarm());
    }

    #[tokio::test]
    async fn test_dial_uses_dynamic_plan() {
        let f = TrunkFixture::new(1, |_| {});
        let bearer = f.bearer(1);
        let mut ch = bearer.lock();
        let owner = ch.claim_leg(&f.ctx, Availability::Idle).unwrap();
        f.engine.dial(&mut ch, owner, "12565551212", &CallerInfo::default()).unwrap();

        let setup = f
            .protocol
            .calls()
            .into_iter()
            .find_map(|c| match c {
                ProtocolCall::Setup(_, request) => Some(request),
                _ => None,
            })
            .unwrap();
        assert_eq!(setup.called, "2565551212");
        assert_eq!(setup.called_plan, super::super::NumberPlan::National);
        assert_eq!(ch.state(LegIndex::Real), CallState::Dialing);
    }
}
