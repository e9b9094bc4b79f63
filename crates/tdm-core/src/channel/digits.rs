//! Inbound digit collection.
//!
//! One task per freshly seized analog leg. The task waits for digits on the
//! leg's descriptor without holding the channel lock, consults the
//! collaborator's dial plan and finally hands the owner to it. Any other
//! event seen while waiting is processed as if the owner had read it; if that
//! event ends the call the task hangs its owner up and exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::distinctive::match_cadence;
use super::events::{self, Followup};
use super::signaling::{SignalingClass, SignalingFamily};
use super::ChannelHandle;
use crate::collaborator::{Control, Frame};
use crate::context::DriverContext;
use crate::error::Cause;
use crate::line::LineEvent;
use crate::types::{CallState, Descriptor, HookCommand, LegIndex, OwnerId, Tone};

/// Wait for the first address digit on an E&M style trunk
pub const TRUNK_FIRST_DIGIT: Duration = Duration::from_secs(5);

/// Wait for each following digit of a delimited trunk address
pub const TRUNK_DIGIT: Duration = Duration::from_secs(3);

/// Total wait for the ring cadence to be measured
pub const CADENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for the first ring after a polarity reversal announced a call
pub const PRERING_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll slice used while waiting without a deadline
const UNBOUNDED_SLICE: Duration = Duration::from_secs(60);

const MAX_EXTENSION: usize = 80;

enum Step {
    Digit(char),
    Timeout,
    /// The owner is gone or the call ended
    Gone,
}

/// Collect digits for `owner` and start its dial plan
pub async fn collect(handle: Arc<ChannelHandle>, ctx: Arc<DriverContext>, owner: OwnerId) {
    let (class, state) = {
        let ch = handle.lock();
        let Some(index) = ch.legs.index_of(owner) else {
            debug!("{} left {} before digit collection", owner, handle.id());
            return;
        };
        (ch.family.class(), ch.legs.state(index))
    };

    match class {
        SignalingClass::Station => collect_station(&handle, &ctx, owner).await,
        SignalingClass::LoopTrunk => {
            if state == CallState::PreRing && !await_first_ring(&handle, &ctx, owner).await {
                return;
            }
            collect_loop_trunk(&handle, &ctx, owner).await
        }
        SignalingClass::EarAndMouth => collect_trunk(&handle, &ctx, owner).await,
        SignalingClass::Digital | SignalingClass::Clear => {
            warn!("No digit collection for {} on {}", owner, handle.id());
        }
    }
}

/// Descriptor the owner's leg currently sits on
fn leg_descriptor(handle: &ChannelHandle, owner: OwnerId) -> Option<(LegIndex, Descriptor)> {
    let ch = handle.lock();
    let index = ch.legs.index_of(owner)?;
    Some((index, ch.legs.descriptor(index)?))
}

/// Run a non-digit event through the owner's event path; false if it ended the call
fn deliver(handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>, owner: OwnerId, event: LineEvent) -> bool {
    let result = {
        let mut ch = handle.lock();
        let Some(index) = ch.legs.index_of(owner) else {
            return false;
        };
        events::handle_event(&mut ch, ctx, index, event)
    };
    if let Some(followup) = result.followup {
        followup.dispatch(handle, ctx);
    }
    if result.frame == Frame::Control(Control::Hangup) {
        debug!("Line released during digit collection on {}", handle.id());
        ctx.control.soft_hangup(owner, Cause::NormalClearing);
        return false;
    }
    true
}

/// Wait for one digit; `None` waits indefinitely
async fn next_digit(
    handle: &Arc<ChannelHandle>,
    ctx: &Arc<DriverContext>,
    owner: OwnerId,
    timeout: Option<Duration>,
) -> Step {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let Some((_, descriptor)) = leg_descriptor(handle, owner) else {
            return Step::Gone;
        };
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Step::Timeout;
                }
                left
            }
            None => UNBOUNDED_SLICE,
        };
        match ctx.line.next_event(descriptor, wait).await {
            Ok(Some(LineEvent::Digit(digit))) => {
                if leg_descriptor(handle, owner).is_none() {
                    return Step::Gone;
                }
                return Step::Digit(digit);
            }
            Ok(Some(event)) => {
                if !deliver(handle, ctx, owner, event) {
                    return Step::Gone;
                }
            }
            Ok(None) => {
                if deadline.is_some() {
                    return Step::Timeout;
                }
            }
            Err(e) => {
                warn!("Unable to read events on {}: {}", handle.id(), e);
                ctx.control.soft_hangup(owner, Cause::NormalClearing);
                return Step::Gone;
            }
        }
    }
}

/// Read digits until `terminator` has been seen `count` times
async fn collect_delimited(
    handle: &Arc<ChannelHandle>,
    ctx: &Arc<DriverContext>,
    owner: OwnerId,
    buffer: &mut String,
    terminator: char,
    mut count: usize,
) -> bool {
    while count > 0 && buffer.len() < MAX_EXTENSION {
        match next_digit(handle, ctx, owner, Some(TRUNK_DIGIT)).await {
            Step::Digit(digit) => {
                buffer.push(digit);
                if digit == terminator {
                    count -= 1;
                }
            }
            Step::Timeout => break,
            Step::Gone => return false,
        }
    }
    true
}

fn context_of(handle: &ChannelHandle) -> String {
    let ch = handle.lock();
    ch.ring_context.clone().unwrap_or_else(|| ch.config.context.clone())
}

fn caller_number(handle: &ChannelHandle) -> Option<String> {
    handle.lock().caller.number.clone()
}

fn reject(handle: &ChannelHandle, ctx: &DriverContext, owner: OwnerId, cause: Cause) {
    {
        let ch = handle.lock();
        if let Some(index) = ch.legs.index_of(owner) {
            ch.play_tone(ctx.line.as_ref(), index, Some(Tone::Congestion));
        }
    }
    ctx.control.soft_hangup(owner, cause);
}

/// Mark the leg as in the dial plan and start it
fn launch(handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>, owner: OwnerId, extension: String) {
    let followup = {
        let mut ch = handle.lock();
        let Some(index) = ch.legs.index_of(owner) else {
            return;
        };
        let line = ctx.line.as_ref();
        ch.play_tone(line, index, None);
        ch.exten = extension.clone();
        ch.set_state(ctx, index, CallState::Ring);
        ch.enable_echo(line);
        ch.legs.call_mut(index).in_pbx = true;
        Followup::StartPbx {
            owner,
            context: ch.ring_context.clone().unwrap_or_else(|| ch.config.context.clone()),
            extension,
        }
    };
    info!("Starting dial plan for {} on {}", owner, handle.id());
    followup.dispatch(handle, ctx);
}

/// One-shot feature codes dialled from a station
fn feature_code(handle: &ChannelHandle, ctx: &DriverContext, owner: OwnerId, exten: &str) -> bool {
    let mut ch = handle.lock();
    let Some(index) = ch.legs.index_of(owner) else {
        return false;
    };
    let handled = match exten {
        "*70" if ch.call_waiting => {
            info!("Disabling call waiting on {} for this call", ch.id);
            ch.call_waiting = false;
            true
        }
        "*67" if !ch.hide_callerid => {
            info!("Hiding caller id on {} for this call", ch.id);
            ch.hide_callerid = true;
            true
        }
        "*82" if ch.hide_callerid => {
            info!("Enabling caller id on {} for this call", ch.id);
            ch.hide_callerid = false;
            true
        }
        "*78" => {
            info!("Enabled do-not-disturb on {}", ch.id);
            ch.dnd = true;
            true
        }
        "*79" => {
            info!("Disabled do-not-disturb on {}", ch.id);
            ch.dnd = false;
            true
        }
        _ => false,
    };
    if handled {
        ch.play_tone(ctx.line.as_ref(), index, Some(Tone::DialRecall));
    }
    handled
}

async fn collect_station(handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>, owner: OwnerId) {
    let timing = &ctx.timing;
    let three_way = handle.lock().legs.owner(LegIndex::ThreeWay).is_some();
    // Someone on hold: no hurry for the first digit
    let mut timeout = if three_way {
        None
    } else {
        Some(timing.first_digit_timeout)
    };
    let mut exten = String::new();

    loop {
        match next_digit(handle, ctx, owner, timeout).await {
            Step::Gone => return,
            Step::Timeout => {
                let context = context_of(handle);
                if !exten.is_empty()
                    && ctx
                        .control
                        .extension_exists(&context, &exten, caller_number(handle).as_deref())
                {
                    launch(handle, ctx, owner, exten);
                } else {
                    debug!("Digit timeout with '{}' on {}", exten, handle.id());
                    reject(handle, ctx, owner, Cause::NoAnswer);
                }
                return;
            }
            Step::Digit(digit) => {
                exten.push(digit);
                {
                    let ch = handle.lock();
                    if let Some(index) = ch.legs.index_of(owner) {
                        ch.play_tone(ctx.line.as_ref(), index, None);
                    }
                }

                if feature_code(handle, ctx, owner, &exten) {
                    exten.clear();
                    timeout = Some(timing.first_digit_timeout);
                    continue;
                }

                let context = context_of(handle);
                let caller = caller_number(handle);
                let more = ctx.control.can_match_more(&context, &exten, caller.as_deref());
                if ctx.control.extension_exists(&context, &exten, caller.as_deref()) {
                    if !more || exten.len() >= MAX_EXTENSION {
                        launch(handle, ctx, owner, exten);
                        return;
                    }
                    timeout = Some(timing.match_digit_timeout);
                } else if !more && !(exten.starts_with('*') && exten.len() <= 2) {
                    info!("Unknown extension '{}' in context '{}' on {}", exten, context, handle.id());
                    reject(handle, ctx, owner, Cause::Unallocated);
                    return;
                } else {
                    timeout = Some(timing.inter_digit_timeout);
                }
            }
        }
    }
}

fn sends_wink(family: SignalingFamily) -> bool {
    use SignalingFamily::*;
    matches!(
        family,
        EmWink | FeatD | FeatDMf | FeatDMfTandem | FeatB | E911 | SfWink | SfFeatD | SfFeatDMf | SfFeatB
    )
}

fn set_hook(handle: &ChannelHandle, ctx: &DriverContext, command: HookCommand) {
    handle.lock().set_hook(ctx.line.as_ref(), command);
}

async fn collect_trunk(handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>, owner: OwnerId) {
    let (family, immediate) = {
        let ch = handle.lock();
        (ch.family, ch.config.immediate)
    };
    if sends_wink(family) {
        set_hook(handle, ctx, HookCommand::Wink);
    }

    let mut raw = String::new();
    if !immediate {
        match next_digit(handle, ctx, owner, Some(TRUNK_FIRST_DIGIT)).await {
            Step::Gone => return,
            Step::Timeout => {}
            Step::Digit(first) => {
                raw.push(first);
                let ok = match family {
                    SignalingFamily::FeatD | SignalingFamily::SfFeatD => {
                        collect_delimited(handle, ctx, owner, &mut raw, '*', 2).await
                    }
                    SignalingFamily::EmWink if first == '*' => {
                        collect_delimited(handle, ctx, owner, &mut raw, '*', 2).await
                    }
                    SignalingFamily::FeatDMf | SignalingFamily::FeatDMfTandem | SignalingFamily::SfFeatDMf => {
                        collect_delimited(handle, ctx, owner, &mut raw, '#', 2).await
                    }
                    SignalingFamily::E911 => {
                        if !collect_delimited(handle, ctx, owner, &mut raw, '#', 1).await {
                            return;
                        }
                        // Emergency trunks go off hook after the first field
                        set_hook(handle, ctx, HookCommand::OffHook);
                        collect_delimited(handle, ctx, owner, &mut raw, '#', 1).await
                    }
                    SignalingFamily::FeatB | SignalingFamily::SfFeatB => {
                        collect_delimited(handle, ctx, owner, &mut raw, '#', 1).await
                    }
                    _ => collect_matching(handle, ctx, owner, &mut raw).await,
                };
                if !ok {
                    return;
                }
            }
        }
    }

    let parse_as = if family == SignalingFamily::EmWink && raw.starts_with('*') {
        SignalingFamily::FeatD
    } else {
        family
    };
    let (mut exten, ani) = parse_trunk_digits(parse_as, &raw);
    if exten.is_empty() {
        exten = "s".to_string();
    }
    if let Some(ani) = ani {
        let mut ch = handle.lock();
        debug!("ANI {} on {}", ani, ch.id);
        ch.caller.ani = Some(ani.clone());
        ch.caller.number = Some(ani);
    }
    if matches!(family, SignalingFamily::FeatDMf | SignalingFamily::SfFeatDMf) {
        // Acknowledge the address
        set_hook(handle, ctx, HookCommand::Wink);
    }

    let context = context_of(handle);
    if ctx
        .control
        .extension_exists(&context, &exten, caller_number(handle).as_deref())
    {
        launch(handle, ctx, owner, exten);
    } else {
        info!("Unknown extension '{}' in context '{}' on {}", exten, context, handle.id());
        reject(handle, ctx, owner, Cause::Unallocated);
    }
}

/// Keep reading while more digits could still match
async fn collect_matching(handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>, owner: OwnerId, buffer: &mut String) -> bool {
    let context = context_of(handle);
    while buffer.len() < MAX_EXTENSION {
        let caller = caller_number(handle);
        if !ctx.control.can_match_more(&context, buffer, caller.as_deref()) {
            break;
        }
        let timeout = if ctx.control.extension_exists(&context, buffer, caller.as_deref()) {
            ctx.timing.match_digit_timeout
        } else {
            ctx.timing.inter_digit_timeout
        };
        match next_digit(handle, ctx, owner, Some(timeout)).await {
            Step::Digit(digit) => buffer.push(digit),
            Step::Timeout => break,
            Step::Gone => return false,
        }
    }
    true
}

/// Split a delimited trunk address into extension and calling number
pub fn parse_trunk_digits(family: SignalingFamily, raw: &str) -> (String, Option<String>) {
    use SignalingFamily::*;
    let Some(body) = raw.strip_prefix('*') else {
        return (raw.to_string(), None);
    };
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    match family {
        FeatD | SfFeatD | EmWink => {
            let mut fields = body.split('*');
            let first = fields.next().unwrap_or_default();
            match fields.next() {
                Some(dnis) => (dnis.to_string(), non_empty(first)),
                None => (first.to_string(), None),
            }
        }
        FeatDMf | FeatDMfTandem | SfFeatDMf => {
            let mut fields = body.split('#');
            let first = fields.next().unwrap_or_default();
            // Two information digits precede the ANI
            let ani = first.get(2..).unwrap_or_default();
            match fields.next() {
                Some(second) if !second.is_empty() => {
                    let dnis = second.strip_prefix('*').unwrap_or(second);
                    (dnis.to_string(), non_empty(ani))
                }
                _ => (ani.to_string(), None),
            }
        }
        E911 => {
            let mut fields = body.split('#');
            let first = fields.next().unwrap_or_default();
            let ani = fields
                .next()
                .and_then(|second| second.strip_prefix("*0"))
                .and_then(non_empty);
            let exten = if first.is_empty() { "911" } else { first };
            (exten.to_string(), ani)
        }
        FeatB | SfFeatB => {
            let dnis = body.split('#').next().unwrap_or_default();
            (dnis.to_string(), None)
        }
        _ => (raw.to_string(), None),
    }
}

/// Wait for the ring that follows a polarity reversal; false if none came
async fn await_first_ring(handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>, owner: OwnerId) -> bool {
    let deadline = Instant::now() + PRERING_TIMEOUT;
    loop {
        let Some((_, descriptor)) = leg_descriptor(handle, owner) else {
            return false;
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match ctx.line.next_event(descriptor, left).await {
            Ok(Some(LineEvent::RingOffHook)) => {
                let mut ch = handle.lock();
                let Some(index) = ch.legs.index_of(owner) else {
                    return false;
                };
                ch.set_state(ctx, index, CallState::Ring);
                return true;
            }
            Ok(Some(LineEvent::RingBegin)) => {
                let mut ch = handle.lock();
                if !ch.config.distinctive_ring.is_empty() {
                    ch.cadence.ring_begin(Instant::now());
                }
            }
            Ok(Some(LineEvent::Digit(_))) => {}
            Ok(Some(event)) => {
                if !deliver(handle, ctx, owner, event) {
                    return false;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Unable to read events on {}: {}", handle.id(), e);
                break;
            }
        }
    }
    info!("No ring after polarity reversal on {}", handle.id());
    ctx.control.soft_hangup(owner, Cause::NoAnswer);
    false
}

/// Measure the ring cadence if distinctive ring is configured
async fn measure_cadence(handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>, owner: OwnerId) -> bool {
    if handle.lock().config.distinctive_ring.is_empty() {
        return true;
    }
    let deadline = Instant::now() + CADENCE_TIMEOUT;
    loop {
        if handle.lock().cadence.is_complete() {
            break;
        }
        let Some((_, descriptor)) = leg_descriptor(handle, owner) else {
            return false;
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match ctx.line.next_event(descriptor, left).await {
            Ok(Some(LineEvent::RingBegin)) => {
                handle.lock().cadence.ring_begin(Instant::now());
            }
            Ok(Some(LineEvent::RingOffHook)) | Ok(Some(LineEvent::Digit(_))) => {}
            Ok(Some(event)) => {
                if !deliver(handle, ctx, owner, event) {
                    return false;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Unable to read events on {}: {}", handle.id(), e);
                break;
            }
        }
    }

    let mut ch = handle.lock();
    let matched = match_cadence(&ch.config.distinctive_ring, ch.cadence.measured()).map(|r| r.context.clone());
    debug!("Measured cadence {:?} on {}", ch.cadence.measured(), ch.id);
    if let Some(context) = matched {
        info!("Distinctive ring matched context '{}' on {}", context, ch.id);
        ch.ring_context = Some(context);
    }
    true
}

async fn collect_loop_trunk(handle: &Arc<ChannelHandle>, ctx: &Arc<DriverContext>, owner: OwnerId) {
    if !measure_cadence(handle, ctx, owner).await {
        return;
    }
    let extension = {
        let ch = handle.lock();
        if ch.config.extension.is_empty() {
            "s".to_string()
        } else {
            ch.config.extension.clone()
        }
    };
    launch(handle, ctx, owner, extension);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::{ChannelConfig, DistinctiveRing};
    use crate::testing::{LineCall, MockCallControl, MockLine};
    use crate::types::ChannelId;

    #[test]
    fn test_parse_feature_group_d() {
        let (exten, ani) = parse_trunk_digits(SignalingFamily::FeatD, "*2565551000*5551212*");
        assert_eq!(exten, "5551212");
        assert_eq!(ani.as_deref(), Some("2565551000"));

        let (exten, ani) = parse_trunk_digits(SignalingFamily::FeatD, "**5551212*");
        assert_eq!(exten, "5551212");
        assert_eq!(ani, None);
    }

    #[test]
    fn test_parse_feature_group_d_mf() {
        let (exten, ani) = parse_trunk_digits(SignalingFamily::FeatDMf, "*002565551000#*5551212#");
        assert_eq!(exten, "5551212");
        assert_eq!(ani.as_deref(), Some("2565551000"));
    }

    #[test]
    fn test_parse_emergency() {
        let (exten, ani) = parse_trunk_digits(SignalingFamily::E911, "*911#*02565551000#");
        assert_eq!(exten, "911");
        assert_eq!(ani.as_deref(), Some("2565551000"));
    }

    #[test]
    fn test_parse_feature_group_b() {
        let (exten, ani) = parse_trunk_digits(SignalingFamily::FeatB, "*5551212#");
        assert_eq!(exten, "5551212");
        assert_eq!(ani, None);
    }

    #[test]
    fn test_parse_undelimited_passthrough() {
        let (exten, ani) = parse_trunk_digits(SignalingFamily::Em, "4000");
        assert_eq!(exten, "4000");
        assert_eq!(ani, None);
    }

    fn seized(family: SignalingFamily) -> (Arc<MockLine>, Arc<MockCallControl>, Arc<DriverContext>, Arc<ChannelHandle>, OwnerId) {
        let line = Arc::new(MockLine::new());
        let control = Arc::new(MockCallControl::new());
        let ctx = Arc::new(DriverContext::new(line.clone(), control.clone(), Default::default()));
        let config = ChannelConfig::new(ChannelId(2), family);
        let mut channel = Channel::open(line.as_ref(), config, None).unwrap();
        let owner = match events::handle_idle_event(&mut channel, &ctx, LineEvent::RingOffHook) {
            Some(Followup::CollectDigits { owner }) => owner,
            other => panic!("unexpected followup {:?}", other),
        };
        line.clear_calls();
        (line, control, ctx, Arc::new(ChannelHandle::new(channel)), owner)
    }

    fn dial(line: &MockLine, handle: &ChannelHandle, digits: &str) {
        let physical = handle.lock().physical().unwrap();
        for digit in digits.chars() {
            line.inject(physical, LineEvent::Digit(digit));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_collects_known_extension() {
        let (line, control, ctx, handle, owner) = seized(SignalingFamily::FxoLoopStart);
        control.add_extension("default", "100");
        dial(&line, &handle, "100");

        collect(handle.clone(), ctx, owner).await;

        assert_eq!(control.started(), vec![(owner, "default".to_string(), "100".to_string())]);
        let ch = handle.lock();
        assert_eq!(ch.state(LegIndex::Real), CallState::Ring);
        assert_eq!(ch.exten(), "100");
        assert!(ch.legs.call(LegIndex::Real).in_pbx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_waits_for_longer_match() {
        let (line, control, ctx, handle, owner) = seized(SignalingFamily::FxoLoopStart);
        control.add_extension("default", "10");
        control.add_extension("default", "100");
        dial(&line, &handle, "10");

        collect(handle.clone(), ctx, owner).await;

        // "10" matched but "100" was still possible: the match timeout expired first
        assert_eq!(control.started(), vec![(owner, "default".to_string(), "10".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_unknown_number_congests() {
        let (line, control, ctx, handle, owner) = seized(SignalingFamily::FxoLoopStart);
        control.add_extension("default", "100");
        dial(&line, &handle, "9");

        collect(handle.clone(), ctx, owner).await;

        assert!(control.started().is_empty());
        assert_eq!(control.soft_hangups(), vec![(owner, Cause::Unallocated)]);
        let physical = handle.lock().physical().unwrap();
        assert!(line.calls().contains(&LineCall::PlayTone(physical, Some(Tone::Congestion))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_first_digit_timeout() {
        let (_line, control, ctx, handle, owner) = seized(SignalingFamily::FxoLoopStart);
        collect(handle.clone(), ctx, owner).await;
        assert_eq!(control.soft_hangups(), vec![(owner, Cause::NoAnswer)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_feature_code_hides_callerid() {
        let (line, control, ctx, handle, owner) = seized(SignalingFamily::FxoLoopStart);
        control.add_extension("default", "100");
        dial(&line, &handle, "*67100");

        collect(handle.clone(), ctx, owner).await;

        assert!(handle.lock().hide_callerid());
        assert_eq!(control.started(), vec![(owner, "default".to_string(), "100".to_string())]);
        let physical = handle.lock().physical().unwrap();
        assert!(line.calls().contains(&LineCall::PlayTone(physical, Some(Tone::DialRecall))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_during_collection_aborts() {
        let (line, control, ctx, handle, owner) = seized(SignalingFamily::FxoLoopStart);
        control.add_extension("default", "100");
        let physical = handle.lock().physical().unwrap();
        line.inject(physical, LineEvent::Digit('1'));
        line.inject(physical, LineEvent::OnHook);

        collect(handle.clone(), ctx, owner).await;

        assert!(control.started().is_empty());
        assert_eq!(control.soft_hangups(), vec![(owner, Cause::NormalClearing)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feature_group_d_winks_and_reads_ani() {
        let (line, control, ctx, handle, owner) = seized(SignalingFamily::FeatD);
        control.add_extension("default", "5551212");
        dial(&line, &handle, "*2565551000*5551212*");

        collect(handle.clone(), ctx, owner).await;

        let physical = handle.lock().physical().unwrap();
        assert!(line.calls().contains(&LineCall::SetHook(physical, HookCommand::Wink)));
        assert_eq!(control.started(), vec![(owner, "default".to_string(), "5551212".to_string())]);
        assert_eq!(handle.lock().caller().number.as_deref(), Some("2565551000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trunk_without_digits_goes_to_s() {
        let (_line, control, ctx, handle, owner) = seized(SignalingFamily::Em);
        control.add_extension("default", "s");

        collect(handle.clone(), ctx, owner).await;

        assert_eq!(control.started(), vec![(owner, "default".to_string(), "s".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_trunk_distinctive_ring_selects_context() {
        let line = Arc::new(MockLine::new());
        let control = Arc::new(MockCallControl::new());
        let ctx = Arc::new(DriverContext::new(line.clone(), control.clone(), Default::default()));
        let mut config = ChannelConfig::new(ChannelId(3), SignalingFamily::FxsLoopStart);
        config.distinctive_ring = vec![DistinctiveRing {
            cadence: [1000, 1000, 1000],
            context: "fax".to_string(),
        }];
        let mut channel = Channel::open(line.as_ref(), config, None).unwrap();
        events::handle_idle_event(&mut channel, &ctx, LineEvent::RingBegin);
        let owner = match events::handle_idle_event(&mut channel, &ctx, LineEvent::RingOffHook) {
            Some(Followup::CollectDigits { owner }) => owner,
            other => panic!("unexpected followup {:?}", other),
        };
        let handle = Arc::new(ChannelHandle::new(channel));

        let task = tokio::spawn(collect(handle.clone(), ctx, owner));
        let physical = handle.lock().physical().unwrap();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            line.inject(physical, LineEvent::RingBegin);
        }
        task.await.unwrap();

        assert_eq!(handle.lock().ring_context(), Some("fax"));
        assert_eq!(control.started(), vec![(owner, "fax".to_string(), "s".to_string())]);
    }
}
