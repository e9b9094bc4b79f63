//! Periodic trunk group housekeeping: the rolling reset cycle, idle-call
//! admission and overlap-dial timeouts. Runs after every pass of the engine
//! loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::engine::TrunkEngine;
use crate::channel::ChannelHandle;
use crate::context::DriverContext;
use crate::error::Cause;
use crate::types::{CallState, CallerInfo, LegIndex, OwnerId};

/// Minimum spacing between administrative idle calls
pub const IDLE_DIAL_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) fn tick(engine: &TrunkEngine, now: Instant) {
    check_reset(engine, now);
    admit_idle(engine, now);
    expire_overlap(engine, now);
}

/// Start a reset cycle once the configured interval has passed
fn check_reset(engine: &TrunkEngine, now: Instant) {
    let group = engine.group();
    let Some(interval) = group.config().reset_interval else {
        return;
    };
    {
        let mut state = group.state();
        if !state.is_up() || state.resetting {
            return;
        }
        if now.saturating_duration_since(state.last_reset) < interval {
            return;
        }
        state.resetting = true;
        state.reset_cursor = None;
    }
    info!("Starting reset cycle on {}", group.id());
    advance_reset(engine);
}

/// Restart the next idle bearer of a running cycle, or finish the cycle
pub(crate) fn advance_reset(engine: &TrunkEngine) {
    let group = engine.group();
    let mut state = group.state();
    if !state.resetting {
        return;
    }
    // One restart at a time
    if let Some(cursor) = state.reset_cursor {
        let pending = group.bearers()[cursor]
            .handle
            .lock()
            .trunk()
            .is_some_and(|t| t.resetting);
        if pending {
            return;
        }
    }

    let start = state.reset_cursor.map_or(0, |c| c + 1);
    for (index, slot) in group.bearers().iter().enumerate().skip(start) {
        let mut ch = slot.handle.lock();
        if ch.in_alarm() || !ch.is_unowned() {
            continue;
        }
        let id = ch.id();
        let Some(trunk) = ch.trunk.as_mut() else {
            continue;
        };
        if trunk.call.is_some() || trunk.resetting || trunk.real_call.is_some() {
            continue;
        }
        match group.protocol().reset(trunk.designator()) {
            Ok(()) => {
                trunk.resetting = true;
                state.reset_cursor = Some(index);
                debug!("Restarting {} as part of the reset cycle", id);
                return;
            }
            Err(e) => warn!("Unable to restart {}: {}", id, e),
        }
    }

    state.resetting = false;
    state.reset_cursor = None;
    state.last_reset = Instant::now();
    info!("Reset cycle on {} complete", group.id());
}

/// Keep the configured floor of unused bearers, parking surplus idle calls
fn admit_idle(engine: &TrunkEngine, now: Instant) {
    let group = engine.group();
    let config = group.config();
    let Some(destination) = config.idle_dial.as_deref() else {
        return;
    };
    if !group.is_up() {
        return;
    }

    let free = group.free_count();
    if free < config.min_unused {
        {
            let mut state = group.state();
            if state
                .last_idle_dial
                .is_some_and(|last| now.saturating_duration_since(last) < IDLE_DIAL_INTERVAL)
            {
                return;
            }
            state.last_idle_dial = Some(now);
        }
        if let Some(handle) = group.free_bearer(true) {
            originate_idle(engine, &handle, destination);
        }
        return;
    }

    let idle = group.idle_calls();
    if idle.len() <= config.min_idle {
        return;
    }
    for handle in idle.iter().take(idle.len() - config.min_idle) {
        let owner = {
            let mut ch = handle.lock();
            let owner = ch.owner(LegIndex::Real);
            if let (Some(_), Some(trunk)) = (owner, ch.trunk.as_mut()) {
                trunk.idle_released = true;
            }
            owner
        };
        if let Some(owner) = owner {
            debug!("Releasing surplus idle call on {}", handle.id());
            engine.ctx().control.soft_hangup(owner, Cause::NormalClearing);
        }
    }
}

fn originate_idle(engine: &TrunkEngine, handle: &Arc<ChannelHandle>, destination: &str) {
    let ctx = engine.ctx();
    let config = engine.group().config();
    let mut ch = handle.lock();
    if !ch.is_unowned() {
        return;
    }
    let Some(owner) = ch.create_owner(ctx, LegIndex::Real, CallState::Down, &config.idle_extension, true) else {
        warn!("Unable to allocate an idle call on {}", ch.id());
        return;
    };
    if let Err(e) = engine.dial(&mut ch, owner, destination, &CallerInfo::default()) {
        warn!("Unable to dial idle call on {}: {}", ch.id(), e);
        ch.hangup(ctx, owner);
        ctx.control.soft_hangup(owner, e.cause());
        return;
    }

    let answered = Arc::new(Notify::new());
    if let Some(trunk) = ch.trunk.as_mut() {
        trunk.idle_call = true;
        trunk.idle_answered = Some(answered.clone());
    }
    info!("Dialled idle call to '{}' on {}", destination, ch.id());
    tokio::spawn(idle_watchdog(ctx.clone(), answered, owner, config.idle_answer_timeout));
}

/// Hang an idle call up if it is not answered in time
async fn idle_watchdog(ctx: Arc<DriverContext>, answered: Arc<Notify>, owner: OwnerId, timeout: Duration) {
    tokio::select! {
        _ = answered.notified() => debug!("Idle call {} answered", owner),
        _ = tokio::time::sleep(timeout) => {
            if ctx.channel_of(owner).is_none() {
                return;
            }
            warn!("Idle call {} unanswered after {:?}, hanging up", owner, timeout);
            ctx.control.soft_hangup(owner, Cause::NoAnswer);
        }
    }
}

/// Finish or reject inbound overlap numbers whose digits stopped arriving
fn expire_overlap(engine: &TrunkEngine, now: Instant) {
    let ctx = engine.ctx();
    let timeout = ctx.timing.inter_digit_timeout;
    let mut followups = Vec::new();
    for handle in engine.group().records() {
        let mut ch = handle.lock();
        let expired = ch
            .trunk()
            .and_then(|t| t.overlap_since)
            .is_some_and(|since| now.saturating_duration_since(since) >= timeout);
        if !expired {
            continue;
        }
        let context = ch.ring_context().unwrap_or(&ch.config().context).to_string();
        let caller = ch.caller().number.clone();
        if ctx.control.extension_exists(&context, ch.exten(), caller.as_deref()) {
            if let Some(followup) = engine.finish_overlap(&mut ch) {
                followups.push((handle.clone(), followup));
            }
            continue;
        }
        if let Some(trunk) = ch.trunk.as_mut() {
            trunk.overlap_since = None;
        }
        info!("Overlap number '{}' on {} timed out unmatched", ch.exten(), ch.id());
        if let Some(owner) = ch.owner(LegIndex::Real) {
            ctx.control.soft_hangup(owner, Cause::Unallocated);
        }
    }
    for (handle, followup) in followups {
        followup.dispatch(&handle, ctx);
    }
}
