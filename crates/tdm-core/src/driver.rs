//! Driver facade handed to the call-processing engine.
//!
//! [`TdmDriver`] opens every configured channel at construction, wires the
//! trunk groups to their protocol instances and exposes the callback surface
//! the engine drives calls through. Analog legs are handled by the channel
//! record alone; trunk legs also go through the group's [`TrunkEngine`].
//!
//! A trunk group's link state is always read before the channel lock is
//! taken, keeping the group-then-channel lock order intact.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{self, BridgeExit};
use crate::channel::{Availability, Channel, ChannelHandle, ChannelOption, ChannelSummary, Indication, TrunkBinding};
use crate::collaborator::{CallControl, Frame};
use crate::config::DriverConfig;
use crate::context::DriverContext;
use crate::error::{Cause, Result, TdmError};
use crate::line::LineInterface;
use crate::monitor::Monitor;
use crate::registry::ChannelRegistry;
use crate::trunk::group::BearerSlot;
use crate::trunk::{DChannelStatus, TrunkEngine, TrunkGroup, TrunkProtocol};
use crate::types::{CallState, CallerInfo, ChannelId, OwnerId, TrunkGroupId};

/// Which channels an outbound request may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelector {
    /// One specific channel
    Channel(ChannelId),
    /// First available member of a dial group
    Group { group: u8, descending: bool },
}

impl ChannelSelector {
    /// Parse `N`, `gN` (lowest channel first) or `GN` (highest first)
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (prefix, digits) = match spec.chars().next() {
            Some(c @ ('g' | 'G')) => (Some(c), &spec[1..]),
            _ => (None, spec),
        };
        let invalid = || TdmError::invalid_argument(format!("bad channel request '{}'", spec));
        match prefix {
            Some(c) => {
                let group: u8 = digits.parse().map_err(|_| invalid())?;
                if group >= 64 {
                    return Err(invalid());
                }
                Ok(ChannelSelector::Group {
                    group,
                    descending: c == 'G',
                })
            }
            None => {
                let channel: u32 = digits.parse().map_err(|_| invalid())?;
                if channel == 0 {
                    return Err(invalid());
                }
                Ok(ChannelSelector::Channel(ChannelId(channel)))
            }
        }
    }

    fn matches(&self, channel: &Channel) -> bool {
        match *self {
            ChannelSelector::Channel(id) => channel.id() == id,
            ChannelSelector::Group { group, .. } => channel.config().group & (1u64 << group) != 0,
        }
    }
}

/// Position of a channel within a trunk group
struct Membership {
    group: TrunkGroupId,
    logical_span: u8,
    offset: u8,
    crv: Option<u16>,
}

fn trunk_memberships(config: &DriverConfig) -> HashMap<ChannelId, Membership> {
    let mut members = HashMap::new();
    for trunk in &config.trunks {
        for span in &trunk.spans {
            let base = span
                .bearers
                .iter()
                .chain(&span.dchannels)
                .map(|c| c.0)
                .min()
                .unwrap_or(1);
            for bearer in &span.bearers {
                let offset = u8::try_from(bearer.0 - base + 1).unwrap_or(u8::MAX);
                members.insert(
                    *bearer,
                    Membership {
                        group: trunk.group,
                        logical_span: span.logical_span,
                        offset,
                        crv: None,
                    },
                );
            }
            for crv in &span.crvs {
                members.insert(
                    crv.channel,
                    Membership {
                        group: trunk.group,
                        logical_span: span.logical_span,
                        offset: 0,
                        crv: Some(crv.crv),
                    },
                );
            }
        }
    }
    members
}

/// The TDM channel driver
pub struct TdmDriver {
    registry: Arc<ChannelRegistry>,
    ctx: Arc<DriverContext>,
    engines: HashMap<TrunkGroupId, Arc<TrunkEngine>>,
    monitor: Arc<Monitor>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TdmDriver {
    /// Open every configured channel and build the trunk groups.
    ///
    /// `protocols` must hold one protocol instance per configured trunk group.
    pub fn new(
        config: DriverConfig,
        line: Arc<dyn LineInterface>,
        control: Arc<dyn CallControl>,
        mut protocols: HashMap<TrunkGroupId, Arc<dyn TrunkProtocol>>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(DriverContext::new(line.clone(), control, config.timing.clone()));
        let registry = Arc::new(ChannelRegistry::new());
        let mut members = trunk_memberships(&config);

        for channel_config in &config.channels {
            let binding = members
                .get(&channel_config.channel)
                .map(|m| TrunkBinding::new(m.group, m.logical_span, m.offset, m.crv));
            let channel = Channel::open(line.as_ref(), channel_config.clone(), binding)?;
            registry.insert(Arc::new(ChannelHandle::new(channel)));
        }

        let mut engines = HashMap::new();
        for trunk in &config.trunks {
            let protocol = protocols
                .remove(&trunk.group)
                .ok_or_else(|| TdmError::config(format!("no protocol instance for {}", trunk.group)))?;
            let mut bearers = Vec::new();
            let mut crvs = Vec::new();
            for span in &trunk.spans {
                for id in span.bearers.iter().chain(span.crvs.iter().map(|c| &c.channel)) {
                    let (Some(handle), Some(member)) = (registry.get(*id), members.remove(id)) else {
                        return Err(TdmError::config(format!("{} of {} was not opened", id, trunk.group)));
                    };
                    match member.crv {
                        Some(crv) => crvs.push((crv, handle)),
                        None => bearers.push(BearerSlot {
                            logical_span: member.logical_span,
                            offset: member.offset,
                            handle,
                        }),
                    }
                }
            }
            let group = Arc::new(TrunkGroup::new(trunk.clone(), protocol, bearers, crvs));
            info!(
                "Configured {} with {} bearers on {} spans",
                trunk.group,
                group.bearers().len(),
                trunk.spans.len()
            );
            engines.insert(trunk.group, Arc::new(TrunkEngine::new(group, ctx.clone())));
        }

        let monitor = Arc::new(Monitor::new(registry.clone(), ctx.clone(), config.monitor.clone()));
        info!("TDM driver loaded {} channels", registry.len());
        Ok(Self {
            registry,
            ctx,
            engines,
            monitor,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the monitor and one engine task per trunk group
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("TDM driver already started");
            return;
        }
        tasks.push(tokio::spawn(self.monitor.clone().run(self.cancel.child_token())));
        for engine in self.engines.values() {
            tasks.push(tokio::spawn(engine.clone().run(self.cancel.child_token())));
        }
        info!("TDM driver started with {} trunk groups", self.engines.len());
    }

    /// Stop the background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Driver task ended abnormally: {}", e);
            }
        }
        info!("TDM driver stopped");
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn trunk_engine(&self, group: TrunkGroupId) -> Option<&Arc<TrunkEngine>> {
        self.engines.get(&group)
    }

    fn handle_of(&self, owner: OwnerId) -> Result<Arc<ChannelHandle>> {
        self.ctx
            .channel_of(owner)
            .and_then(|id| self.registry.get(id))
            .ok_or(TdmError::UnknownOwner(owner))
    }

    fn engine_of(&self, handle: &ChannelHandle) -> Option<&Arc<TrunkEngine>> {
        handle.trunk_group().and_then(|group| self.engines.get(&group))
    }

    /// Claim a channel for an outbound call, returning the new owner
    pub fn request(&self, spec: &str) -> Result<OwnerId> {
        let selector = ChannelSelector::parse(spec)?;
        let mut candidates = self.registry.snapshot();
        if let ChannelSelector::Group { descending: true, .. } = selector {
            candidates.reverse();
        }

        let line = self.ctx.line.as_ref();
        let now = Instant::now();
        let mut busy = false;
        for handle in candidates {
            if let Some(engine) = self.engine_of(&handle) {
                if !engine.group().is_up() {
                    continue;
                }
            }
            let mut ch = handle.lock();
            if !selector.matches(&ch) {
                continue;
            }
            match ch.availability(line, now) {
                Availability::Unavailable => continue,
                Availability::Busy => {
                    busy = true;
                    continue;
                }
                availability => {
                    let owner = ch.claim_leg(&self.ctx, availability)?;
                    info!("Requested {} ({:?}) for {}", ch.id(), availability, owner);
                    return Ok(owner);
                }
            }
        }

        if busy {
            Err(TdmError::protocol(Cause::UserBusy, format!("all channels for '{}' are busy", spec)))
        } else {
            Err(TdmError::exhausted(format!("no channel available for '{}'", spec)))
        }
    }

    /// Place a call on a requested channel
    pub fn call(&self, owner: OwnerId, destination: &str, caller: &CallerInfo) -> Result<()> {
        let handle = self.handle_of(owner)?;
        if let Some(engine) = self.engine_of(&handle) {
            if !engine.group().is_up() {
                return Err(TdmError::Alarm(handle.id()));
            }
            let mut ch = handle.lock();
            return engine.dial(&mut ch, owner, destination, caller);
        }
        let result = handle.lock().dial(&self.ctx, owner, destination, caller);
        result
    }

    pub fn answer(&self, owner: OwnerId) -> Result<()> {
        let handle = self.handle_of(owner)?;
        let engine = self.engine_of(&handle);
        let mut ch = handle.lock();
        let index = ch.leg_of(owner)?;
        if let Some(engine) = engine {
            if ch.state(index) != CallState::Up {
                engine.answer(&mut ch)?;
            }
        }
        ch.answer(&self.ctx, owner)
    }

    /// Release an owner. Unknown owners are ignored so hangup stays idempotent.
    pub fn hangup(&self, owner: OwnerId, cause: Cause) -> Result<()> {
        let Ok(handle) = self.handle_of(owner) else {
            debug!("Hangup for unknown {}", owner);
            return Ok(());
        };
        let engine = self.engine_of(&handle);
        {
            let mut ch = handle.lock();
            let outcome = ch.hangup(&self.ctx, owner);
            if outcome.released && outcome.idle {
                if let Some(engine) = engine {
                    engine.hangup(&mut ch, cause);
                }
            }
        }
        if let Some(engine) = engine {
            engine.release_bearer_of(&handle);
        }
        Ok(())
    }

    /// Next frame for an owner
    pub fn read_frame(&self, owner: OwnerId) -> Result<Frame> {
        let handle = self.handle_of(owner)?;
        let result = handle.lock().read_frame(&self.ctx, owner)?;
        if let Some(followup) = result.followup {
            followup.dispatch(&handle, &self.ctx);
        }
        Ok(result.frame)
    }

    pub fn write_frame(&self, owner: OwnerId, frame: &Frame) -> Result<()> {
        let handle = self.handle_of(owner)?;
        let mut ch = handle.lock();
        ch.write_frame(&self.ctx, owner, frame)
    }

    /// Send a digit, overlap-dialled on trunks still collecting the number
    pub fn send_digit(&self, owner: OwnerId, digit: char) -> Result<()> {
        let handle = self.handle_of(owner)?;
        let engine = self.engine_of(&handle);
        let mut ch = handle.lock();
        ch.leg_of(owner)?;
        if let Some(engine) = engine {
            if engine.send_digit(&mut ch, digit)? {
                return Ok(());
            }
        }
        ch.send_digit(&self.ctx, owner, digit)
    }

    pub fn send_text(&self, owner: OwnerId, text: &str) -> Result<()> {
        let handle = self.handle_of(owner)?;
        let mut ch = handle.lock();
        ch.send_text(&self.ctx, owner, text)
    }

    pub fn indicate(&self, owner: OwnerId, indication: Indication) -> Result<()> {
        let handle = self.handle_of(owner)?;
        let engine = self.engine_of(&handle);
        let mut ch = handle.lock();
        ch.indicate(&self.ctx, owner, indication)?;
        if let Some(engine) = engine {
            engine.indicate(&mut ch, indication)?;
        }
        Ok(())
    }

    /// Move a leg to a new owner after a transfer or masquerade
    pub fn fixup(&self, old: OwnerId, new: OwnerId) -> Result<()> {
        let handle = self.handle_of(old)?;
        let mut ch = handle.lock();
        let index = ch.fixup(&self.ctx, old, new)?;
        debug!("{} took over {} leg {}", new, ch.id(), index);
        Ok(())
    }

    pub fn set_option(&self, owner: OwnerId, option: ChannelOption) -> Result<()> {
        let handle = self.handle_of(owner)?;
        let mut ch = handle.lock();
        ch.set_option(&self.ctx, owner, option)
    }

    /// Bridge two owners through the hardware; see [`bridge::native_bridge`]
    pub async fn native_bridge(&self, a: OwnerId, b: OwnerId, cancel: &CancellationToken) -> Result<BridgeExit> {
        bridge::native_bridge(&self.registry, &self.ctx, a, b, cancel).await
    }

    pub fn show_channel(&self, id: ChannelId) -> Result<ChannelSummary> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| TdmError::not_found(format!("no channel {}", id)))?;
        let summary = handle.lock().summary();
        Ok(summary)
    }

    pub fn channel_summaries(&self) -> Vec<ChannelSummary> {
        self.registry
            .snapshot()
            .iter()
            .map(|handle| handle.lock().summary())
            .collect()
    }

    /// D-channel states of a trunk group
    pub fn trunk_status(&self, group: TrunkGroupId) -> Option<Vec<DChannelStatus>> {
        self.engines.get(&group).map(|engine| engine.group().dchannel_status())
    }

    /// Remove an idle analog channel and close its line
    pub fn destroy_channel(&self, id: ChannelId) -> Result<()> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| TdmError::not_found(format!("no channel {}", id)))?;
        if handle.trunk_group().is_some() {
            return Err(TdmError::invalid_state(format!("{} belongs to a trunk group", id)));
        }
        let descriptor = {
            let ch = handle.lock();
            if !ch.is_unowned() {
                return Err(TdmError::invalid_state(format!("{} is in use", id)));
            }
            ch.physical()
        };
        self.registry.remove(id);
        if let Some(descriptor) = descriptor {
            self.ctx.line.close(descriptor);
        }
        self.ctx.wake_monitor();
        info!("Destroyed {}", id);
        Ok(())
    }

    /// Toggle do-not-disturb on a channel
    pub fn set_dnd(&self, id: ChannelId, enabled: bool) -> Result<()> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| TdmError::not_found(format!("no channel {}", id)))?;
        handle.lock().dnd = enabled;
        info!("Do-not-disturb {} on {}", if enabled { "enabled" } else { "disabled" }, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parsing() {
        assert_eq!(ChannelSelector::parse("7").unwrap(), ChannelSelector::Channel(ChannelId(7)));
        assert_eq!(
            ChannelSelector::parse("g2").unwrap(),
            ChannelSelector::Group {
                group: 2,
                descending: false
            }
        );
        assert_eq!(
            ChannelSelector::parse("G0").unwrap(),
            ChannelSelector::Group {
                group: 0,
                descending: true
            }
        );
        assert!(ChannelSelector::parse("0").is_err());
        assert!(ChannelSelector::parse("g64").is_err());
        assert!(ChannelSelector::parse("x1").is_err());
        assert!(ChannelSelector::parse("").is_err());
    }
}
