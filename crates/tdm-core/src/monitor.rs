//! Event monitor for channels no call owns.
//!
//! A single task polls the descriptor of every unowned channel and hands the
//! hardware events it finds to the idle-channel handler, which seizes lines
//! for inbound calls and tracks alarms. The poll set is rebuilt whenever the
//! registry changes shape or something wakes the monitor. Between polls the
//! monitor refreshes message-waiting indicators on idle station ports.
//!
//! The registry lock is only held long enough to copy the channel list; each
//! channel is then locked on its own, and followups such as digit collection
//! are dispatched after that lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::channel::callerid::{mwi_message, CallerIdSpill, SpillKind};
use crate::channel::events::handle_idle_event;
use crate::channel::{Channel, ChannelHandle, SignalingClass};
use crate::config::MonitorConfig;
use crate::context::DriverContext;
use crate::line::{PollInterest, Readiness};
use crate::registry::ChannelRegistry;
use crate::types::{Descriptor, LegIndex};

/// Pause after a failed poll
const POLL_BACKOFF: Duration = Duration::from_millis(100);

/// Watches unowned channels for hardware events
pub struct Monitor {
    registry: Arc<ChannelRegistry>,
    ctx: Arc<DriverContext>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(registry: Arc<ChannelRegistry>, ctx: Arc<DriverContext>, config: MonitorConfig) -> Self {
        Self { registry, ctx, config }
    }

    /// Run until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting channel monitor");
        let mut generation = None;
        let mut channels = Vec::new();
        let mut last_mwi = Instant::now();

        loop {
            let current = self.registry.generation();
            if generation != Some(current) {
                channels = self.registry.snapshot();
                generation = Some(current);
                debug!("Monitor tracking {} channels", channels.len());
            }

            let (interests, by_descriptor) = watch_set(&channels);
            trace!("Polling {} idle channels", interests.len());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ctx.monitor_wake.notified() => {
                    debug!("Monitor woken, rebuilding poll set");
                    continue;
                }
                ready = self.ctx.line.poll(&interests, self.config.poll_timeout) => match ready {
                    Ok(ready) => {
                        self.dispatch(&ready, &by_descriptor);
                    }
                    Err(e) => {
                        error!("Monitor poll failed: {}", e);
                        tokio::time::sleep(POLL_BACKOFF).await;
                    }
                },
            }

            if last_mwi.elapsed() >= self.config.mwi_interval {
                self.check_mwi(&channels);
                last_mwi = Instant::now();
            }
        }
        info!("Channel monitor stopped");
    }

    fn dispatch(&self, ready: &[Readiness], by_descriptor: &HashMap<Descriptor, Arc<ChannelHandle>>) -> usize {
        let mut handled = 0;
        for readiness in ready {
            let Some(handle) = by_descriptor.get(&readiness.descriptor) else {
                continue;
            };
            handled += self.service(handle, readiness.event, readiness.writable);
        }
        handled
    }

    /// Service every unowned channel once without waiting; returns the events handled
    pub fn run_once(&self) -> usize {
        let channels = self.registry.snapshot();
        channels.iter().map(|handle| self.service(handle, true, true)).sum()
    }

    fn service(&self, handle: &Arc<ChannelHandle>, event: bool, writable: bool) -> usize {
        let line = self.ctx.line.as_ref();
        let mut handled = 0;
        let mut followups = Vec::new();
        {
            let mut ch = handle.lock();
            if !watched(&ch) {
                return 0;
            }
            if writable && ch.spill.is_some() {
                ch.write_spill(line);
            }
            if event {
                if let Some(physical) = ch.physical() {
                    // Stop once the channel acquires an owner
                    while ch.is_unowned() {
                        let Some(event) = ch.log_hw("get event", line.get_event(physical)).flatten() else {
                            break;
                        };
                        handled += 1;
                        if let Some(followup) = handle_idle_event(&mut ch, &self.ctx, event) {
                            followups.push(followup);
                        }
                    }
                }
            }
        }
        for followup in followups {
            followup.dispatch(handle, &self.ctx);
        }
        handled
    }

    /// Refresh the message-waiting indicator of idle station ports with a mailbox
    pub fn check_mwi(&self, channels: &[Arc<ChannelHandle>]) {
        let line = self.ctx.line.as_ref();
        for handle in channels {
            let mut ch = handle.lock();
            if !watched(&ch) || ch.spill.is_some() || ch.family().class() != SignalingClass::Station {
                continue;
            }
            let Some(mailbox) = ch.config().mailbox.clone() else {
                continue;
            };
            let off_hook = ch
                .physical()
                .and_then(|d| ch.log_hw("get params", line.get_params(d)))
                .is_some_and(|p| p.off_hook);
            if off_hook {
                continue;
            }
            let waiting = self.ctx.control.has_voicemail(&mailbox);
            if ch.mwi == Some(waiting) {
                continue;
            }
            let data = line.modulate_callerid(&mwi_message(waiting), ch.config().law);
            ch.spill = Some(CallerIdSpill::new(SpillKind::MessageWaiting, data, 0));
            ch.mwi = Some(waiting);
            info!(
                "Sending message waiting {} to {} for mailbox {}",
                if waiting { "on" } else { "off" },
                ch.id(),
                mailbox
            );
        }
    }
}

/// Channels the monitor listens to: unowned, with their own line
fn watched(ch: &Channel) -> bool {
    ch.is_unowned() && ch.trunk().map_or(true, |t| t.crv.is_none()) && ch.legs.call(LegIndex::Real).owner.is_none()
}

fn watch_set(channels: &[Arc<ChannelHandle>]) -> (Vec<PollInterest>, HashMap<Descriptor, Arc<ChannelHandle>>) {
    let mut interests = Vec::with_capacity(channels.len());
    let mut by_descriptor = HashMap::with_capacity(channels.len());
    for handle in channels {
        let ch = handle.lock();
        if !watched(&ch) {
            continue;
        }
        let Some(descriptor) = ch.physical() else {
            continue;
        };
        interests.push(PollInterest {
            descriptor,
            writable: ch.spill.is_some(),
        });
        by_descriptor.insert(descriptor, handle.clone());
    }
    (interests, by_descriptor)
}
