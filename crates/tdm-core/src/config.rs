//! Driver configuration.
//!
//! The administrative layer owns parsing and persistence; the core only
//! consumes these deserialized structures, copying per-channel values into
//! channel records at load and reload.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::signaling::SignalingFamily;
use crate::error::{Result, TdmError};
use crate::types::{ChannelId, Law, SpanId, TrunkGroupId};

/// Top-level driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Per-channel configuration
    pub channels: Vec<ChannelConfig>,

    /// Digital trunk groups
    pub trunks: Vec<TrunkConfig>,

    /// Monitor loop settings
    pub monitor: MonitorConfig,

    /// Signalling timers
    pub timing: TimingConfig,
}

/// When caller id is expected on an inbound analog line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallerIdStart {
    /// After the first ring
    Ring,
    /// After a polarity reversal, before any ring
    Polarity,
}

/// Caller-id delivery mode for station ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallerIdMode {
    /// No caller id
    Off,
    /// Bell 202 FSK single data message format
    Sdmf,
    /// Bell 202 FSK multiple data message format
    Mdmf,
}

/// One distinctive-ring table entry
///
/// `cadence` holds up to three ring-on durations in milliseconds; zero
/// entries are wildcards. A match selects `context`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinctiveRing {
    pub cadence: [u32; 3],
    pub context: String,
}

/// Per-channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Hardware channel number
    pub channel: ChannelId,

    /// Signalling family
    pub signaling: SignalingFamily,

    /// Dial-plan context for inbound calls
    pub context: String,

    /// Fixed extension for inbound calls (empty for digit collection)
    pub extension: String,

    /// Go straight to the dial plan on seizure instead of collecting digits
    pub immediate: bool,

    /// Receive gain in dB
    pub rx_gain: f32,

    /// Transmit gain in dB
    pub tx_gain: f32,

    /// Companding law of the line
    pub law: Law,

    /// Caller-id delivery on station ports
    pub callerid_mode: CallerIdMode,

    /// When caller id starts on trunk-facing lines
    pub callerid_start: CallerIdStart,

    /// Number of rings before caller id is sent
    pub cid_rings: u32,

    /// Our own caller id (used for feature group ANI)
    pub caller_number: Option<String>,

    /// Our own caller name
    pub caller_name: Option<String>,

    /// Suppress caller id on outbound calls
    pub hide_callerid: bool,

    pub call_waiting: bool,
    pub three_way_calling: bool,
    pub transfer: bool,
    pub transfer_to_busy: bool,

    /// Echo canceller taps (0 disables echo cancelling)
    pub echo_cancel_taps: u16,

    /// Echo training duration in milliseconds (0 disables training)
    pub echo_training_ms: u32,

    /// Keep the echo canceller running while natively bridged
    pub echo_cancel_when_bridged: bool,

    /// Mailbox polled for message-waiting indication
    pub mailbox: Option<String>,

    /// Leading digits stripped from outbound destinations
    pub strip_digits: usize,

    /// Use pulse instead of tone dialling
    pub pulse_dial: bool,

    /// Distinctive-ring table, first match wins
    pub distinctive_ring: Vec<DistinctiveRing>,

    pub answer_on_polarity_switch: bool,
    pub hangup_on_polarity_switch: bool,

    /// Dial group bitmask matched by `gN`/`GN` requests
    pub group: u64,

    /// Call group bitmask
    pub call_group: u64,

    /// Pickup group bitmask
    pub pickup_group: u64,

    /// Language tag handed to the collaborator
    pub language: String,
}

impl ChannelConfig {
    /// Create a configuration with defaults for the given channel and signalling
    pub fn new(channel: ChannelId, signaling: SignalingFamily) -> Self {
        Self {
            channel,
            signaling,
            context: "default".to_string(),
            extension: String::new(),
            immediate: false,
            rx_gain: 0.0,
            tx_gain: 0.0,
            law: Law::Mulaw,
            callerid_mode: CallerIdMode::Sdmf,
            callerid_start: CallerIdStart::Ring,
            cid_rings: 1,
            caller_number: None,
            caller_name: None,
            hide_callerid: false,
            call_waiting: true,
            three_way_calling: true,
            transfer: true,
            transfer_to_busy: false,
            echo_cancel_taps: 128,
            echo_training_ms: 0,
            echo_cancel_when_bridged: false,
            mailbox: None,
            strip_digits: 0,
            pulse_dial: false,
            distinctive_ring: Vec::new(),
            answer_on_polarity_switch: false,
            hangup_on_polarity_switch: false,
            group: 0,
            call_group: 0,
            pickup_group: 0,
            language: String::new(),
        }
    }

    /// Builder-style immediate mode
    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Builder-style gain
    pub fn with_gains(mut self, rx_gain: f32, tx_gain: f32) -> Self {
        self.rx_gain = rx_gain;
        self.tx_gain = tx_gain;
        self
    }
}

/// Switch variant spoken on the D-channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchType {
    National,
    Dms100,
    Att4ess,
    Lucent5e,
    EuroIsdn,
    Qsig,
}

/// Which side of the link we play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeSide {
    Network,
    Cpe,
}

/// Numbering plan for outbound called numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialPlan {
    Unknown,
    Local,
    National,
    International,
    Private,
    /// Derive the plan from the configured prefixes
    Dynamic,
}

/// One span within a trunk group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanConfig {
    pub span: SpanId,

    /// Logical span number used in channel designators
    pub logical_span: u8,

    /// Hardware channel numbers of the D-channels carried on this span
    pub dchannels: Vec<ChannelId>,

    /// Bearer channel numbers in offset order (offset 1 is the first entry)
    pub bearers: Vec<ChannelId>,

    /// Logical channels addressed by call reference value
    #[serde(default)]
    pub crvs: Vec<CrvConfig>,
}

/// A logical channel addressed by call reference value rather than bearer offset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrvConfig {
    pub crv: u16,

    /// Channel number of the logical record (must have PRI signalling)
    pub channel: ChannelId,
}

/// Digital trunk group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkConfig {
    pub group: TrunkGroupId,
    pub spans: Vec<SpanConfig>,
    pub switch_type: SwitchType,
    pub node_side: NodeSide,
    pub dial_plan: DialPlan,
    pub international_prefix: String,
    pub national_prefix: String,
    pub local_prefix: String,

    /// Context for inbound calls
    pub context: String,

    /// Accept digits after setup via overlap dialling
    pub overlap_dial: bool,

    /// Interval between background restart cycles (`None` disables)
    pub reset_interval: Option<Duration>,

    /// Destination dialled by administrative idle calls (`None` disables idle admission)
    pub idle_dial: Option<String>,

    /// Extension entered when an idle call answers
    pub idle_extension: String,

    /// Context entered when an idle call answers
    pub idle_context: String,

    /// Spare-capacity floor: free channels below this trigger an idle call
    pub min_unused: usize,

    /// Active idle-call ceiling: idle calls above this are released
    pub min_idle: usize,

    /// How long an idle call waits for answer before hanging up
    pub idle_answer_timeout: Duration,
}

impl TrunkConfig {
    /// Create a trunk group with defaults
    pub fn new(group: TrunkGroupId, spans: Vec<SpanConfig>) -> Self {
        Self {
            group,
            spans,
            switch_type: SwitchType::National,
            node_side: NodeSide::Cpe,
            dial_plan: DialPlan::Dynamic,
            international_prefix: "011".to_string(),
            national_prefix: "1".to_string(),
            local_prefix: String::new(),
            context: "default".to_string(),
            overlap_dial: false,
            reset_interval: None,
            idle_dial: None,
            idle_extension: String::new(),
            idle_context: "default".to_string(),
            min_unused: 2,
            min_idle: 0,
            idle_answer_timeout: Duration::from_secs(30),
        }
    }
}

/// Monitor loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Upper bound on a single poll so housekeeping still runs
    pub poll_timeout: Duration,

    /// Message-waiting polling interval
    pub mwi_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            mwi_interval: Duration::from_secs(10),
        }
    }
}

/// Signalling timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait for the first digit after dial tone
    pub first_digit_timeout: Duration,

    /// Wait between digits
    pub inter_digit_timeout: Duration,

    /// Wait for more digits once the collected number already matches
    pub match_digit_timeout: Duration,

    /// Guard interval after hangup on ground/kewl-start lines
    pub hangup_guard: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            first_digit_timeout: Duration::from_secs(16),
            inter_digit_timeout: Duration::from_secs(8),
            match_digit_timeout: Duration::from_secs(3),
            hangup_guard: Duration::from_secs(2),
        }
    }
}

impl DriverConfig {
    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if ch.channel.0 == 0 {
                return Err(TdmError::config("channel number 0 is reserved for pseudo channels"));
            }
            if !seen.insert(ch.channel) {
                return Err(TdmError::config(format!("channel {} configured twice", ch.channel)));
            }
            if !(-30.0..=30.0).contains(&ch.rx_gain) || !(-30.0..=30.0).contains(&ch.tx_gain) {
                return Err(TdmError::config(format!("gain out of range on {}", ch.channel)));
            }
            if ch.context.is_empty() {
                return Err(TdmError::config(format!("empty context on {}", ch.channel)));
            }
        }

        for trunk in &self.trunks {
            if trunk.spans.is_empty() {
                return Err(TdmError::config(format!("{} has no spans", trunk.group)));
            }
            let dchans: usize = trunk.spans.iter().map(|s| s.dchannels.len()).sum();
            if dchans == 0 || dchans > crate::trunk::MAX_DCHANNELS {
                return Err(TdmError::config(format!(
                    "{} needs 1..={} D-channels, has {}",
                    trunk.group,
                    crate::trunk::MAX_DCHANNELS,
                    dchans
                )));
            }
            for span in &trunk.spans {
                let logical = span.crvs.iter().map(|c| &c.channel);
                for bearer in span.bearers.iter().chain(logical) {
                    let configured = self.channels.iter().find(|c| c.channel == *bearer);
                    match configured {
                        Some(c) if c.signaling == SignalingFamily::Pri => {}
                        Some(_) => {
                            return Err(TdmError::config(format!(
                                "bearer {} of {} is not configured for PRI signalling",
                                bearer, trunk.group
                            )))
                        }
                        None => {
                            return Err(TdmError::config(format!(
                                "bearer {} of {} has no channel configuration",
                                bearer, trunk.group
                            )))
                        }
                    }
                }
            }
            if trunk.idle_dial.is_some() && trunk.idle_extension.is_empty() {
                return Err(TdmError::config(format!(
                    "{} enables idle dialling without an idle extension",
                    trunk.group
                )));
            }
        }

        if self.monitor.poll_timeout.is_zero() {
            return Err(TdmError::config("monitor poll_timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Look up a channel's configuration
    pub fn channel(&self, id: ChannelId) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.channel == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pri_trunk() -> DriverConfig {
        let mut config = DriverConfig::default();
        config.channels.push(ChannelConfig::new(ChannelId(1), SignalingFamily::Pri));
        config.channels.push(ChannelConfig::new(ChannelId(2), SignalingFamily::Pri));
        config.trunks.push(TrunkConfig::new(
            TrunkGroupId(1),
            vec![SpanConfig {
                span: SpanId(1),
                logical_span: 1,
                dchannels: vec![ChannelId(24)],
                bearers: vec![ChannelId(1), ChannelId(2)],
                crvs: Vec::new(),
            }],
        ));
        config
    }

    #[test]
    fn test_valid_trunk_config() {
        assert!(pri_trunk().validate().is_ok());
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut config = pri_trunk();
        config.channels.push(ChannelConfig::new(ChannelId(1), SignalingFamily::FxoLoopStart));
        assert!(matches!(config.validate(), Err(TdmError::Config(_))));
    }

    #[test]
    fn test_bearer_must_be_pri() {
        let mut config = pri_trunk();
        config.channels[1].signaling = SignalingFamily::EmWink;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_too_many_dchannels_rejected() {
        let mut config = pri_trunk();
        config.trunks[0].spans[0].dchannels =
            vec![ChannelId(24), ChannelId(48), ChannelId(72), ChannelId(96), ChannelId(120)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_from_json() {
        let json = serde_json::to_string(&pri_trunk()).unwrap();
        let parsed: DriverConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.channels.len(), 2);
        assert_eq!(parsed.trunks[0].min_unused, 2);
        assert_eq!(parsed.timing.hangup_guard, Duration::from_secs(2));
    }
}
