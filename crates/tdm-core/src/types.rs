//! Core identifiers and small value types shared across the driver.

use serde::{Deserialize, Serialize};

/// Physical channel number (1-based, as numbered by the hardware)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TDM/{}", self.0)
    }
}

/// Span number (1-based)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SpanId(pub u32);

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "span {}", self.0)
    }
}

/// Trunk group id; several spans may share one protocol instance
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TrunkGroupId(pub u32);

impl std::fmt::Display for TrunkGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "trunk group {}", self.0)
    }
}

/// Hardware descriptor for an opened line or pseudo channel
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Descriptor(pub i32);

/// Opaque handle to a call-control object owned by the collaborator
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Hardware conference-bus number
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConfNumber(pub u32);

/// The three legs a physical channel can carry
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum LegIndex {
    /// The leg bound to the physical line
    Real,
    /// A call waiting on the line
    CallWait,
    /// The third party of a three-way call
    ThreeWay,
}

impl LegIndex {
    pub const ALL: [LegIndex; 3] = [LegIndex::Real, LegIndex::CallWait, LegIndex::ThreeWay];

    pub fn as_usize(self) -> usize {
        match self {
            LegIndex::Real => 0,
            LegIndex::CallWait => 1,
            LegIndex::ThreeWay => 2,
        }
    }
}

impl std::fmt::Display for LegIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LegIndex::Real => "real",
            LegIndex::CallWait => "callwait",
            LegIndex::ThreeWay => "threeway",
        };
        f.write_str(name)
    }
}

/// Call state of a leg as seen by the collaborator
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CallState {
    /// Idle, on hook
    Down,
    /// Seized for an outbound call or for digit collection
    Reserved,
    /// Off hook, no dial tone yet
    OffHook,
    /// Outbound digits are being sent
    Dialing,
    /// Post-answer digits are being sent
    DialingOffHook,
    /// Far end is ringing (outbound)
    Ringing,
    /// Line is ringing (inbound)
    Ring,
    /// Inbound seizure seen, waiting for caller id
    PreRing,
    /// Answered
    Up,
    /// Busy indication in progress
    Busy,
}

impl CallState {
    /// States from which an outbound dial is accepted
    pub fn can_dial(self) -> bool {
        matches!(self, CallState::Down | CallState::Reserved)
    }
}

/// Companding law of a line
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Law {
    Mulaw,
    Alaw,
}

impl Default for Law {
    fn default() -> Self {
        Law::Mulaw
    }
}

/// Hook transitions the line interface can perform
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum HookCommand {
    OnHook,
    OffHook,
    /// Start ringing a station
    Ring,
    /// Stop ringing a station
    RingOff,
    Wink,
    Flash,
    /// Seize a trunk (start signal)
    Start,
}

/// Call-progress tones
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Tone {
    DialTone,
    StutterDialTone,
    DialRecall,
    Ringback,
    Busy,
    Congestion,
    CallWaiting,
    Info,
}

/// Echo canceller commands
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EchoCommand {
    Enable { taps: u16 },
    Disable,
    Train { ms: u32 },
}

/// Conference-bus membership mode
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum ConfMode {
    /// The physical line together with its pseudo legs
    RealAndPseudo,
    /// Full talker and listener membership
    TalkerListener,
}

/// A conference request issued to the hardware
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum ConfRequest {
    /// Leave any conference
    Unattached,
    /// Join a conference; `None` asks the hardware to allocate a new number
    Join {
        number: Option<ConfNumber>,
        mode: ConfMode,
    },
    /// Digital monitor (direct cross-connect) of another channel
    Monitor(ChannelId),
}

/// The last conference state applied to a descriptor
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum AppliedConf {
    Unattached,
    Member { number: ConfNumber, mode: ConfMode },
    Monitor(ChannelId),
}

impl Default for AppliedConf {
    fn default() -> Self {
        AppliedConf::Unattached
    }
}

/// Caller identification carried with a call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub number: Option<String>,
    pub name: Option<String>,
    /// Automatic number identification from feature-group signalling
    pub ani: Option<String>,
    /// Dialed number identification from feature-group signalling
    pub dnis: Option<String>,
}

/// Line polarity as last reported by the hardware
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default)]
pub enum Polarity {
    #[default]
    Idle,
    Reversed,
}
