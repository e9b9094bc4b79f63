//! Hardware line control surface.
//!
//! A thin abstraction over the TDM hardware: every hook transition, tone,
//! gain table, conference assignment and echo canceller command the driver
//! issues goes through [`LineInterface`]. Failures here are reported as
//! `std::io::Error` and handled best-effort by the callers.

pub mod gain;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{
    AppliedConf, ChannelId, ConfNumber, ConfRequest, Descriptor, EchoCommand, HookCommand, Law, Tone,
};

pub use gain::GainTable;

/// Hardware events reported on a line descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineEvent {
    /// Loop opened / far end released
    OnHook,
    /// Station went off hook, or ring detected on a trunk
    RingOffHook,
    /// Hook flash from a station or wink from a trunk
    WinkFlash,
    /// Span or channel alarm raised
    Alarm,
    /// Alarm cleared
    NoAlarm,
    /// Hardware finished sending a dial string
    DialComplete,
    /// Ringer started on a station port
    RingerOn,
    /// Ringer stopped on a station port (one ring cycle done)
    RingerOff,
    /// Requested hook transition completed
    HookComplete,
    /// Pulse dialling started
    PulseStart,
    /// Line polarity reversed
    PolarityReversal,
    /// Ring voltage detected on a trunk-facing line
    RingBegin,
    /// A DTMF or MF digit was received
    Digit(char),
}

/// Signalling timing parameters of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineParams {
    pub prewink_ms: u32,
    pub preflash_ms: u32,
    pub wink_ms: u32,
    pub flash_ms: u32,
    pub start_ms: u32,
    pub rxwink_ms: u32,
    pub rxflash_ms: u32,
    pub debounce_ms: u32,
    /// Whether the hardware reports the line hook as off
    pub off_hook: bool,
}

impl Default for LineParams {
    fn default() -> Self {
        Self {
            prewink_ms: 50,
            preflash_ms: 50,
            wink_ms: 150,
            flash_ms: 750,
            start_ms: 1500,
            rxwink_ms: 300,
            rxflash_ms: 1250,
            debounce_ms: 600,
            off_hook: false,
        }
    }
}

/// Hardware buffering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub count: u8,
    pub size: u16,
    /// Write immediately instead of filling all buffers first
    pub immediate: bool,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            count: 4,
            size: 160,
            immediate: true,
        }
    }
}

/// What the monitor wants to hear about on a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterest {
    pub descriptor: Descriptor,
    /// Wake when the descriptor becomes writable (caller-id spill pending)
    pub writable: bool,
}

/// Readiness reported by a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub descriptor: Descriptor,
    /// A hardware event is pending
    pub event: bool,
    /// Audio is available for reading
    pub readable: bool,
    /// Space is available for writing
    pub writable: bool,
}

/// Hardware line control surface
#[async_trait]
pub trait LineInterface: Send + Sync {
    /// Open a numbered channel
    fn open(&self, channel: ChannelId) -> io::Result<Descriptor>;

    /// Open a pseudo channel for a software leg
    fn open_pseudo(&self) -> io::Result<Descriptor>;

    /// Close a descriptor
    fn close(&self, descriptor: Descriptor);

    fn get_params(&self, descriptor: Descriptor) -> io::Result<LineParams>;
    fn set_params(&self, descriptor: Descriptor, params: &LineParams) -> io::Result<()>;

    fn set_law(&self, descriptor: Descriptor, law: Law) -> io::Result<()>;
    fn set_linear(&self, descriptor: Descriptor, linear: bool) -> io::Result<()>;

    /// Perform a hook transition
    fn set_hook(&self, descriptor: Descriptor, command: HookCommand) -> io::Result<()>;

    /// Program the ring cadence (alternating on/off milliseconds), `None` restores the default
    fn set_cadence(&self, descriptor: Descriptor, cadence: Option<&[u32]>) -> io::Result<()>;

    fn get_gains(&self, descriptor: Descriptor) -> io::Result<GainTable>;
    fn set_gains(&self, descriptor: Descriptor, gains: &GainTable) -> io::Result<()>;

    /// Current conference assignment of a descriptor
    fn get_conf(&self, descriptor: Descriptor) -> io::Result<AppliedConf>;

    /// Apply a conference assignment; returns the conference number joined, if any
    fn set_conf(&self, descriptor: Descriptor, request: ConfRequest) -> io::Result<Option<ConfNumber>>;

    fn echo_cancel(&self, descriptor: Descriptor, command: EchoCommand) -> io::Result<()>;

    /// Start a tone, or stop any tone with `None`
    fn play_tone(&self, descriptor: Descriptor, tone: Option<Tone>) -> io::Result<()>;

    /// Drop any buffered audio in both directions
    fn flush(&self, descriptor: Descriptor) -> io::Result<()>;

    fn set_buffer_policy(&self, descriptor: Descriptor, policy: BufferPolicy) -> io::Result<()>;

    /// Send a dial string (`T`/`P`/`M` prefixed tone, pulse or MF digits, `w` waits)
    fn dial(&self, descriptor: Descriptor, dial_string: &str) -> io::Result<()>;

    /// Whether the hardware is still sending a dial string
    fn is_dialing(&self, descriptor: Descriptor) -> io::Result<bool>;

    /// Fetch the next pending hardware event without blocking
    fn get_event(&self, descriptor: Descriptor) -> io::Result<Option<LineEvent>>;

    fn read(&self, descriptor: Descriptor, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, descriptor: Descriptor, data: &[u8]) -> io::Result<usize>;

    /// Modulate a caller-id message into line samples for the given law
    fn modulate_callerid(&self, message: &[u8], law: Law) -> Bytes;

    /// Modulate text as TDD (Baudot) tones
    fn modulate_tdd(&self, text: &str, law: Law) -> Bytes;

    /// Wait until any descriptor has an event, is readable or (if asked) writable
    async fn poll(&self, interests: &[PollInterest], timeout: Duration) -> io::Result<Vec<Readiness>>;

    /// Wait for the next hardware event on a single descriptor
    async fn next_event(&self, descriptor: Descriptor, timeout: Duration) -> io::Result<Option<LineEvent>>;
}
