//! Interface to the digital trunk call-control protocol stack.
//!
//! The stack owns the D-channel links and the Q.931 call references. The
//! driver talks to it through [`TrunkProtocol`]: primitives keyed by
//! [`CallRef`] and [`ChannelDesignator`] going out, [`TrunkEvent`]s coming in.

use std::io;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Cause;
use crate::types::CallerInfo;

/// Protocol call reference
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct CallRef(pub u32);

impl std::fmt::Display for CallRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Identifies a bearer on the trunk group
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ChannelDesignator {
    /// The logical span is given explicitly rather than implied by the active D-channel
    pub explicit: bool,
    pub logical_span: u8,
    /// Bearer offset within the span, starting at 1
    pub offset: u8,
    /// Call reference value of a logical channel riding on the bearer
    pub crv: Option<u16>,
}

impl ChannelDesignator {
    pub fn new(logical_span: u8, offset: u8) -> Self {
        Self {
            explicit: true,
            logical_span,
            offset,
            crv: None,
        }
    }

    /// A designator with an implicit span
    pub fn implicit(offset: u8) -> Self {
        Self {
            explicit: false,
            logical_span: 0,
            offset,
            crv: None,
        }
    }

    pub fn with_crv(mut self, crv: u16) -> Self {
        self.crv = Some(crv);
        self
    }
}

impl std::fmt::Display for ChannelDesignator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.logical_span, self.offset)?;
        if let Some(crv) = self.crv {
            write!(f, " crv {}", crv)?;
        }
        Ok(())
    }
}

/// Numbering plan / type of number of a called or calling number
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum NumberPlan {
    Unknown,
    International,
    National,
    Local,
    Private,
}

/// Outbound call setup parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupRequest {
    pub channel: ChannelDesignator,
    /// The bearer must be exactly the one designated
    pub exclusive: bool,
    pub called: String,
    pub called_plan: NumberPlan,
    /// More digits follow via overlap sending
    pub overlap: bool,
    pub calling: Option<String>,
    pub calling_plan: NumberPlan,
    pub calling_name: Option<String>,
    /// Calling number presentation restricted
    pub restricted: bool,
}

/// Events delivered by the protocol stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrunkEvent {
    /// Link alarm raised or cleared on a D-channel's span
    DChannelAlarm { dchannel: usize, alarm: bool },
    DChannelUp { dchannel: usize },
    DChannelDown { dchannel: usize },
    /// Far end restarted one channel, or the whole span when `channel` is `None`
    Restart { channel: Option<ChannelDesignator> },
    RestartAck { channel: ChannelDesignator },
    Setup {
        call: CallRef,
        /// `None` lets the driver pick any free bearer
        channel: Option<ChannelDesignator>,
        called: String,
        caller: CallerInfo,
        /// Sending complete: no overlap digits will follow
        complete: bool,
        /// The far end accepts a different bearer
        flexible: bool,
    },
    SetupAck { call: CallRef, channel: ChannelDesignator },
    Proceeding { call: CallRef, channel: ChannelDesignator },
    Progress { call: CallRef, channel: ChannelDesignator },
    Alerting { call: CallRef, channel: ChannelDesignator },
    Answer { call: CallRef, channel: ChannelDesignator },
    NotifyHold { call: CallRef, channel: ChannelDesignator },
    NotifyRetrieve { call: CallRef, channel: ChannelDesignator },
    Facility { call: CallRef, channel: ChannelDesignator },
    /// Overlap dialling digits from keypad or information messages
    Digits { call: CallRef, channel: ChannelDesignator, digits: String },
    HangupRequest { call: CallRef, channel: ChannelDesignator, cause: Cause },
    Hangup { call: CallRef, channel: ChannelDesignator, cause: Cause },
    HangupAck { call: CallRef, channel: ChannelDesignator },
}

/// Call-control protocol primitives
#[async_trait]
pub trait TrunkProtocol: Send + Sync {
    /// Allocate a call reference for an outbound call
    fn new_call(&self) -> Option<CallRef>;

    fn setup(&self, call: CallRef, request: &SetupRequest) -> io::Result<()>;

    /// Ask for more digits (overlap receiving)
    fn setup_ack(&self, call: CallRef, channel: ChannelDesignator, inband: bool) -> io::Result<()>;
    fn proceeding(&self, call: CallRef, channel: ChannelDesignator, inband: bool) -> io::Result<()>;
    fn progress(&self, call: CallRef, channel: ChannelDesignator, inband: bool) -> io::Result<()>;
    fn alerting(&self, call: CallRef, channel: ChannelDesignator, inband: bool) -> io::Result<()>;
    fn answer(&self, call: CallRef, channel: ChannelDesignator) -> io::Result<()>;
    fn notify(&self, call: CallRef, channel: ChannelDesignator, hold: bool) -> io::Result<()>;

    /// Send one overlap digit
    fn information(&self, call: CallRef, digit: char) -> io::Result<()>;

    fn hangup(&self, call: CallRef, cause: Cause) -> io::Result<()>;

    /// Forget a call reference without signalling
    fn destroy_call(&self, call: CallRef);

    /// Restart a channel
    fn reset(&self, channel: ChannelDesignator) -> io::Result<()>;

    /// Time until the stack's next protocol timer fires
    fn next_timer(&self) -> Option<Duration>;

    /// Run the scheduler until an event arrives or `timeout` elapses
    async fn next_event(&self, timeout: Duration) -> io::Result<Option<TrunkEvent>>;
}
