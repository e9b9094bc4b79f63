//! Interface to the call-processing engine.
//!
//! The engine owns call objects (identified to the driver by [`OwnerId`]),
//! executes the dial plan and consumes the frames the driver queues. The
//! driver never calls back into itself through these methods: implementations
//! must not re-enter the driver synchronously from any of them.

use bytes::Bytes;

use crate::error::Cause;
use crate::types::{CallState, CallerInfo, ChannelId, LegIndex, OwnerId};

/// Control indications exchanged with the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Answer,
    Ringing,
    /// Inbound ring detected on a trunk
    Ring,
    OffHook,
    Busy,
    Congestion,
    Progress,
    Proceeding,
    Hold,
    Unhold,
    Flash,
    Wink,
    Hangup,
}

/// A frame delivered to or received from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Nothing to report
    Null,
    Voice(Bytes),
    Dtmf(char),
    Control(Control),
    Text(String),
}

/// Request to create a call object for a channel leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCall {
    pub channel: ChannelId,
    pub leg: LegIndex,
    pub state: CallState,
    pub context: String,
    pub extension: String,
    pub caller: CallerInfo,
    pub language: String,
    /// Administrative idle call originated by the trunk engine
    pub administrative: bool,
}

/// Callback surface of the call-processing engine
pub trait CallControl: Send + Sync {
    /// Create a call object for a leg; `None` means allocation failed
    fn new_call(&self, request: &NewCall) -> Option<OwnerId>;

    /// Queue a frame on a call object
    fn queue_frame(&self, owner: OwnerId, frame: Frame);

    /// Ask the engine to hang a call object up at its next opportunity
    fn soft_hangup(&self, owner: OwnerId, cause: Cause);

    /// Start dial-plan execution for a call object; false if it could not start
    fn start_pbx(&self, owner: OwnerId, context: &str, extension: &str) -> bool;

    /// Whether an extension exists in a context
    fn extension_exists(&self, context: &str, extension: &str, caller: Option<&str>) -> bool;

    /// Whether more digits could still match an extension
    fn can_match_more(&self, context: &str, extension: &str, caller: Option<&str>) -> bool;

    /// Whether the mailbox has new messages
    fn has_voicemail(&self, mailbox: &str) -> bool;

    /// Connect the far ends of two call objects so both local legs can drop.
    ///
    /// Returns false when the parties could not be joined.
    fn attempt_transfer(&self, held: OwnerId, target: OwnerId) -> bool;

    /// Notification that a call object's state changed
    fn state_changed(&self, _owner: OwnerId, _state: CallState) {}
}
