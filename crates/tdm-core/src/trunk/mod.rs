//! Digital trunk groups and their protocol engine.
//!
//! A trunk group is one or more spans sharing a single protocol instance
//! (NFAS). The group owns its bearer and call-reference records through the
//! same [`ChannelHandle`](crate::channel::ChannelHandle)s the registry holds,
//! plus the D-channel, reset-cycle and idle-admission state behind its own
//! lock. That lock is always taken before any channel lock.

pub mod dialplan;
pub mod engine;
pub mod group;
pub mod maintenance;
pub mod protocol;
pub mod resolve;

pub use engine::TrunkEngine;
pub use group::{DChannelStatus, TrunkGroup};
pub use protocol::{CallRef, ChannelDesignator, NumberPlan, SetupRequest, TrunkEvent, TrunkProtocol};

/// D-channels a single trunk group may carry
pub const MAX_DCHANNELS: usize = 4;
