//! # TDM-Core: Telephony Channel Driver
//!
//! This crate drives TDM telephony hardware for the RVOIP stack. It turns raw
//! line signalling (hook state, ring, wink and flash, polarity reversal,
//! digits) and digital trunk call-control events into call state changes,
//! and turns dial, answer, hangup and bridge requests from the
//! call-processing engine back into hardware and protocol actions.
//!
//! ## Components
//!
//! - **Channel records** ([`channel`]): one per hardware channel, with a real
//!   leg plus call-waiting and three-way legs layered on the conference bus
//! - **Monitor** ([`monitor`]): watches channels no call owns and seizes them
//!   for inbound calls
//! - **Trunk engine** ([`trunk`]): D-channel state, call-reference binding with
//!   glare resolution, span restarts and idle-call admission
//! - **Conference and bridge** ([`conference`], [`bridge`]): conference-bus
//!   membership and native two-channel bridging
//! - **Driver** ([`driver`]): the facade the call-processing engine talks to
//!
//! Hardware and the call-processing engine are reached through the
//! [`LineInterface`] and [`CallControl`] traits; each trunk group gets its own
//! [`TrunkProtocol`] instance.
//!
//! ## Usage
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use rvoip_tdm_core::testing::{MockCallControl, MockLine};
//! use rvoip_tdm_core::{ChannelConfig, ChannelId, DriverConfig, SignalingFamily, TdmDriver};
//!
//! let mut config = DriverConfig::default();
//! config
//!     .channels
//!     .push(ChannelConfig::new(ChannelId(1), SignalingFamily::FxsLoopStart));
//!
//! let driver = TdmDriver::new(
//!     config,
//!     Arc::new(MockLine::new()),
//!     Arc::new(MockCallControl::new()),
//!     HashMap::new(),
//! )?;
//! let owner = driver.request("1")?;
//! assert_eq!(driver.show_channel(ChannelId(1))?.owners, 1);
//! driver.hangup(owner, rvoip_tdm_core::Cause::NormalClearing)?;
//! # Ok::<(), rvoip_tdm_core::TdmError>(())
//! ```

pub mod bridge;
pub mod channel;
pub mod collaborator;
pub mod conference;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod line;
pub mod logging;
pub mod monitor;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod trunk;
pub mod types;

// Re-export commonly used types
pub use bridge::BridgeExit;
pub use channel::{ChannelOption, ChannelSummary, Indication, SignalingFamily};
pub use collaborator::{CallControl, Control, Frame, NewCall};
pub use config::{ChannelConfig, DriverConfig, MonitorConfig, SpanConfig, TimingConfig, TrunkConfig};
pub use driver::{ChannelSelector, TdmDriver};
pub use error::{Cause, Result, TdmError};
pub use line::{LineEvent, LineInterface};
pub use logging::{setup_logging, LoggingConfig};
pub use trunk::{TrunkEvent, TrunkProtocol};
pub use types::{CallState, CallerInfo, ChannelId, Law, LegIndex, OwnerId, SpanId, TrunkGroupId};

/// Version information for the driver
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
