use thiserror::Error;

use crate::types::{ChannelId, OwnerId};

/// Q.850 clearing causes emitted or interpreted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Cause {
    /// 1 - unallocated (unassigned) number
    Unallocated,
    /// 16 - normal call clearing
    NormalClearing,
    /// 17 - user busy
    UserBusy,
    /// 19 - no answer from user
    NoAnswer,
    /// 27 - destination out of order
    DestinationOutOfOrder,
    /// 28 - invalid number format
    InvalidNumberFormat,
    /// 34 - no circuit/channel available
    NormalCircuitCongestion,
    /// 38 - network out of order
    NetworkOutOfOrder,
    /// 44 - requested circuit/channel not available
    RequestedChanUnavailable,
    /// 88 - incompatible destination
    IncompatibleDestination,
}

impl Cause {
    /// Numeric Q.850 value
    pub fn code(&self) -> u8 {
        match self {
            Cause::Unallocated => 1,
            Cause::NormalClearing => 16,
            Cause::UserBusy => 17,
            Cause::NoAnswer => 19,
            Cause::DestinationOutOfOrder => 27,
            Cause::InvalidNumberFormat => 28,
            Cause::NormalCircuitCongestion => 34,
            Cause::NetworkOutOfOrder => 38,
            Cause::RequestedChanUnavailable => 44,
            Cause::IncompatibleDestination => 88,
        }
    }

    /// Map a numeric Q.850 value back onto a known cause.
    ///
    /// Unknown values collapse to normal clearing.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Cause::Unallocated,
            17 => Cause::UserBusy,
            18 | 19 => Cause::NoAnswer,
            27 => Cause::DestinationOutOfOrder,
            28 => Cause::InvalidNumberFormat,
            34 => Cause::NormalCircuitCongestion,
            38 => Cause::NetworkOutOfOrder,
            44 => Cause::RequestedChanUnavailable,
            88 => Cause::IncompatibleDestination,
            _ => Cause::NormalClearing,
        }
    }

    /// Whether the collaborator should render this cause as busy rather than congestion
    pub fn is_busy(&self) -> bool {
        matches!(self, Cause::UserBusy)
    }
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// TDM driver errors
#[derive(Error, Debug)]
pub enum TdmError {
    /// Hardware I/O failure on a line descriptor
    #[error("Hardware error on channel {channel}: {source}")]
    Hardware {
        channel: ChannelId,
        #[source]
        source: std::io::Error,
    },

    /// Operation not valid in the current call state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Bad argument from the collaborator (dial string, option value, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Channel, span or owner not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Owner handle is not bound to any channel leg
    #[error("Unknown owner: {0}")]
    UnknownOwner(OwnerId),

    /// Pseudo descriptor, call object or channel could not be allocated
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Protocol engine rejected the request
    #[error("Protocol rejection ({cause}): {message}")]
    Protocol { cause: Cause, message: String },

    /// Span or channel is in alarm
    #[error("Channel {0} is in alarm")]
    Alarm(ChannelId),

    /// A cross-channel operation observed a concurrent change and must be retried
    #[error("Retry: {0}")]
    Retry(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TdmError {
    /// Create a new hardware error
    pub fn hardware(channel: ChannelId, source: std::io::Error) -> Self {
        Self::Hardware { channel, source }
    }

    /// Create a new InvalidState error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new InvalidArgument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new ResourceExhausted error
    pub fn exhausted<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a new Protocol error
    pub fn protocol<S: Into<String>>(cause: Cause, msg: S) -> Self {
        Self::Protocol { cause, message: msg.into() }
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Cause code surfaced to the collaborator when this error ends a call attempt
    pub fn cause(&self) -> Cause {
        match self {
            TdmError::Protocol { cause, .. } => *cause,
            TdmError::ResourceExhausted(_) => Cause::NormalCircuitCongestion,
            TdmError::Alarm(_) => Cause::NetworkOutOfOrder,
            TdmError::InvalidArgument(_) => Cause::InvalidNumberFormat,
            TdmError::InvalidState(_) => Cause::UserBusy,
            TdmError::NotFound(_) | TdmError::UnknownOwner(_) => Cause::Unallocated,
            _ => Cause::NormalCircuitCongestion,
        }
    }
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, TdmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_codes_round_trip_for_known_values() {
        for cause in [
            Cause::Unallocated,
            Cause::NormalClearing,
            Cause::UserBusy,
            Cause::NoAnswer,
            Cause::RequestedChanUnavailable,
            Cause::NormalCircuitCongestion,
        ] {
            assert_eq!(Cause::from_code(cause.code()), cause);
        }
        assert_eq!(Cause::from_code(200), Cause::NormalClearing);
    }

    #[test]
    fn test_error_to_cause_mapping() {
        assert_eq!(TdmError::exhausted("no pseudo").cause(), Cause::NormalCircuitCongestion);
        assert_eq!(TdmError::Alarm(ChannelId(1)).cause(), Cause::NetworkOutOfOrder);
        assert_eq!(
            TdmError::protocol(Cause::RequestedChanUnavailable, "glare").cause(),
            Cause::RequestedChanUnavailable
        );
        assert!(TdmError::invalid_state("busy").cause().is_busy());
    }
}
