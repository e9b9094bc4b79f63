//! Signalling families and their decode/dial behaviour.
//!
//! The family is chosen once per channel from configuration and resolves to
//! a static [`SignalingBehavior`] that turns raw hardware events into
//! [`Signal`]s and builds outbound dial strings.
//!
//! Naming follows the hardware convention: an *FXO-signalled* port faces a
//! station (telephone) and an *FXS-signalled* port faces a central office.

use serde::{Deserialize, Serialize};

use crate::line::LineEvent;
use crate::types::HookCommand;

/// Signalling family of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalingFamily {
    /// Trunk to a central office, loop start
    FxsLoopStart,
    /// Trunk to a central office, ground start
    FxsGroundStart,
    /// Trunk to a central office, kewl start
    FxsKewlStart,
    /// Station port, loop start
    FxoLoopStart,
    /// Station port, ground start
    FxoGroundStart,
    /// Station port, kewl start
    FxoKewlStart,
    /// E&M immediate start
    Em,
    /// E&M on an E1 line
    EmE1,
    /// E&M wink start
    EmWink,
    /// Feature group D, DTMF
    FeatD,
    /// Feature group D, MF
    FeatDMf,
    /// Feature group D, MF tandem access
    FeatDMfTandem,
    /// Feature group B
    FeatB,
    /// Emergency services trunk
    E911,
    /// Single frequency, immediate start
    Sf,
    /// Single frequency, wink start
    SfWink,
    /// Single frequency, feature group D DTMF
    SfFeatD,
    /// Single frequency, feature group D MF
    SfFeatDMf,
    /// Single frequency, feature group B
    SfFeatB,
    /// Bearer channel of a digital trunk
    Pri,
    /// Digital clear channel without signalling
    Clear,
}

/// Broad signalling class of a family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingClass {
    /// Station-facing analog port
    Station,
    /// Central-office-facing analog trunk
    LoopTrunk,
    /// E&M, feature group and SF trunks
    EarAndMouth,
    /// Digital trunk bearer driven by the protocol engine
    Digital,
    /// Clear channel
    Clear,
}

/// When a pending outbound dial string is released to the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialTrigger {
    /// On hook-complete after seizure
    HookComplete,
    /// Only after the far end winks
    Wink,
    /// Dialling is not done by the line
    None,
}

/// Signalling-level meaning of a hardware event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Station picked up
    OffHook,
    /// Station hung up or far end released
    OnHook,
    /// Station hook flash
    Flash,
    /// Trunk wink
    Wink,
    /// Trunk ring or answer supervision
    Ring,
    HookComplete,
    DialComplete,
    /// One ring cadence finished on a station port
    RingCycleDone,
    /// Ringer started on a station port
    RingerOn,
    RingBegin,
    Polarity,
    PulseStart,
    Alarm,
    NoAlarm,
    Digit(char),
    /// Event has no meaning for this family
    Ignore,
}

/// Family-specific decode and dial capability
pub trait SignalingBehavior: Send + Sync {
    fn class(&self) -> SignalingClass;

    /// Translate a hardware event
    fn decode(&self, event: LineEvent) -> Signal;

    /// Hook command that seizes the line for an outbound call
    fn seizure(&self) -> Option<HookCommand>;

    /// When the pending dial string goes out
    fn dial_trigger(&self) -> DialTrigger;

    /// Build the hardware dial string for `number`; `ani` is our calling number
    fn dial_string(&self, number: &str, ani: Option<&str>, pulse: bool) -> Option<String>;

    /// Whether a hangup needs a guard interval before reuse
    fn needs_hangup_guard(&self) -> bool {
        false
    }
}

fn common(event: LineEvent) -> Signal {
    match event {
        LineEvent::Alarm => Signal::Alarm,
        LineEvent::NoAlarm => Signal::NoAlarm,
        LineEvent::DialComplete => Signal::DialComplete,
        LineEvent::HookComplete => Signal::HookComplete,
        LineEvent::PulseStart => Signal::PulseStart,
        LineEvent::Digit(d) => Signal::Digit(d),
        _ => Signal::Ignore,
    }
}

fn tone_or_pulse(number: &str, pulse: bool) -> String {
    if pulse {
        format!("P{}w", number)
    } else {
        format!("T{}w", number)
    }
}

/// Station ports (FXO signalled)
#[derive(Debug)]
pub struct StationSignaling {
    guarded: bool,
}

impl SignalingBehavior for StationSignaling {
    fn class(&self) -> SignalingClass {
        SignalingClass::Station
    }

    fn decode(&self, event: LineEvent) -> Signal {
        match event {
            LineEvent::RingOffHook => Signal::OffHook,
            LineEvent::OnHook => Signal::OnHook,
            LineEvent::WinkFlash => Signal::Flash,
            LineEvent::RingerOff => Signal::RingCycleDone,
            LineEvent::RingerOn => Signal::RingerOn,
            other => common(other),
        }
    }

    fn seizure(&self) -> Option<HookCommand> {
        Some(HookCommand::Ring)
    }

    fn dial_trigger(&self) -> DialTrigger {
        DialTrigger::None
    }

    fn dial_string(&self, _number: &str, _ani: Option<&str>, _pulse: bool) -> Option<String> {
        None
    }

    fn needs_hangup_guard(&self) -> bool {
        self.guarded
    }
}

/// Central-office trunks (FXS signalled)
#[derive(Debug)]
pub struct LoopTrunkSignaling {
    guarded: bool,
}

impl SignalingBehavior for LoopTrunkSignaling {
    fn class(&self) -> SignalingClass {
        SignalingClass::LoopTrunk
    }

    fn decode(&self, event: LineEvent) -> Signal {
        match event {
            LineEvent::RingOffHook => Signal::Ring,
            LineEvent::OnHook => Signal::OnHook,
            LineEvent::WinkFlash => Signal::Wink,
            LineEvent::RingBegin => Signal::RingBegin,
            LineEvent::PolarityReversal => Signal::Polarity,
            other => common(other),
        }
    }

    fn seizure(&self) -> Option<HookCommand> {
        Some(HookCommand::Start)
    }

    fn dial_trigger(&self) -> DialTrigger {
        DialTrigger::HookComplete
    }

    fn dial_string(&self, number: &str, _ani: Option<&str>, pulse: bool) -> Option<String> {
        Some(tone_or_pulse(number, pulse))
    }

    fn needs_hangup_guard(&self) -> bool {
        self.guarded
    }
}

/// Dial string encoding used by an E&M style trunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrunkEncoding {
    /// Plain tone or pulse digits
    Plain,
    /// `T*ANI*DNIS*`
    FeatureGroupD,
    /// `M*00ANI#*DNIS#`
    FeatureGroupDMf,
    /// `M*DNIS#` on a tandem
    FeatureGroupDTandem,
    /// `M*DNIS#`
    FeatureGroupB,
    /// `M*911#`
    Emergency,
}

/// E&M, feature group and SF trunks
#[derive(Debug)]
pub struct EmSignaling {
    encoding: TrunkEncoding,
}

impl EmSignaling {
    pub fn encoding(&self) -> TrunkEncoding {
        self.encoding
    }
}

impl SignalingBehavior for EmSignaling {
    fn class(&self) -> SignalingClass {
        SignalingClass::EarAndMouth
    }

    fn decode(&self, event: LineEvent) -> Signal {
        match event {
            LineEvent::RingOffHook => Signal::Ring,
            LineEvent::OnHook => Signal::OnHook,
            LineEvent::WinkFlash => Signal::Wink,
            other => common(other),
        }
    }

    fn seizure(&self) -> Option<HookCommand> {
        Some(HookCommand::Start)
    }

    fn dial_trigger(&self) -> DialTrigger {
        match self.encoding {
            TrunkEncoding::Plain | TrunkEncoding::FeatureGroupD => DialTrigger::HookComplete,
            // MF feature groups must wait for the wink
            _ => DialTrigger::Wink,
        }
    }

    fn dial_string(&self, number: &str, ani: Option<&str>, pulse: bool) -> Option<String> {
        let ani = ani.filter(|a| !a.is_empty());
        let dial = match self.encoding {
            TrunkEncoding::Plain => tone_or_pulse(number, pulse),
            TrunkEncoding::FeatureGroupD => match ani {
                Some(ani) => format!("T*{}*{}*", ani, number),
                None => format!("T**{}*", number),
            },
            TrunkEncoding::FeatureGroupDMf => match ani {
                Some(ani) => format!("M*00{}#*{}#", ani, number),
                None => format!("M*02#*{}#", number),
            },
            TrunkEncoding::FeatureGroupDTandem | TrunkEncoding::FeatureGroupB => {
                format!("M*{}#", number)
            }
            TrunkEncoding::Emergency => "M*911#".to_string(),
        };
        Some(dial)
    }
}

/// Digital trunk bearers: all call control goes through the protocol engine
#[derive(Debug)]
pub struct DigitalSignaling;

impl SignalingBehavior for DigitalSignaling {
    fn class(&self) -> SignalingClass {
        SignalingClass::Digital
    }

    fn decode(&self, event: LineEvent) -> Signal {
        match event {
            LineEvent::Alarm => Signal::Alarm,
            LineEvent::NoAlarm => Signal::NoAlarm,
            LineEvent::DialComplete => Signal::DialComplete,
            LineEvent::Digit(d) => Signal::Digit(d),
            _ => Signal::Ignore,
        }
    }

    fn seizure(&self) -> Option<HookCommand> {
        None
    }

    fn dial_trigger(&self) -> DialTrigger {
        DialTrigger::None
    }

    fn dial_string(&self, _number: &str, _ani: Option<&str>, _pulse: bool) -> Option<String> {
        None
    }
}

/// Clear channels carry data without any signalling
#[derive(Debug)]
pub struct ClearSignaling;

impl SignalingBehavior for ClearSignaling {
    fn class(&self) -> SignalingClass {
        SignalingClass::Clear
    }

    fn decode(&self, event: LineEvent) -> Signal {
        match event {
            LineEvent::Alarm => Signal::Alarm,
            LineEvent::NoAlarm => Signal::NoAlarm,
            _ => Signal::Ignore,
        }
    }

    fn seizure(&self) -> Option<HookCommand> {
        None
    }

    fn dial_trigger(&self) -> DialTrigger {
        DialTrigger::None
    }

    fn dial_string(&self, _number: &str, _ani: Option<&str>, _pulse: bool) -> Option<String> {
        None
    }
}

static STATION_LOOP: StationSignaling = StationSignaling { guarded: false };
static STATION_GUARDED: StationSignaling = StationSignaling { guarded: true };
static TRUNK_LOOP: LoopTrunkSignaling = LoopTrunkSignaling { guarded: false };
static TRUNK_GUARDED: LoopTrunkSignaling = LoopTrunkSignaling { guarded: true };
static EM_PLAIN: EmSignaling = EmSignaling { encoding: TrunkEncoding::Plain };
static EM_FEATD: EmSignaling = EmSignaling { encoding: TrunkEncoding::FeatureGroupD };
static EM_FEATDMF: EmSignaling = EmSignaling { encoding: TrunkEncoding::FeatureGroupDMf };
static EM_TANDEM: EmSignaling = EmSignaling { encoding: TrunkEncoding::FeatureGroupDTandem };
static EM_FEATB: EmSignaling = EmSignaling { encoding: TrunkEncoding::FeatureGroupB };
static EM_E911: EmSignaling = EmSignaling { encoding: TrunkEncoding::Emergency };
static DIGITAL: DigitalSignaling = DigitalSignaling;
static CLEAR: ClearSignaling = ClearSignaling;

impl SignalingFamily {
    /// Resolve the behaviour for this family
    pub fn behavior(self) -> &'static dyn SignalingBehavior {
        use SignalingFamily::*;
        match self {
            FxoLoopStart => &STATION_LOOP,
            FxoGroundStart | FxoKewlStart => &STATION_GUARDED,
            FxsLoopStart => &TRUNK_LOOP,
            FxsGroundStart | FxsKewlStart => &TRUNK_GUARDED,
            Em | EmE1 | EmWink | Sf | SfWink => &EM_PLAIN,
            FeatD | SfFeatD => &EM_FEATD,
            FeatDMf | SfFeatDMf => &EM_FEATDMF,
            FeatDMfTandem => &EM_TANDEM,
            FeatB | SfFeatB => &EM_FEATB,
            E911 => &EM_E911,
            Pri => &DIGITAL,
            Clear => &CLEAR,
        }
    }

    pub fn class(self) -> SignalingClass {
        self.behavior().class()
    }

    /// Whether inbound digits arrive as `*ANI*DNIS*`
    pub fn carries_ani(self) -> bool {
        matches!(
            self,
            SignalingFamily::FeatD
                | SignalingFamily::FeatDMf
                | SignalingFamily::FeatDMfTandem
                | SignalingFamily::SfFeatD
                | SignalingFamily::SfFeatDMf
        )
    }

    /// Whether inbound digits are MF and terminated by `#`
    pub fn uses_mf(self) -> bool {
        matches!(
            self,
            SignalingFamily::FeatDMf
                | SignalingFamily::FeatDMfTandem
                | SignalingFamily::FeatB
                | SignalingFamily::E911
                | SignalingFamily::SfFeatDMf
                | SignalingFamily::SfFeatB
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_decodes_hook_events() {
        let b = SignalingFamily::FxoLoopStart.behavior();
        assert_eq!(b.decode(LineEvent::RingOffHook), Signal::OffHook);
        assert_eq!(b.decode(LineEvent::WinkFlash), Signal::Flash);
        assert_eq!(b.decode(LineEvent::RingerOff), Signal::RingCycleDone);
        assert!(!b.needs_hangup_guard());
        assert!(SignalingFamily::FxoKewlStart.behavior().needs_hangup_guard());
    }

    #[test]
    fn test_trunk_decodes_ring_and_wink() {
        let b = SignalingFamily::EmWink.behavior();
        assert_eq!(b.decode(LineEvent::RingOffHook), Signal::Ring);
        assert_eq!(b.decode(LineEvent::WinkFlash), Signal::Wink);
        assert_eq!(b.decode(LineEvent::PolarityReversal), Signal::Ignore);
        let fxs = SignalingFamily::FxsLoopStart.behavior();
        assert_eq!(fxs.decode(LineEvent::PolarityReversal), Signal::Polarity);
    }

    #[test]
    fn test_feature_group_dial_strings() {
        let featd = SignalingFamily::FeatD.behavior();
        assert_eq!(featd.dial_string("5551212", Some("2565551000"), false).unwrap(), "T*2565551000*5551212*");
        assert_eq!(featd.dial_string("5551212", None, false).unwrap(), "T**5551212*");

        let mf = SignalingFamily::FeatDMf.behavior();
        assert_eq!(mf.dial_string("5551212", Some("100"), false).unwrap(), "M*00100#*5551212#");
        assert_eq!(mf.dial_string("5551212", None, false).unwrap(), "M*02#*5551212#");
        assert_eq!(mf.dial_trigger(), DialTrigger::Wink);

        assert_eq!(SignalingFamily::E911.behavior().dial_string("x", None, false).unwrap(), "M*911#");
        assert_eq!(SignalingFamily::FeatB.behavior().dial_string("411", None, false).unwrap(), "M*411#");
    }

    #[test]
    fn test_plain_trunk_dial_strings() {
        let em = SignalingFamily::EmWink.behavior();
        assert_eq!(em.dial_string("1234", None, false).unwrap(), "T1234w");
        assert_eq!(em.dial_string("1234", None, true).unwrap(), "P1234w");
        assert_eq!(em.dial_trigger(), DialTrigger::HookComplete);
        assert!(SignalingFamily::Pri.behavior().dial_string("1234", None, false).is_none());
    }

    #[test]
    fn test_family_classes_and_digit_formats() {
        assert_eq!(SignalingFamily::FxoGroundStart.class(), SignalingClass::Station);
        assert_eq!(SignalingFamily::FxsKewlStart.class(), SignalingClass::LoopTrunk);
        assert_eq!(SignalingFamily::SfFeatB.class(), SignalingClass::EarAndMouth);
        assert_eq!(SignalingFamily::Pri.class(), SignalingClass::Digital);
        assert!(SignalingFamily::SfFeatD.carries_ani());
        assert!(!SignalingFamily::FeatB.carries_ani());
        assert!(SignalingFamily::E911.uses_mf());
        assert!(!SignalingFamily::FeatD.uses_mf());
        assert_eq!(
            SignalingFamily::Pri.behavior().decode(LineEvent::RingOffHook),
            Signal::Ignore
        );
    }
}
