//! Numbering plan derivation for outbound trunk calls.

use crate::config::{DialPlan, TrunkConfig};
use crate::trunk::protocol::NumberPlan;

/// Derive the numbering plan of `number`, returning the plan and the digits to signal.
///
/// With a dynamic plan a leading international or national prefix selects the
/// plan and is stripped; anything else is local.
pub fn derive_plan<'a>(config: &TrunkConfig, number: &'a str) -> (NumberPlan, &'a str) {
    match config.dial_plan {
        DialPlan::Unknown => (NumberPlan::Unknown, number),
        DialPlan::Local => (NumberPlan::Local, number),
        DialPlan::National => (NumberPlan::National, number),
        DialPlan::International => (NumberPlan::International, number),
        DialPlan::Private => (NumberPlan::Private, number),
        DialPlan::Dynamic => {
            let prefixes = [
                (config.international_prefix.as_str(), NumberPlan::International),
                (config.national_prefix.as_str(), NumberPlan::National),
                (config.local_prefix.as_str(), NumberPlan::Local),
            ];
            for (prefix, plan) in prefixes {
                if !prefix.is_empty() {
                    if let Some(rest) = number.strip_prefix(prefix) {
                        return (plan, rest);
                    }
                }
            }
            (NumberPlan::Local, number)
        }
    }
}
