//! Companded gain tables.
//!
//! The hardware applies gain by translating each companded sample through a
//! 256-entry table per direction. Tables are derived from a dB value: expand
//! the sample to linear, scale, recompress.

use crate::types::Law;

/// Receive and transmit translation tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GainTable {
    pub rx: [u8; 256],
    pub tx: [u8; 256],
}

impl Default for GainTable {
    fn default() -> Self {
        Self::unity()
    }
}

impl GainTable {
    /// Tables that pass every sample through unchanged
    pub fn unity() -> Self {
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = i as u8;
        }
        Self { rx: table, tx: table }
    }

    /// Build tables for the given gains in dB
    pub fn compute(law: Law, rx_db: f32, tx_db: f32) -> Self {
        Self {
            rx: direction_table(law, rx_db),
            tx: direction_table(law, tx_db),
        }
    }
}

fn direction_table(law: Law, db: f32) -> [u8; 256] {
    let mut table = [0u8; 256];
    if db == 0.0 {
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = i as u8;
        }
        return table;
    }

    let factor = 10f32.powf(db / 20.0);
    for (i, entry) in table.iter_mut().enumerate() {
        let linear = match law {
            Law::Mulaw => ulaw_to_linear(i as u8),
            Law::Alaw => alaw_to_linear(i as u8),
        };
        let scaled = (linear as f32 * factor).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        *entry = match law {
            Law::Mulaw => linear_to_ulaw(scaled),
            Law::Alaw => linear_to_alaw(scaled),
        };
    }
    table
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Expand a µ-law sample
pub fn ulaw_to_linear(value: u8) -> i16 {
    let value = !value;
    let exponent = ((value >> 4) & 0x07) as i32;
    let mantissa = (value & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if value & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compress a linear sample to µ-law
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) as i32 | mantissa) as u8
}

/// Expand an A-law sample
pub fn alaw_to_linear(value: u8) -> i16 {
    let value = value ^ 0x55;
    let exponent = ((value >> 4) & 0x07) as i32;
    let mantissa = (value & 0x0F) as i32;
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    if value & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Compress a linear sample to A-law
pub fn linear_to_alaw(sample: i16) -> u8 {
    const SEGMENT_END: [i32; 8] = [0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF, 0x3FFF, 0x7FFF];

    let (mask, magnitude) = if sample >= 0 {
        (0xD5u8, sample as i32)
    } else {
        (0x55u8, -(sample as i32) - 1)
    };

    let segment = SEGMENT_END.iter().position(|end| magnitude <= *end);
    let Some(segment) = segment else {
        return 0x7F ^ mask;
    };

    let mut value = (segment as i32) << 4;
    if segment < 2 {
        value |= (magnitude >> 4) & 0x0F;
    } else {
        value |= (magnitude >> (segment as i32 + 3)) & 0x0F;
    }
    (value as u8) ^ mask
}
