use crate::constants::MAXIMUM_MAGNITUDE_BITS;

/// Scalar quantization step as carried by QCD/QCC: `delta = 2^(R - exponent) * (1 + mantissa / 2^11)`,
/// where `R` is the nominal dynamic range of the subband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QuantStep {
    pub exponent: u8,
    pub mantissa: u16,
}

impl QuantStep {
    /// Reversible bands carry only the exponent, equal to the nominal range.
    pub fn reversible(range_bits: u8) -> Self {
        Self {
            exponent: range_bits.min(31),
            mantissa: 0,
        }
    }

    /// Nearest representable step for `delta` in a band of nominal range `range_bits`.
    pub fn from_delta(delta: f64, range_bits: u8) -> Self {
        let x = delta / 2f64.powi(range_bits as i32);
        let exponent = (-x.log2().floor()).clamp(0.0, 31.0) as i32;
        let mantissa = ((x * 2f64.powi(exponent) - 1.0) * 2048.0).round();
        // Rounding may carry into the next octave.
        if mantissa >= 2048.0 && exponent > 0 {
            return Self {
                exponent: (exponent - 1) as u8,
                mantissa: 0,
            };
        }
        Self {
            exponent: exponent as u8,
            mantissa: mantissa.clamp(0.0, 2047.0) as u16,
        }
    }

    pub fn delta(&self, range_bits: u8) -> f64 {
        2f64.powi(range_bits as i32 - self.exponent as i32) * (1.0 + self.mantissa as f64 / 2048.0)
    }

    pub fn to_u16(self) -> u16 {
        ((self.exponent as u16) << 11) | (self.mantissa & 0x07FF)
    }

    pub fn from_u16(v: u16) -> Self {
        Self {
            exponent: (v >> 11) as u8,
            mantissa: v & 0x07FF,
        }
    }

    /// Magnitude bit-planes available to the band, guard bits included.
    pub fn magnitude_bits(&self, guard_bits: u8) -> u8 {
        (guard_bits + self.exponent)
            .saturating_sub(1)
            .min(MAXIMUM_MAGNITUDE_BITS)
    }
}

/// Coding passes worth keeping when steps finer than `limit_step` add nothing visible.
pub fn quality_limited_passes(magnitude_bits: u8, delta: f64, limit_step: Option<f32>) -> u16 {
    let full = (3 * magnitude_bits as u16).saturating_sub(2);
    let Some(limit) = limit_step else {
        return full;
    };
    if !(limit > 0.0) || delta <= 0.0 {
        return full;
    }
    let dropped = (limit as f64 / delta).log2().floor().max(0.0) as u16;
    let planes = (magnitude_bits as u16).saturating_sub(dropped);
    (3 * planes).saturating_sub(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_roundtrip() {
        let s = QuantStep::from_delta(0.0078125 * 1.5, 8);
        assert!((s.delta(8) - 0.011_718_75).abs() < 1e-6);
        assert_eq!(QuantStep::from_u16(s.to_u16()), s);
    }

    #[test]
    fn test_reversible_magnitude_bits() {
        let s = QuantStep::reversible(9);
        assert_eq!(s.magnitude_bits(2), 10);
        assert_eq!(s.mantissa, 0);
    }

    #[test]
    fn test_quality_limit() {
        assert_eq!(quality_limited_passes(10, 1.0, None), 28);
        // Four bit-planes finer than the limit are dropped.
        assert_eq!(quality_limited_passes(10, 1.0, Some(16.0)), 16);
        assert_eq!(quality_limited_passes(2, 1.0, Some(64.0)), 0);
    }
}
