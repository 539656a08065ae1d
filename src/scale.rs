//! Fixed-point scales
//!
//! A stored integer `v` at scale `s` represents the real value `v * 2^s`.
//! More negative scales are finer (more fractional bits).

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::interval::Interval;

/// Binary-point exponent of a fixed-point value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scale(pub i32);

impl Scale {
    /// Scale of plain integers (loop indices, argmax results)
    pub const INTEGER: Scale = Scale(0);

    /// Finest scale at which every value of `interval` fits in `bits`
    /// signed bits, but never finer than `2^-max_exponent`.
    pub fn derive(
        name: &str,
        interval: &Interval,
        bits: u32,
        max_exponent: u32,
    ) -> CompileResult<Scale> {
        let overflow = |scale: i32| CompileError::overflow(name, interval, Scale(scale), bits);

        if !interval.is_finite() {
            return Err(overflow(-(max_exponent as i32)));
        }

        let limit = ((1i64 << (bits - 1)) - 1) as f64;
        let magnitude = interval.magnitude();
        // Wide intermediates are twice the word; past that shifts are meaningless.
        let ceiling = 2 * bits as i32;
        let mut scale = -(max_exponent as i32);

        while magnitude * 2f64.powi(-scale) > limit {
            scale += 1;
            if scale >= ceiling {
                return Err(overflow(scale));
            }
        }

        Ok(Scale(scale))
    }

    /// Check `|value| < 2^(bits-1)` for every value of `interval` stored at this scale
    pub fn check_fits(&self, name: &str, interval: &Interval, bits: u32) -> CompileResult<()> {
        let bound = 2f64.powi(bits as i32 - 1);
        let factor = 2f64.powi(-self.0);
        let fits = interval.is_finite()
            && interval.hi * factor < bound
            && interval.lo * factor >= -bound;

        if fits {
            Ok(())
        } else {
            Err(CompileError::overflow(name, interval, *self, bits))
        }
    }

    /// The finer of two scales
    pub fn finer(self, other: Scale) -> Scale {
        Scale(self.0.min(other.0))
    }

    /// Exponent `k` such that converting a value from `self` to `to`
    /// multiplies its stored integer by `2^k` (positive means shift left)
    pub fn shift_to(self, to: Scale) -> i32 {
        self.0 - to.0
    }

    /// Nearest stored integer for a real value
    pub fn quantize(&self, value: f64) -> i64 {
        (value * 2f64.powi(-self.0)).round() as i64
    }

}

impl std::fmt::Display for Scale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "2^{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_picks_finest_fitting_scale() {
        let scale = Scale::derive("x", &Interval::new(0.0, 15.0), 16, 14).unwrap();
        assert_eq!(scale, Scale(-11));
        assert!(15.0 * 2f64.powi(-scale.0) < 32768.0);
        // One step finer would overflow
        assert!(15.0 * 2f64.powi(-(scale.0 - 1)) >= 32768.0);
    }

    #[test]
    fn test_derive_respects_max_exponent() {
        let scale = Scale::derive("x", &Interval::new(0.0, 15.0), 16, 0).unwrap();
        assert_eq!(scale, Scale(0));
        let zero = Scale::derive("z", &Interval::point(0.0), 16, 6).unwrap();
        assert_eq!(zero, Scale(-6));
    }

    #[test]
    fn test_large_ranges_get_positive_scales() {
        let scale = Scale::derive("big", &Interval::new(-100000.0, 100000.0), 16, 14).unwrap();
        assert!(scale.0 > 0);
        scale
            .check_fits("big", &Interval::new(-100000.0, 100000.0), 16)
            .unwrap();
    }

    #[test]
    fn test_derived_scales_are_sound() {
        let bounds = [0.0, 1e-4, 0.3, 0.5, 1.0, 1.5, 7.0, 15.0, 255.0, 1000.0, 32767.0, 1e6];
        for bits in [8, 16, 32] {
            for &lo in &bounds {
                for &hi in &bounds {
                    let iv = Interval::new(-lo, hi);
                    let scale = Scale::derive("v", &iv, bits, 14).unwrap();
                    let factor = 2f64.powi(-scale.0);
                    let bound = 2f64.powi(bits as i32 - 1);
                    assert!(iv.hi * factor < bound);
                    assert!(iv.lo * factor >= -bound);
                    scale.check_fits("v", &iv, bits).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_non_finite_bound_overflows() {
        let err = Scale::derive("e", &Interval::new(0.0, f64::INFINITY), 16, 14).unwrap_err();
        assert!(matches!(err, CompileError::OverflowBound { name, .. } if name == "e"));
    }

    #[test]
    fn test_check_fits_rejects_too_fine_scale() {
        let err = Scale(-12)
            .check_fits("y", &Interval::new(-10.0, 10.0), 16)
            .unwrap_err();
        assert!(matches!(err, CompileError::OverflowBound { bits: 16, .. }));
    }

    #[test]
    fn test_shift_to_is_positive_towards_finer() {
        assert_eq!(Scale(-4).shift_to(Scale(-9)), 5);
        assert_eq!(Scale(-9).shift_to(Scale(-4)), -5);
        assert_eq!(Scale(3).shift_to(Scale(3)), 0);
    }

    #[test]
    fn test_quantize_round_trip_error_is_bounded() {
        let scale = Scale(-10);
        for v in [-3.3, -0.001, 0.0, 0.7071, 2.5] {
            let stored = scale.quantize(v);
            assert!((stored as f64 * 2f64.powi(scale.0) - v).abs() <= 2f64.powi(-11));
        }
    }
}
