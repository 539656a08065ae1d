//! Interval arithmetic over real-valued bounds
//!
//! Every value in the program gets a closed range `[lo, hi]` that contains
//! anything it can hold at runtime. Ranges are combined per operation before
//! any fixed-point decision is made.

use serde::{Deserialize, Serialize};

/// Closed range `[lo, hi]` with `lo <= hi`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lo: f64,
    pub hi: f64,
}

impl Interval {
    /// Build an interval, ordering the bounds if needed
    pub fn new(a: f64, b: f64) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }

    pub fn point(v: f64) -> Self {
        Self { lo: v, hi: v }
    }

    /// Smallest interval containing every value
    pub fn of_values(values: &[f64]) -> Self {
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if values.is_empty() {
            Self::point(0.0)
        } else {
            Self { lo, hi }
        }
    }

    /// Largest magnitude reachable
    pub fn magnitude(&self) -> f64 {
        self.lo.abs().max(self.hi.abs())
    }

    pub fn is_finite(&self) -> bool {
        self.lo.is_finite() && self.hi.is_finite()
    }

    #[cfg(test)]
    pub fn contains(&self, v: f64) -> bool {
        self.lo <= v && v <= self.hi
    }

    pub fn add(&self, other: &Interval) -> Interval {
        Interval {
            lo: self.lo + other.lo,
            hi: self.hi + other.hi,
        }
    }

    pub fn sub(&self, other: &Interval) -> Interval {
        Interval {
            lo: self.lo - other.hi,
            hi: self.hi - other.lo,
        }
    }

    /// Product range: hull of the four corner products, so no sign is assumed
    pub fn mul(&self, other: &Interval) -> Interval {
        let corners = [
            self.lo * other.lo,
            self.lo * other.hi,
            self.hi * other.lo,
            self.hi * other.hi,
        ];
        Interval::of_values(&corners)
    }

    /// Range of a sum of `terms` independent values each drawn from `self`
    pub fn accumulate(&self, terms: usize) -> Interval {
        let k = terms as f64;
        Interval {
            lo: self.lo * k,
            hi: self.hi * k,
        }
    }

    /// Range of `k`-term dot products of elements from `self` and `other`
    pub fn dot(&self, other: &Interval, k: usize) -> Interval {
        self.mul(other).accumulate(k)
    }

    pub fn neg(&self) -> Interval {
        Interval {
            lo: -self.hi,
            hi: -self.lo,
        }
    }

    pub fn relu(&self) -> Interval {
        Interval {
            lo: self.lo.max(0.0),
            hi: self.hi.max(0.0),
        }
    }

    /// Convex hull of two intervals
    pub fn hull(&self, other: &Interval) -> Interval {
        Interval {
            lo: self.lo.min(other.lo),
            hi: self.hi.max(other.hi),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [f64; 7] = [-3.0, -1.5, -0.25, 0.0, 0.5, 2.0, 4.0];

    fn grid(iv: &Interval) -> Vec<f64> {
        (0..=8)
            .map(|i| iv.lo + (iv.hi - iv.lo) * i as f64 / 8.0)
            .collect()
    }

    #[test]
    fn test_add_of_positive_ranges() {
        let a = Interval::new(0.0, 10.0);
        let b = Interval::new(0.0, 5.0);
        assert_eq!(a.add(&b), Interval::new(0.0, 15.0));
    }

    #[test]
    fn test_mul_uses_all_four_corners() {
        let a = Interval::new(-2.0, 2.0);
        let b = Interval::new(-3.0, 1.0);
        assert_eq!(a.mul(&b), Interval::new(-6.0, 6.0));
    }

    fn within(iv: &Interval, v: f64) -> bool {
        iv.lo <= v && v <= iv.hi
    }

    #[test]
    fn test_binary_ops_contain_every_combination() {
        for &a_lo in &SAMPLES {
            for &a_hi in &SAMPLES {
                for &b_lo in &SAMPLES {
                    for &b_hi in &SAMPLES {
                        if a_lo > a_hi || b_lo > b_hi {
                            continue;
                        }
                        let a = Interval::new(a_lo, a_hi);
                        let b = Interval::new(b_lo, b_hi);
                        let (sum, diff, prod) = (a.add(&b), a.sub(&b), a.mul(&b));
                        for x in grid(&a) {
                            for y in grid(&b) {
                                assert!(within(&sum, x + y));
                                assert!(within(&diff, x - y));
                                assert!(within(&prod, x * y), "{} * {} outside {}", x, y, prod);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_dot_product_widens_with_contraction_length() {
        let a = Interval::new(-1.0, 1.0);
        let b = Interval::new(0.0, 2.0);
        let single = a.mul(&b);
        let dot = a.dot(&b, 4);
        assert_eq!(dot, Interval::new(-8.0, 8.0));
        assert!(dot.lo <= single.lo && single.hi <= dot.hi);
    }

    #[test]
    fn test_of_values_and_hull() {
        let iv = Interval::of_values(&[3.0, -1.0, 2.0]);
        assert_eq!(iv, Interval::new(-1.0, 3.0));
        assert_eq!(iv.hull(&Interval::point(5.0)), Interval::new(-1.0, 5.0));
        assert_eq!(Interval::new(-2.0, 1.0).relu(), Interval::new(0.0, 1.0));
        assert_eq!(Interval::new(-2.0, 1.0).neg(), Interval::new(-1.0, 2.0));
    }
}
