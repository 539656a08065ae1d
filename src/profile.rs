//! Profiling log support
//!
//! A profiling log records the ranges actually observed for program inputs
//! while running the floating-point model on a dataset. It is a JSON object
//! mapping input names to `[lo, hi]`:
//!
//! ```json
//! { "X": [-0.82, 0.97] }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::interval::Interval;

/// Measured input ranges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileData {
    ranges: BTreeMap<String, (f64, f64)>,
}

impl ProfileData {
    pub fn from_json(text: &str) -> CompileResult<Self> {
        let data: ProfileData =
            serde_json::from_str(text).map_err(|e| CompileError::profile(e.to_string()))?;

        for (name, (lo, hi)) in &data.ranges {
            if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                return Err(CompileError::profile(format!(
                    "invalid range for `{}`: [{}, {}]",
                    name, lo, hi
                )));
            }
        }

        Ok(data)
    }

    pub fn load(path: &Path) -> CompileResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CompileError::io(path, e))?;
        Self::from_json(&text)
    }

    /// Measured interval for an input, if one was recorded
    pub fn interval(&self, name: &str) -> Option<Interval> {
        self.ranges.get(name).map(|&(lo, hi)| Interval::new(lo, hi))
    }

    pub fn insert(&mut self, name: impl Into<String>, lo: f64, hi: f64) {
        self.ranges.insert(name.into(), (lo, hi));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profile() {
        let profile = ProfileData::from_json(r#"{ "X": [-0.5, 0.75] }"#).unwrap();
        assert_eq!(profile.interval("X"), Some(Interval::new(-0.5, 0.75)));
        assert_eq!(profile.interval("Y"), None);
    }

    #[test]
    fn test_reject_inverted_range() {
        let err = ProfileData::from_json(r#"{ "X": [1.0, -1.0] }"#).unwrap_err();
        assert!(matches!(err, CompileError::ProfileError { .. }));
    }

    #[test]
    fn test_reject_malformed_json() {
        assert!(ProfileData::from_json("{ X: 1 }").is_err());
    }
}
