//! Camera control values and condition-driven control selection
//!
//! Controls are keyed by their libcamera names so the same map flows
//! unchanged into capture requests, device backends and metadata records.
//! Selection over the configured condition buckets is a pure step function
//! with a hysteresis band around every bucket boundary.

use crate::condition::ConditionEstimate;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Exposure time in microseconds
pub const EXPOSURE_TIME: &str = "ExposureTime";
/// Analogue sensor gain
pub const ANALOGUE_GAIN: &str = "AnalogueGain";
/// Automatic white balance toggle
pub const AWB_ENABLE: &str = "AwbEnable";
/// Manual red/blue colour gains, used when AWB is disabled
pub const COLOUR_GAINS: &str = "ColourGains";
/// Brightness offset in [-1, 1]
pub const BRIGHTNESS: &str = "Brightness";
/// Contrast multiplier
pub const CONTRAST: &str = "Contrast";
/// Autofocus mode (manual, auto, continuous)
pub const AF_MODE: &str = "AfMode";

/// A single camera control value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    /// Boolean switch
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// Pair of floats (e.g. red/blue gains)
    Pair(f64, f64),
    /// Enumerated value carried by name
    Text(String),
}

impl ControlValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ControlValue::Int(v) => Some(*v as f64),
            ControlValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view of the value, if it has one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Bool(v) => write!(f, "{v}"),
            ControlValue::Int(v) => write!(f, "{v}"),
            ControlValue::Float(v) => write!(f, "{v}"),
            ControlValue::Pair(a, b) => write!(f, "{a},{b}"),
            ControlValue::Text(v) => f.write_str(v),
        }
    }
}

/// Ordered mapping of control name to value
pub type Controls = BTreeMap<String, ControlValue>;

/// Overlay `overrides` on top of `base`, returning the merged set.
pub fn merge(base: &Controls, overrides: &Controls) -> Controls {
    let mut merged = base.clone();
    for (name, value) in overrides {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// A configured condition regime and the controls it applies
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionBucket {
    /// Bucket name (e.g. dark, dim, normal, bright)
    pub name: String,
    /// Entry threshold on the brightness score. Ignored for the lowest bucket.
    pub threshold: f64,
    /// Controls overlaid on the base controls while this bucket is active
    pub controls: Controls,
}

/// Pure configuration describing how conditions map to controls
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPolicy {
    base: Controls,
    buckets: Vec<ConditionBucket>,
    default_bucket: Option<usize>,
    hysteresis: f64,
}

/// Result of a control computation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlSelection {
    /// Index of the selected bucket, if the policy has buckets
    #[serde(skip)]
    pub index: Option<usize>,
    /// Name of the selected bucket
    pub bucket: Option<String>,
    /// Effective controls for the next capture
    pub controls: Controls,
    /// Whether the selection came from the fallback path
    pub fallback: bool,
}

impl ControlPolicy {
    /// Policy without condition buckets: every capture uses `base`.
    pub fn fixed(base: Controls) -> Self {
        Self {
            base,
            buckets: Vec::new(),
            default_bucket: None,
            hysteresis: 0.0,
        }
    }

    /// Build a bucketed policy.
    ///
    /// Buckets must be listed in strictly ascending threshold order and a
    /// default bucket is required whenever buckets are present.
    pub fn new(
        base: Controls,
        buckets: Vec<ConditionBucket>,
        default_bucket: Option<&str>,
        hysteresis: f64,
    ) -> Result<Self> {
        if !hysteresis.is_finite() || hysteresis < 0.0 {
            return Err(Error::Config(format!(
                "Hysteresis band must be a non-negative number, got {hysteresis}"
            )));
        }

        if buckets.is_empty() {
            if let Some(name) = default_bucket {
                return Err(Error::Config(format!(
                    "Default bucket '{name}' configured but no condition buckets are defined"
                )));
            }
            return Ok(Self::fixed(base));
        }

        for (i, bucket) in buckets.iter().enumerate() {
            if bucket.name.trim().is_empty() {
                return Err(Error::Config("Condition bucket names must not be empty".into()));
            }
            if !bucket.threshold.is_finite() {
                return Err(Error::Config(format!(
                    "Bucket '{}' has a non-finite threshold",
                    bucket.name
                )));
            }
            if buckets[..i].iter().any(|b| b.name == bucket.name) {
                return Err(Error::Config(format!(
                    "Duplicate condition bucket '{}'",
                    bucket.name
                )));
            }
            if i > 0 && bucket.threshold <= buckets[i - 1].threshold {
                return Err(Error::Config(format!(
                    "Bucket '{}' threshold {} must be greater than '{}' threshold {}",
                    bucket.name,
                    bucket.threshold,
                    buckets[i - 1].name,
                    buckets[i - 1].threshold
                )));
            }
        }

        let name = default_bucket.ok_or_else(|| {
            Error::Config("A default bucket is required when condition buckets are defined".into())
        })?;
        let default_index = buckets
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| Error::Config(format!("Default bucket '{name}' is not defined")))?;

        Ok(Self {
            base,
            buckets,
            default_bucket: Some(default_index),
            hysteresis,
        })
    }

    /// Base controls applied beneath every bucket
    pub fn base(&self) -> &Controls {
        &self.base
    }

    /// Configured buckets in ascending threshold order
    pub fn buckets(&self) -> &[ConditionBucket] {
        &self.buckets
    }

    /// Hysteresis band width
    pub fn hysteresis(&self) -> f64 {
        self.hysteresis
    }

    /// Name of the bucket at `index`
    pub fn bucket_name(&self, index: usize) -> Option<&str> {
        self.buckets.get(index).map(|b| b.name.as_str())
    }

    /// Selection used when the estimate is unreliable or the device rejected
    /// the adapted controls: base controls plus the explicit default bucket.
    pub fn fallback(&self) -> ControlSelection {
        match self.default_bucket {
            Some(index) => self.selection(index, true),
            None => ControlSelection {
                index: None,
                bucket: None,
                controls: self.base.clone(),
                fallback: true,
            },
        }
    }

    fn selection(&self, index: usize, fallback: bool) -> ControlSelection {
        let bucket = &self.buckets[index];
        ControlSelection {
            index: Some(index),
            bucket: Some(bucket.name.clone()),
            controls: merge(&self.base, &bucket.controls),
            fallback,
        }
    }

    /// Plain monotonic step function: highest bucket whose threshold is <= score.
    fn step(&self, score: f64) -> usize {
        self.buckets
            .iter()
            .rposition(|b| score >= b.threshold)
            .unwrap_or(0)
    }

    /// Step function with a band around the current bucket's boundaries.
    fn step_with_hysteresis(&self, score: f64, previous: usize) -> usize {
        if previous >= self.buckets.len() {
            return self.step(score);
        }

        let lower = if previous == 0 {
            f64::NEG_INFINITY
        } else {
            self.buckets[previous].threshold - self.hysteresis
        };
        let upper = match self.buckets.get(previous + 1) {
            Some(next) => next.threshold + self.hysteresis,
            None => f64::INFINITY,
        };

        if score >= lower && score < upper {
            previous
        } else {
            self.step(score)
        }
    }
}

/// Map the current condition estimate onto concrete control values.
///
/// `previous` is the bucket selected for the preceding capture; it anchors
/// the hysteresis band. Pure: no I/O and no shared state.
pub fn compute_controls(
    estimate: &ConditionEstimate,
    policy: &ControlPolicy,
    previous: Option<usize>,
) -> ControlSelection {
    if policy.buckets.is_empty() {
        return ControlSelection {
            index: None,
            bucket: None,
            controls: policy.base.clone(),
            fallback: false,
        };
    }

    let score = match estimate.score {
        Some(score) if estimate.reliable && score.is_finite() => score,
        _ => return policy.fallback(),
    };

    let index = match previous {
        Some(previous) => policy.step_with_hysteresis(score, previous),
        None => policy.step(score),
    };
    policy.selection(index, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ConditionEstimate, Trend};

    fn controls(pairs: &[(&str, ControlValue)]) -> Controls {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn policy() -> ControlPolicy {
        ControlPolicy::new(
            controls(&[(BRIGHTNESS, ControlValue::Float(0.0))]),
            vec![
                ConditionBucket {
                    name: "dark".into(),
                    threshold: 0.0,
                    controls: controls(&[
                        (EXPOSURE_TIME, ControlValue::Int(200_000)),
                        (ANALOGUE_GAIN, ControlValue::Float(8.0)),
                    ]),
                },
                ConditionBucket {
                    name: "dim".into(),
                    threshold: 4.0,
                    controls: controls(&[(ANALOGUE_GAIN, ControlValue::Float(4.0))]),
                },
                ConditionBucket {
                    name: "normal".into(),
                    threshold: 8.0,
                    controls: controls(&[(ANALOGUE_GAIN, ControlValue::Float(1.0))]),
                },
                ConditionBucket {
                    name: "bright".into(),
                    threshold: 12.0,
                    controls: controls(&[(EXPOSURE_TIME, ControlValue::Int(500))]),
                },
            ],
            Some("normal"),
            1.5,
        )
        .expect("valid policy")
    }

    fn estimate(score: f64) -> ConditionEstimate {
        ConditionEstimate {
            score: Some(score),
            trend: Trend::Stable,
            change_rate: 0.0,
            updated_at: None,
            stale_updates: 0,
            reliable: true,
        }
    }

    #[test]
    fn test_step_function_is_monotonic() {
        let policy = policy();
        let mut last = 0;
        for tenth in -50..200 {
            let selection = compute_controls(&estimate(tenth as f64 / 10.0), &policy, None);
            let index = selection.index.unwrap();
            assert!(index >= last);
            last = index;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn test_bucket_controls_overlay_base() {
        let selection = compute_controls(&estimate(1.0), &policy(), None);
        assert_eq!(selection.bucket.as_deref(), Some("dark"));
        assert_eq!(
            selection.controls.get(EXPOSURE_TIME),
            Some(&ControlValue::Int(200_000))
        );
        assert_eq!(
            selection.controls.get(BRIGHTNESS),
            Some(&ControlValue::Float(0.0))
        );
        assert!(!selection.fallback);
    }

    #[test]
    fn test_hysteresis_prevents_flapping() {
        let policy = policy();
        let mut previous = None;
        let mut changes = 0;
        for i in 0..10 {
            let score = if i % 2 == 0 { 9.0 } else { 7.0 };
            let selection = compute_controls(&estimate(score), &policy, previous);
            if previous.is_some() && previous != selection.index {
                changes += 1;
            }
            previous = selection.index;
        }
        assert!(changes <= 1, "bucket flapped {changes} times");
    }

    #[test]
    fn test_leaving_band_switches_bucket() {
        let policy = policy();
        let normal = compute_controls(&estimate(9.0), &policy, None);
        assert_eq!(normal.bucket.as_deref(), Some("normal"));

        let still_normal = compute_controls(&estimate(7.0), &policy, normal.index);
        assert_eq!(still_normal.bucket.as_deref(), Some("normal"));

        let dim = compute_controls(&estimate(6.0), &policy, normal.index);
        assert_eq!(dim.bucket.as_deref(), Some("dim"));

        let bright = compute_controls(&estimate(13.6), &policy, normal.index);
        assert_eq!(bright.bucket.as_deref(), Some("bright"));
    }

    #[test]
    fn test_unreliable_estimate_uses_default_bucket() {
        let mut unreliable = estimate(1.0);
        unreliable.reliable = false;
        let selection = compute_controls(&unreliable, &policy(), Some(0));
        assert_eq!(selection.bucket.as_deref(), Some("normal"));
        assert!(selection.fallback);
    }

    #[test]
    fn test_fixed_policy_returns_base() {
        let base = controls(&[(AWB_ENABLE, ControlValue::Bool(true))]);
        let policy = ControlPolicy::fixed(base.clone());
        let selection = compute_controls(&ConditionEstimate::unreliable(), &policy, None);
        assert_eq!(selection.controls, base);
        assert!(selection.bucket.is_none());
    }

    #[test]
    fn test_policy_validation() {
        let bucket = |name: &str, threshold: f64| ConditionBucket {
            name: name.into(),
            threshold,
            controls: Controls::new(),
        };

        let unsorted = ControlPolicy::new(
            Controls::new(),
            vec![bucket("a", 5.0), bucket("b", 1.0)],
            Some("a"),
            0.5,
        );
        assert!(matches!(unsorted, Err(Error::Config(_))));

        let missing_default = ControlPolicy::new(
            Controls::new(),
            vec![bucket("a", 0.0)],
            Some("nope"),
            0.5,
        );
        assert!(matches!(missing_default, Err(Error::Config(_))));

        let no_default = ControlPolicy::new(Controls::new(), vec![bucket("a", 0.0)], None, 0.5);
        assert!(matches!(no_default, Err(Error::Config(_))));
    }

    #[test]
    fn test_control_value_serde() {
        let map = controls(&[
            (AWB_ENABLE, ControlValue::Bool(false)),
            (COLOUR_GAINS, ControlValue::Pair(1.5, 2.0)),
            (EXPOSURE_TIME, ControlValue::Int(10_000)),
            (AF_MODE, ControlValue::Text("manual".into())),
        ]);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json[COLOUR_GAINS], serde_json::json!([1.5, 2.0]));
        let back: Controls = serde_json::from_value(json).unwrap();
        assert_eq!(back, map);
    }
}
