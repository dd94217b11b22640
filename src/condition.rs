//! Scene condition estimation from device-reported capture metadata
//!
//! The estimator never inspects pixels. It derives an EV-like brightness
//! score from what the capture device already reports (scene lux, or the
//! exposure time and analogue gain the sensor settled on) and smooths it
//! with an exponentially weighted moving average.

use crate::camera::CaptureResult;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Direction the smoothed brightness score is moving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    /// Scene getting brighter
    Improving,
    /// Scene getting darker
    Worsening,
    /// No significant change
    Stable,
}

/// Snapshot of the estimator's view of the scene
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionEstimate {
    /// Smoothed brightness score, `None` until the first valid reading
    pub score: Option<f64>,
    /// Direction of the last change
    pub trend: Trend,
    /// Absolute change of the smoothed score over the last update
    pub change_rate: f64,
    /// Capture timestamp of the last valid reading
    pub updated_at: Option<DateTime<FixedOffset>>,
    /// Consecutive updates (or missed captures) without usable metadata
    pub stale_updates: u32,
    /// False when no reading exists or the estimate went stale
    pub reliable: bool,
}

impl ConditionEstimate {
    /// Estimate carrying no information; selects fallback controls.
    pub fn unreliable() -> Self {
        Self {
            score: None,
            trend: Trend::Stable,
            change_rate: 0.0,
            updated_at: None,
            stale_updates: 0,
            reliable: false,
        }
    }
}

/// Tuning knobs for the estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorSettings {
    /// EWMA weight of the newest reading, in (0, 1]
    pub smoothing: f64,
    /// Consecutive stale updates after which the estimate is unreliable
    pub stale_after: u32,
    /// Minimum change of the smoothed score to count as a trend
    pub trend_threshold: f64,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            stale_after: 3,
            trend_threshold: 0.25,
        }
    }
}

/// Maintains the smoothed brightness estimate across captures
#[derive(Debug, Clone)]
pub struct ConditionEstimator {
    settings: EstimatorSettings,
    smoothed: Option<f64>,
    trend: Trend,
    change_rate: f64,
    updated_at: Option<DateTime<FixedOffset>>,
    stale_updates: u32,
}

impl ConditionEstimator {
    /// Create an estimator with no prior reading.
    pub fn new(settings: EstimatorSettings) -> Self {
        Self {
            settings,
            smoothed: None,
            trend: Trend::Stable,
            change_rate: 0.0,
            updated_at: None,
            stale_updates: 0,
        }
    }

    /// Fold a capture result into the estimate.
    ///
    /// Missing or malformed metadata leaves the previous estimate untouched
    /// and counts towards staleness.
    pub fn update(&mut self, result: &CaptureResult) -> ConditionEstimate {
        let Some(reading) = brightness_score(&result.metadata) else {
            self.stale_updates = self.stale_updates.saturating_add(1);
            tracing::debug!(
                stale_updates = self.stale_updates,
                "Capture metadata carried no usable brightness reading"
            );
            return self.current();
        };

        match self.smoothed {
            None => {
                self.smoothed = Some(reading);
                self.trend = Trend::Stable;
                self.change_rate = 0.0;
            }
            Some(previous) => {
                let alpha = self.settings.smoothing;
                let next = alpha * reading + (1.0 - alpha) * previous;
                let delta = next - previous;
                self.trend = if delta > self.settings.trend_threshold {
                    Trend::Improving
                } else if delta < -self.settings.trend_threshold {
                    Trend::Worsening
                } else {
                    Trend::Stable
                };
                self.change_rate = delta.abs();
                self.smoothed = Some(next);
            }
        }

        self.updated_at = Some(result.captured_at);
        self.stale_updates = 0;
        self.current()
    }

    /// Count a capture attempt that produced no result at all.
    pub fn record_missed(&mut self) {
        self.stale_updates = self.stale_updates.saturating_add(1);
    }

    /// Current estimate; unreliable once staleness reaches the limit.
    pub fn current(&self) -> ConditionEstimate {
        ConditionEstimate {
            score: self.smoothed,
            trend: self.trend,
            change_rate: self.change_rate,
            updated_at: self.updated_at,
            stale_updates: self.stale_updates,
            reliable: self.smoothed.is_some() && self.stale_updates < self.settings.stale_after,
        }
    }
}

const LUX_KEYS: [&str; 2] = ["Lux", "lux"];
const EXPOSURE_KEYS: [&str; 2] = ["ExposureTime", "exposure_time"];
const GAIN_KEYS: [&str; 2] = ["AnalogueGain", "analogue_gain"];

/// Floor for reported lux so a pitch-dark scene still has a finite score
const MIN_LUX: f64 = 1e-3;

fn lookup(metadata: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| metadata.get(*key))
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
}

/// Brightness score derived from device metadata.
///
/// Prefers the device's own scene lux (`log2(lux)`); otherwise uses the
/// auto-exposure result, `log2(1e6 / (exposure_us * gain))`, which places
/// one second at unity gain at zero. Both scales agree for a sensor whose
/// exposure-gain product is inversely proportional to lux.
pub fn brightness_score(metadata: &Map<String, Value>) -> Option<f64> {
    if let Some(lux) = lookup(metadata, &LUX_KEYS).filter(|lux| *lux >= 0.0) {
        return Some(lux.max(MIN_LUX).log2());
    }

    let exposure = lookup(metadata, &EXPOSURE_KEYS).filter(|v| *v > 0.0)?;
    let gain = lookup(metadata, &GAIN_KEYS).filter(|v| *v > 0.0)?;
    Some((1_000_000.0 / (exposure * gain)).log2())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;
    use serde_json::json;

    fn result(metadata: Value) -> CaptureResult {
        CaptureResult {
            image: Bytes::from_static(b"jpeg"),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            captured_at: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2026, 6, 1, 12, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn test_score_from_exposure_and_gain() {
        let meta = json!({ "ExposureTime": 1000, "AnalogueGain": 1.0 });
        let score = brightness_score(meta.as_object().unwrap()).unwrap();
        assert!((score - 1000f64.log2()).abs() < 1e-9);
    }

    #[test]
    fn test_score_prefers_lux() {
        let meta = json!({ "Lux": 1024.0, "ExposureTime": 1000, "AnalogueGain": 1.0 });
        assert_eq!(brightness_score(meta.as_object().unwrap()), Some(10.0));
    }

    #[test]
    fn test_score_rejects_malformed() {
        let meta = json!({ "ExposureTime": "fast", "AnalogueGain": 0.0 });
        assert!(brightness_score(meta.as_object().unwrap()).is_none());
    }

    #[test]
    fn test_zero_lux_is_darkest_reading() {
        let meta = json!({ "Lux": 0 });
        let score = brightness_score(meta.as_object().unwrap()).unwrap();
        assert!((score - MIN_LUX.log2()).abs() < 1e-9);

        let meta = json!({ "Lux": -3.0 });
        assert!(brightness_score(meta.as_object().unwrap()).is_none());

        let mut estimator = ConditionEstimator::new(EstimatorSettings::default());
        let estimate = estimator.update(&result(json!({ "Lux": 0.0 })));
        assert!(estimate.reliable);
        assert_eq!(estimate.stale_updates, 0);
    }

    #[test]
    fn test_estimate_serializes_timestamp() {
        let mut estimator = ConditionEstimator::new(EstimatorSettings::default());
        let estimate = estimator.update(&result(json!({ "Lux": 256.0 })));
        let value = serde_json::to_value(&estimate).unwrap();
        let updated_at = DateTime::parse_from_rfc3339(value["updated_at"].as_str().unwrap());
        assert_eq!(updated_at.ok(), estimate.updated_at);
        assert_eq!(value["trend"], "stable");
        assert_eq!(value["score"], 8.0);
    }

    #[test]
    fn test_smoothing_damps_single_outlier() {
        let mut estimator = ConditionEstimator::new(EstimatorSettings::default());
        estimator.update(&result(json!({ "Lux": 1024.0 })));
        let after = estimator.update(&result(json!({ "Lux": 1.0 })));
        let score = after.score.unwrap();
        assert!(score > 6.0, "outlier moved estimate to {score}");
        assert_eq!(after.trend, Trend::Worsening);
    }

    #[test]
    fn test_trend_stable_for_small_changes() {
        let mut estimator = ConditionEstimator::new(EstimatorSettings::default());
        estimator.update(&result(json!({ "Lux": 1024.0 })));
        let after = estimator.update(&result(json!({ "Lux": 1100.0 })));
        assert_eq!(after.trend, Trend::Stable);
    }

    #[test]
    fn test_staleness_marks_unreliable() {
        let settings = EstimatorSettings {
            stale_after: 3,
            ..Default::default()
        };
        let mut estimator = ConditionEstimator::new(settings);
        assert!(!estimator.current().reliable);

        let good = estimator.update(&result(json!({ "Lux": 512.0 })));
        assert!(good.reliable);

        for _ in 0..2 {
            let est = estimator.update(&result(json!({ "unrelated": true })));
            assert!(est.reliable);
            assert_eq!(est.score, Some(9.0));
        }
        let stale = estimator.update(&result(json!({})));
        assert!(!stale.reliable);
        assert_eq!(stale.score, Some(9.0));

        let recovered = estimator.update(&result(json!({ "Lux": 512.0 })));
        assert!(recovered.reliable);
        assert_eq!(recovered.stale_updates, 0);
    }

    #[test]
    fn test_missed_captures_count_as_stale() {
        let mut estimator = ConditionEstimator::new(EstimatorSettings {
            stale_after: 2,
            ..Default::default()
        });
        estimator.update(&result(json!({ "Lux": 64.0 })));
        estimator.record_missed();
        estimator.record_missed();
        assert!(!estimator.current().reliable);
    }
}
