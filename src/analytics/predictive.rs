//! Predictive-maintenance sub-processor: per-tag baselines frozen after
//! the learning phase, z-score/trend/threshold scoring, and
//! domain-specific energy anomaly checks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use super::window::{mean, median, ols_slope, percentile, round2, round3, round4, stdev, Window};
use crate::config::PredictiveConfig;
use crate::event::{AnomalyRecord, EnergyAnomaly, Sample, Severity};

const WINDOW_LEN: usize = 1800;
const BASELINE_SAMPLES: usize = 900;
const Z_ANOMALY_THRESHOLD: f64 = 2.5;
const TREND_LOOKBACK: usize = 30;
const TREND_MIN_SAMPLES: usize = 10;

#[derive(Clone, Copy, Debug)]
struct Baseline {
    mean: f64,
    std_dev: f64,
    min: f64,
    max: f64,
    median: f64,
    q25: f64,
    q75: f64,
}

pub struct PredictiveProcessor {
    config: PredictiveConfig,
    monitored: Vec<String>,
    windows: BTreeMap<String, Window<f64>>,
    baselines: BTreeMap<String, Baseline>,
    baseline_ready: bool,
}

impl PredictiveProcessor {
    pub fn new(config: PredictiveConfig) -> Self {
        let monitored: Vec<String> = config
            .vibration_tags
            .iter()
            .chain(config.temperature_tags.iter())
            .chain(config.pressure_tags.iter())
            .cloned()
            .collect();
        Self {
            config,
            monitored,
            windows: BTreeMap::new(),
            baselines: BTreeMap::new(),
            baseline_ready: false,
        }
    }

    /// Whether every monitored tag has a learned baseline.
    pub fn baseline_ready(&self) -> bool {
        self.baseline_ready
    }

    pub fn process(&mut self, sample: &Sample) -> Option<AnomalyRecord> {
        let tag = sample.tag.as_str();
        if !self.monitored.iter().any(|t| t == tag) {
            return None;
        }
        let value = sample.value.as_f64()?;

        let window = self
            .windows
            .entry(tag.to_owned())
            .or_insert_with(|| Window::new(WINDOW_LEN));
        window.push(value);

        if !self.baseline_ready
            && !self.baselines.contains_key(tag)
            && window.len() >= BASELINE_SAMPLES
        {
            let values: Vec<f64> = window.iter().copied().collect();
            self.baselines.insert(
                tag.to_owned(),
                Baseline {
                    mean: mean(values.iter().copied()).unwrap_or(0.0),
                    std_dev: stdev(&values),
                    min: values.iter().copied().fold(f64::MAX, f64::min),
                    max: values.iter().copied().fold(f64::MIN, f64::max),
                    median: median(&values),
                    q25: percentile(&values, 25.0),
                    q75: percentile(&values, 75.0),
                },
            );
            if self.monitored.iter().all(|t| self.baselines.contains_key(t)) {
                // Frozen from here on; there is no re-baseline path.
                self.baseline_ready = true;
                info!(
                    message = "Baseline statistics learned for all monitored tags.",
                    tags = self.monitored.len()
                );
            }
        }

        if self.baseline_ready {
            Some(self.score(tag, value, sample.timestamp, sample.machine()))
        } else {
            None
        }
    }

    fn score(
        &self,
        tag: &str,
        value: f64,
        timestamp: DateTime<Utc>,
        asset_name: &str,
    ) -> AnomalyRecord {
        let baseline = &self.baselines[tag];
        let z_score = if baseline.std_dev > 0.0 {
            (value - baseline.mean).abs() / baseline.std_dev
        } else {
            0.0
        };

        let threshold = self.config.maintenance_thresholds.get(tag).copied();
        let threshold_anomaly = threshold.is_some_and(|t| value > t);

        let window = &self.windows[tag];
        let recent: Vec<f64> = window.tail(TREND_LOOKBACK).copied().collect();
        let trend = if recent.len() < TREND_MIN_SAMPLES {
            0.0
        } else {
            ols_slope(&recent)
        };

        let maintenance_score = maintenance_score(tag, value, z_score, trend, threshold);

        AnomalyRecord {
            timestamp,
            asset_name: asset_name.to_owned(),
            tag: tag.to_owned(),
            current_value: value,
            baseline_mean: baseline.mean,
            z_score: round3(z_score),
            is_anomaly: z_score > Z_ANOMALY_THRESHOLD,
            threshold_anomaly,
            trend: round4(trend),
            maintenance_score: round2(maintenance_score),
            prediction_horizon_hours: self.config.prediction_horizon,
            energy_anomalies: self.energy_anomalies(tag, window),
        }
    }

    /// Domain checks gated by substring match on the tag name. Each needs
    /// enough window history to compare a recent span against a prior one.
    fn energy_anomalies(&self, tag: &str, window: &Window<f64>) -> BTreeMap<String, EnergyAnomaly> {
        let lowered = tag.to_ascii_lowercase();
        let mut anomalies = BTreeMap::new();

        if (lowered.contains("battery") || lowered.contains("soc")) && window.len() >= 600 {
            let recent = mean(window.tail(300).copied()).unwrap_or(0.0);
            let prior = mean(window.range_back(600, 300).copied()).unwrap_or(0.0);
            let drop = prior - recent;
            if drop > 20.0 {
                anomalies.insert(
                    "battery_soc_drop".to_owned(),
                    EnergyAnomaly {
                        severity: severity_over(drop, 30.0),
                        magnitude: round3(drop),
                    },
                );
            }
        }

        if lowered.contains("power") && window.len() >= 300 {
            let recent_max = window.tail(60).copied().fold(f64::MIN, f64::max);
            if let Some(prior_mean) = mean(window.range_back(300, 240).copied()) {
                if prior_mean > 0.0 {
                    let ratio = recent_max / prior_mean;
                    if ratio > 2.0 {
                        anomalies.insert(
                            "power_spike".to_owned(),
                            EnergyAnomaly {
                                severity: severity_over(ratio, 3.0),
                                magnitude: round3(ratio),
                            },
                        );
                    }
                }
            }
        }

        if lowered.contains("efficiency") && window.len() >= 600 {
            let recent = mean(window.tail(300).copied()).unwrap_or(0.0);
            let prior = mean(window.range_back(600, 300).copied()).unwrap_or(0.0);
            let drop = prior - recent;
            if drop > 15.0 {
                anomalies.insert(
                    "efficiency_drop".to_owned(),
                    EnergyAnomaly {
                        severity: severity_over(drop, 25.0),
                        magnitude: round3(drop),
                    },
                );
            }
        }

        if lowered.contains("voltage") && window.len() >= 600 {
            let recent = mean(window.tail(120).copied()).unwrap_or(0.0);
            if let Some(prior) = mean(window.range_back(600, 480).copied()) {
                if prior != 0.0 {
                    let deviation_pct = (recent - prior).abs() / prior.abs() * 100.0;
                    if deviation_pct > 10.0 {
                        anomalies.insert(
                            "voltage_deviation".to_owned(),
                            EnergyAnomaly {
                                severity: severity_over(deviation_pct, 15.0),
                                magnitude: round3(deviation_pct),
                            },
                        );
                    }
                }
            }
        }

        anomalies
    }
}

fn severity_over(magnitude: f64, high_threshold: f64) -> Severity {
    if magnitude > high_threshold {
        Severity::High
    } else {
        Severity::Medium
    }
}

/// Component-summed maintenance score, capped at 100.
fn maintenance_score(
    tag: &str,
    value: f64,
    z_score: f64,
    trend: f64,
    threshold: Option<f64>,
) -> f64 {
    let mut score: f64 = 0.0;

    score += match z_score {
        z if z > 3.0 => 30.0,
        z if z > 2.0 => 25.0,
        z if z > 1.0 => 15.0,
        z if z > 0.5 => 10.0,
        _ => 0.0,
    };

    score += match trend.abs() {
        t if t > 0.1 => 25.0,
        t if t > 0.05 => 18.0,
        t if t > 0.01 => 12.0,
        _ => 0.0,
    };

    if let Some(threshold) = threshold {
        score += match value {
            v if v > threshold => 25.0,
            v if v > threshold * 0.9 => 18.0,
            v if v > threshold * 0.8 => 12.0,
            _ => 0.0,
        };
    }

    let lowered = tag.to_ascii_lowercase();
    if lowered.contains("battery") || lowered.contains("soc") || lowered.contains("temperature") {
        score += match value {
            v if v > 80.0 => 20.0,
            v if v > 70.0 => 15.0,
            v if v > 60.0 => 10.0,
            _ => 0.0,
        };
    } else if lowered.contains("efficiency") {
        score += match value {
            v if v < 70.0 => 20.0,
            v if v < 80.0 => 15.0,
            v if v < 85.0 => 10.0,
            _ => 0.0,
        };
    }

    score.min(100.0)
}
