//! Energy consumption and power-factor sub-processor.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::window::{mean, round3, Window};
use crate::config::EnergyConfig;
use crate::event::{KpiCategory, KpiRecord, Sample};

const WINDOW_LEN: usize = 7200;
const POWER_LOOKBACK: usize = 300;
const POWER_FACTOR_LOOKBACK: usize = 60;
const DEFAULT_POWER_FACTOR: f64 = 0.95;

pub struct EnergyProcessor {
    config: EnergyConfig,
    power: Window<f64>,
    voltage: Window<f64>,
    current: Window<f64>,
    // In-memory running total; resets with the process, so the remote
    // cumulative series shows a discontinuity across restarts.
    total_energy_kwh: f64,
    last_aggregation: DateTime<Utc>,
}

impl EnergyProcessor {
    pub fn new(config: EnergyConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            power: Window::new(WINDOW_LEN),
            voltage: Window::new(WINDOW_LEN),
            current: Window::new(WINDOW_LEN),
            total_energy_kwh: 0.0,
            last_aggregation: now,
        }
    }

    /// Routes one sample into the rolling windows and fires the
    /// aggregation tick when the interval has elapsed. Ticks with no power
    /// data emit nothing.
    pub fn process(&mut self, sample: &Sample) -> Option<KpiRecord> {
        let tag = sample.tag.as_str();
        if let Some(v) = sample.value.as_f64() {
            if self.config.power_tags.iter().any(|t| t == tag) {
                self.power.push(v);
            } else if self.config.voltage_tags.iter().any(|t| t == tag) {
                self.voltage.push(v);
            } else if self.config.current_tags.iter().any(|t| t == tag) {
                self.current.push(v);
            }
        }

        let elapsed = (sample.timestamp - self.last_aggregation).num_seconds();
        if elapsed >= self.config.aggregation_interval as i64 {
            self.last_aggregation = sample.timestamp;
            return self.aggregate(sample.timestamp, sample.machine());
        }
        None
    }

    fn aggregate(&mut self, timestamp: DateTime<Utc>, asset_name: &str) -> Option<KpiRecord> {
        let recent: Vec<f64> = self.power.tail(POWER_LOOKBACK).copied().collect();
        let avg_power = mean(recent.iter().copied())?;

        let energy_kwh = avg_power * self.config.aggregation_interval as f64 / 3600.0;
        self.total_energy_kwh += energy_kwh;

        let peak = recent.iter().copied().fold(f64::MIN, f64::max);
        let min = recent.iter().copied().fold(f64::MAX, f64::min);

        let mut metrics = BTreeMap::new();
        metrics.insert("avg_power_kw".to_owned(), round3(avg_power));
        metrics.insert("energy_consumption_kwh".to_owned(), round3(energy_kwh));
        metrics.insert("total_energy_kwh".to_owned(), round3(self.total_energy_kwh));
        metrics.insert("power_factor".to_owned(), round3(self.power_factor()));
        metrics.insert("peak_power_kw".to_owned(), round3(peak));
        metrics.insert("min_power_kw".to_owned(), round3(min));

        Some(KpiRecord {
            timestamp,
            asset_name: asset_name.to_owned(),
            category: KpiCategory::Energy,
            metrics,
        })
    }

    /// Real power over apparent power from aligned recent windows; falls
    /// back to the nominal 0.95 when the streams are missing or ragged.
    fn power_factor(&self) -> f64 {
        let voltage: Vec<f64> = self.voltage.tail(POWER_FACTOR_LOOKBACK).copied().collect();
        let current: Vec<f64> = self.current.tail(POWER_FACTOR_LOOKBACK).copied().collect();
        let power: Vec<f64> = self.power.tail(POWER_FACTOR_LOOKBACK).copied().collect();

        if voltage.is_empty() || voltage.len() != current.len() || voltage.len() != power.len() {
            return DEFAULT_POWER_FACTOR;
        }

        let apparent = voltage
            .iter()
            .zip(current.iter())
            .map(|(v, i)| v * i)
            .sum::<f64>()
            / voltage.len() as f64;
        let real = power.iter().sum::<f64>() / power.len() as f64;

        if apparent > 0.0 {
            (real / apparent).clamp(0.0, 1.0)
        } else {
            DEFAULT_POWER_FACTOR
        }
    }
}
