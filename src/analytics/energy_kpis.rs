//! Site-energy KPI sub-processor: renewable generation, battery state of
//! charge, load, and system efficiency streams rolled up per aggregation
//! tick.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::window::{mean, round3, stdev, Window};
use crate::config::EnergyAnalyticsConfig;
use crate::event::{KpiCategory, KpiRecord, Sample};

const WINDOW_LEN: usize = 7200;
const LOOKBACK: usize = 300;

pub struct EnergyKpisProcessor {
    config: EnergyAnalyticsConfig,
    renewable: Window<f64>,
    battery: Window<f64>,
    load: Window<f64>,
    efficiency: Window<f64>,
    total_renewable_kwh: f64,
    total_load_kwh: f64,
    last_aggregation: DateTime<Utc>,
}

impl EnergyKpisProcessor {
    pub fn new(config: EnergyAnalyticsConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            renewable: Window::new(WINDOW_LEN),
            battery: Window::new(WINDOW_LEN),
            load: Window::new(WINDOW_LEN),
            efficiency: Window::new(WINDOW_LEN),
            total_renewable_kwh: 0.0,
            total_load_kwh: 0.0,
            last_aggregation: now,
        }
    }

    pub fn process(&mut self, sample: &Sample) -> Option<KpiRecord> {
        let tag = sample.tag.as_str();
        if let Some(v) = sample.value.as_f64() {
            if self.config.renewable_tags.iter().any(|t| t == tag) {
                self.renewable.push(v);
            } else if self.config.battery_tags.iter().any(|t| t == tag) {
                self.battery.push(v);
            } else if self.config.load_tags.iter().any(|t| t == tag) {
                self.load.push(v);
            } else if self.config.efficiency_tags.iter().any(|t| t == tag) {
                self.efficiency.push(v);
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
        let interval_hours = self.config.aggregation_interval as f64 / 3600.0;
        let mut metrics = BTreeMap::new();

        let renewable: Vec<f64> = self.renewable.tail(LOOKBACK).copied().collect();
        let mut avg_renewable = None;
        if let Some(avg) = mean(renewable.iter().copied()) {
            let peak = renewable.iter().copied().fold(f64::MIN, f64::max);
            let energy = avg * interval_hours;
            self.total_renewable_kwh += energy;
            avg_renewable = Some(avg);
            metrics.insert("renewable_avg_kw".to_owned(), round3(avg));
            metrics.insert("renewable_peak_kw".to_owned(), round3(peak));
            metrics.insert("renewable_energy_kwh".to_owned(), round3(energy));
            metrics.insert(
                "renewable_total_kwh".to_owned(),
                round3(self.total_renewable_kwh),
            );
        }

        let soc: Vec<f64> = self.battery.tail(LOOKBACK).copied().collect();
        if let Some(avg) = mean(soc.iter().copied()) {
            let min = soc.iter().copied().fold(f64::MAX, f64::min);
            let max = soc.iter().copied().fold(f64::MIN, f64::max);
            // Round-trip efficiency heuristic: heavy cycling (high SoC
            // spread) costs up to ten points off the nominal 95%.
            let round_trip = 95.0 - (2.0 * stdev(&soc)).clamp(0.0, 10.0);
            metrics.insert("battery_avg_soc".to_owned(), round3(avg));
            metrics.insert("battery_min_soc".to_owned(), round3(min));
            metrics.insert("battery_max_soc".to_owned(), round3(max));
            metrics.insert("battery_utilization".to_owned(), round3(max - min));
            metrics.insert(
                "battery_round_trip_efficiency".to_owned(),
                round3(round_trip),
            );
        }

        let load: Vec<f64> = self.load.tail(LOOKBACK).copied().collect();
        let mut avg_load = None;
        if let Some(avg) = mean(load.iter().copied()) {
            let peak = load.iter().copied().fold(f64::MIN, f64::max);
            let energy = avg * interval_hours;
            self.total_load_kwh += energy;
            avg_load = Some(avg);
            metrics.insert("load_avg_kw".to_owned(), round3(avg));
            metrics.insert("load_peak_kw".to_owned(), round3(peak));
            metrics.insert("load_energy_kwh".to_owned(), round3(energy));
            metrics.insert("load_total_kwh".to_owned(), round3(self.total_load_kwh));
            if peak > 0.0 {
                metrics.insert("load_factor".to_owned(), round3(avg / peak * 100.0));
            }
        }

        if let (Some(renewable), Some(load)) = (avg_renewable, avg_load) {
            if load > 0.0 {
                let share = (renewable / load * 100.0).min(100.0);
                metrics.insert("renewable_share".to_owned(), round3(share));
            }
        }
        if self.total_load_kwh > 0.0 && self.total_renewable_kwh > 0.0 {
            let independence = (self.total_renewable_kwh / self.total_load_kwh * 100.0).min(100.0);
            metrics.insert("energy_independence".to_owned(), round3(independence));
        }

        if let Some(avg) = mean(self.efficiency.tail(LOOKBACK).copied()) {
            metrics.insert("avg_system_efficiency".to_owned(), round3(avg));
        }

        if metrics.is_empty() {
            return None;
        }

        Some(KpiRecord {
            timestamp,
            asset_name: asset_name.to_owned(),
            category: KpiCategory::EnergyKpis,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use crate::test_util::sample_at;

    fn config() -> EnergyAnalyticsConfig {
        EnergyAnalyticsConfig {
            renewable_tags: vec!["SolarOutput".into()],
            battery_tags: vec!["BatterySoC".into()],
            load_tags: vec!["SiteLoad".into()],
            efficiency_tags: vec!["SystemEfficiency".into()],
            aggregation_interval: 300,
        }
    }

    fn run_streams(values: &[(&str, f64)], ticks: usize) -> Vec<KpiRecord> {
        let base = sample_at("x", Value::Float(0.0), 0).timestamp;
        let mut kpis = EnergyKpisProcessor::new(config(), base);
        let mut records = Vec::new();
        for i in 1..=(300 * ticks as i64 + 5) {
            for (tag, value) in values {
                if let Some(record) = kpis.process(&sample_at(tag, Value::Float(*value), i)) {
                    records.push(record);
                }
            }
        }
        records
    }

    #[test]
    fn renewable_and_load_roll_up_with_derived_shares() {
        let records = run_streams(&[("SolarOutput", 40.0), ("SiteLoad", 80.0)], 1);
        let m = &records.first().expect("tick").metrics;
        assert_eq!(m["renewable_avg_kw"], 40.0);
        assert_eq!(m["load_avg_kw"], 80.0);
        assert_eq!(m["load_factor"], 100.0);
        assert_eq!(m["renewable_share"], 50.0);
        assert_eq!(m["energy_independence"], 50.0);
        // 40 kW for 300 s.
        assert_eq!(m["renewable_energy_kwh"], round3(40.0 / 12.0));
    }

    #[test]
    fn renewable_share_is_capped_at_hundred() {
        let records = run_streams(&[("SolarOutput", 90.0), ("SiteLoad", 30.0)], 1);
        let m = &records.first().expect("tick").metrics;
        assert_eq!(m["renewable_share"], 100.0);
        assert_eq!(m["energy_independence"], 100.0);
    }

    #[test]
    fn battery_metrics_and_round_trip_heuristic() {
        let records = run_streams(&[("BatterySoC", 70.0)], 1);
        let m = &records.first().expect("tick").metrics;
        assert_eq!(m["battery_avg_soc"], 70.0);
        assert_eq!(m["battery_utilization"], 0.0);
        // Flat SoC means no stdev penalty.
        assert_eq!(m["battery_round_trip_efficiency"], 95.0);
    }

    #[test]
    fn efficiency_only_stream_still_emits() {
        let records = run_streams(&[("SystemEfficiency", 88.0)], 1);
        let m = &records.first().expect("tick").metrics;
        assert_eq!(m["avg_system_efficiency"], 88.0);
        assert!(!m.contains_key("renewable_avg_kw"));
    }

    #[test]
    fn unrelated_tags_never_tick_into_records() {
        let base = sample_at("x", Value::Float(0.0), 0).timestamp;
        let mut kpis = EnergyKpisProcessor::new(config(), base);
        for i in 1..=400 {
            assert!(kpis
                .process(&sample_at("Unrelated", Value::Float(1.0), i))
                .is_none());
        }
    }
}
