//! Shared helpers for unit tests: sample/record builders, minimal asset
//! configs, and scripted sink doubles.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use indexmap::IndexMap;

use crate::config::{AssetConfig, OeeConfig, SiteConfig};
use crate::event::{AnomalyRecord, Hierarchy, KpiCategory, KpiRecord, Quality, Sample, Value};
use crate::sinks::influxdb::client::{InfluxSink, SinkError};
use crate::sinks::influxdb::encoder::Point;

pub fn hierarchy() -> Hierarchy {
    Hierarchy {
        enterprise: "GlobalCorp".into(),
        site: "Plant-North".into(),
        area: "Stamping".into(),
        line: "Line-1".into(),
        machine: "Press01".into(),
    }
}

/// A sample stamped `offset_secs` after a fixed epoch, so analytics tick
/// timing is deterministic.
pub fn sample_at(tag: &str, value: Value, offset_secs: i64) -> Sample {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
    Sample {
        timestamp: base + Duration::seconds(offset_secs),
        hierarchy: hierarchy(),
        tag: tag.into(),
        value,
        unit: None,
        quality: Quality::Good,
    }
}

pub fn sample_with(tag: &str, value: Value) -> Sample {
    sample_at(tag, value, 0)
}

pub fn kpi_record(asset: &str) -> KpiRecord {
    KpiRecord {
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap(),
        asset_name: asset.into(),
        category: KpiCategory::Oee,
        metrics: BTreeMap::from([
            ("availability".to_owned(), 75.0),
            ("performance".to_owned(), 83.33),
            ("quality".to_owned(), 100.0),
            ("overall_oee".to_owned(), 62.5),
        ]),
    }
}

pub fn anomaly_record(asset: &str, tag: &str) -> AnomalyRecord {
    AnomalyRecord {
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap(),
        asset_name: asset.into(),
        tag: tag.into(),
        current_value: 8.0,
        baseline_mean: 2.0,
        z_score: 4.2,
        is_anomaly: true,
        threshold_anomaly: false,
        trend: 0.01,
        maintenance_score: 55.0,
        prediction_horizon_hours: 24,
        energy_anomalies: BTreeMap::new(),
    }
}

/// A minimal valid asset: two mapped tags, no analytics.
pub fn bare_asset(name: &str) -> AssetConfig {
    AssetConfig {
        asset_name: name.into(),
        description: None,
        opcua_endpoint: "opc.tcp://127.0.0.1:4840".into(),
        node_mapping: IndexMap::from([
            ("Status".to_owned(), "2001".to_owned()),
            ("Speed".to_owned(), "2002".to_owned()),
        ]),
        oee_monitoring: None,
        energy_monitoring: None,
        energy_analytics: None,
        predictive_maintenance: None,
        security_settings: None,
        metadata: BTreeMap::from([
            ("site".to_owned(), "Plant-North".to_owned()),
            ("area".to_owned(), "Stamping".to_owned()),
            ("line".to_owned(), "Line-1".to_owned()),
        ]),
    }
}

pub fn asset_with_oee(name: &str) -> AssetConfig {
    let mut asset = bare_asset(name);
    asset
        .node_mapping
        .insert("MotorStatus".to_owned(), "2003".to_owned());
    asset
        .node_mapping
        .insert("MotorSpeed".to_owned(), "2004".to_owned());
    asset.oee_monitoring = Some(OeeConfig {
        availability_tags: vec!["MotorStatus".into()],
        performance_tags: vec!["MotorSpeed".into()],
        quality_tags: vec![],
        cycle_count_tag: None,
        production_rate_tag: None,
    });
    asset
}

pub fn site_for(asset: &AssetConfig) -> SiteConfig {
    SiteConfig {
        site_name: "Plant-North".into(),
        enterprise: "GlobalCorp".into(),
        description: None,
        assets: vec![asset.clone()],
    }
}

/// Sink double that accepts everything and keeps the written points.
#[derive(Default)]
pub struct RecordingSink {
    points: Mutex<Vec<Point>>,
}

impl RecordingSink {
    pub fn written_points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }
}

#[async_trait]
impl InfluxSink for RecordingSink {
    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        self.points.lock().unwrap().extend_from_slice(points);
        Ok(())
    }
}

/// Sink double that fails the first N pings or writes, then recovers.
pub struct FlakySink {
    failing_pings: AtomicUsize,
    failing_writes: AtomicUsize,
    write_calls: AtomicUsize,
    points: Mutex<Vec<Point>>,
}

impl FlakySink {
    pub fn failing_writes(count: usize) -> Self {
        Self {
            failing_pings: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(count),
            write_calls: AtomicUsize::new(0),
            points: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_pings(count: usize) -> Self {
        Self {
            failing_pings: AtomicUsize::new(count),
            failing_writes: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            points: Mutex::new(Vec::new()),
        }
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InfluxSink for FlakySink {
    async fn ping(&self) -> Result<(), SinkError> {
        let remaining = self.failing_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.failing_pings.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(SinkError::Rejected {
                status: 503,
                body: "ping unavailable".to_owned(),
            });
        }
        Ok(())
    }

    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.failing_writes.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(SinkError::Rejected {
                status: 503,
                body: "write unavailable".to_owned(),
            });
        }
        self.points.lock().unwrap().extend_from_slice(points);
        Ok(())
    }
}
