//! Core event types flowing through the bridge: field samples and the
//! analytics records derived from them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quality of a sampled value, propagated from the wire status when the
/// server reports one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "GOOD",
            Quality::Bad => "BAD",
            Quality::Uncertain => "UNCERTAIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GOOD" => Some(Quality::Good),
            "BAD" => Some(Quality::Bad),
            "UNCERTAIN" => Some(Quality::Uncertain),
            _ => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sampled value. The variant is preserved end to end so the remote-store
/// mapper can dispatch on it rather than stringifying.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Float(f64),
    Integer(i64),
    Bool(bool),
    String(String),
}

impl Value {
    /// Numeric view used by the analytics sub-processors. Booleans and
    /// strings are not numbers here; sub-processors that want state flags
    /// go through [`Value::state_text`] instead.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            Value::Bool(_) | Value::String(_) => None,
        }
    }

    /// Lowercased textual form used for state matching, e.g. availability
    /// tags treating `running`/`on`/`1`/`true` as running.
    pub fn state_text(&self) -> String {
        match self {
            Value::Float(v) => v.to_string(),
            Value::Integer(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::String(v) => v.to_ascii_lowercase(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Float(_) => "float",
            Value::Integer(_) => "integer",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
        }
    }
}

/// The five-level industrial naming hierarchy every sample carries.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub enterprise: String,
    pub site: String,
    pub area: String,
    pub line: String,
    pub machine: String,
}

/// One observation of one tag at one instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub hierarchy: Hierarchy,
    pub tag: String,
    pub value: Value,
    pub unit: Option<String>,
    pub quality: Quality,
}

impl Sample {
    /// The machine level of the hierarchy doubles as the asset name.
    pub fn machine(&self) -> &str {
        &self.hierarchy.machine
    }
}

/// Which KPI sub-processor produced a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiCategory {
    Oee,
    Energy,
    EnergyKpis,
}

impl KpiCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            KpiCategory::Oee => "oee",
            KpiCategory::Energy => "energy",
            KpiCategory::EnergyKpis => "energy_kpis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oee" => Some(KpiCategory::Oee),
            "energy" => Some(KpiCategory::Energy),
            "energy_kpis" => Some(KpiCategory::EnergyKpis),
            _ => None,
        }
    }
}

impl fmt::Display for KpiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate analytics output for one asset at one aggregation tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KpiRecord {
    pub timestamp: DateTime<Utc>,
    pub asset_name: String,
    pub category: KpiCategory,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// One domain-specific anomaly detected by the predictive sub-processor,
/// keyed in [`AnomalyRecord::energy_anomalies`] by anomaly name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyAnomaly {
    pub severity: Severity,
    pub magnitude: f64,
}

/// Per-sample predictive output, emitted only once baseline learning has
/// completed for every monitored tag of the asset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub timestamp: DateTime<Utc>,
    pub asset_name: String,
    pub tag: String,
    pub current_value: f64,
    pub baseline_mean: f64,
    pub z_score: f64,
    pub is_anomaly: bool,
    pub threshold_anomaly: bool,
    pub trend: f64,
    pub maintenance_score: f64,
    pub prediction_horizon_hours: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub energy_anomalies: BTreeMap<String, EnergyAnomaly>,
}

/// Either analytics output, as stored in and replayed from the durable
/// buffer. KPI and anomaly rows share one relation there, discriminated by
/// category.
#[derive(Clone, Debug, PartialEq)]
pub enum AnalyticsRecord {
    Kpi(KpiRecord),
    Anomaly(AnomalyRecord),
}

impl AnalyticsRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AnalyticsRecord::Kpi(kpi) => kpi.timestamp,
            AnalyticsRecord::Anomaly(anomaly) => anomaly.timestamp,
        }
    }

    pub fn asset_name(&self) -> &str {
        match self {
            AnalyticsRecord::Kpi(kpi) => &kpi.asset_name,
            AnalyticsRecord::Anomaly(anomaly) => &anomaly.asset_name,
        }
    }

    /// Discriminator persisted in the buffer and used as the
    /// `analytics_type` tag on upload.
    pub fn category(&self) -> &'static str {
        match self {
            AnalyticsRecord::Kpi(kpi) => kpi.category.as_str(),
            AnalyticsRecord::Anomaly(_) => "predictive",
        }
    }
}
