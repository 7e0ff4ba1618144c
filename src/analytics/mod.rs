//! Streaming analytics: one [`AssetAnalytics`] per configured asset,
//! composing up to four independent sub-processors. Each consumes samples
//! and emits KPI or anomaly records; they share no state and run on the
//! owning collector task.

pub mod energy;
pub mod energy_kpis;
pub mod oee;
pub mod predictive;
pub mod window;

use chrono::Utc;

use crate::config::AssetConfig;
use crate::event::{AnalyticsRecord, Sample};
use energy::EnergyProcessor;
use energy_kpis::EnergyKpisProcessor;
use oee::OeeProcessor;
use predictive::PredictiveProcessor;

/// Per-asset analytics state. Owned by the asset's collector task; no
/// cross-task access.
pub struct AssetAnalytics {
    asset_name: String,
    oee: Option<OeeProcessor>,
    energy: Option<EnergyProcessor>,
    energy_kpis: Option<EnergyKpisProcessor>,
    predictive: Option<PredictiveProcessor>,
}

impl AssetAnalytics {
    pub fn new(asset: &AssetConfig) -> Self {
        let now = Utc::now();
        Self {
            asset_name: asset.asset_name.clone(),
            oee: asset.oee_monitoring.clone().map(OeeProcessor::new),
            energy: asset
                .energy_monitoring
                .clone()
                .map(|config| EnergyProcessor::new(config, now)),
            energy_kpis: asset
                .energy_analytics
                .clone()
                .map(|config| EnergyKpisProcessor::new(config, now)),
            predictive: asset
                .predictive_maintenance
                .clone()
                .map(PredictiveProcessor::new),
        }
    }

    pub fn asset_name(&self) -> &str {
        &self.asset_name
    }

    /// Feeds one sample through every enabled sub-processor and collects
    /// whatever they emit.
    pub fn process(&mut self, sample: &Sample) -> Vec<AnalyticsRecord> {
        let mut records = Vec::new();
        if let Some(oee) = &mut self.oee {
            if let Some(kpi) = oee.process(sample) {
                records.push(AnalyticsRecord::Kpi(kpi));
            }
        }
        if let Some(energy) = &mut self.energy {
            if let Some(kpi) = energy.process(sample) {
                records.push(AnalyticsRecord::Kpi(kpi));
            }
        }
        if let Some(energy_kpis) = &mut self.energy_kpis {
            if let Some(kpi) = energy_kpis.process(sample) {
                records.push(AnalyticsRecord::Kpi(kpi));
            }
        }
        if let Some(predictive) = &mut self.predictive {
            if let Some(anomaly) = predictive.process(sample) {
                records.push(AnalyticsRecord::Anomaly(anomaly));
            }
        }
        records
    }

    pub fn status(&self) -> AnalyticsStatus {
        AnalyticsStatus {
            oee: self.oee.is_some(),
            energy: self.energy.is_some(),
            energy_kpis: self.energy_kpis.is_some(),
            predictive: self.predictive.is_some(),
            baseline_ready: self
                .predictive
                .as_ref()
                .map(PredictiveProcessor::baseline_ready),
        }
    }
}

/// Snapshot of which sub-processors are enabled, surfaced by the health
/// loop.
#[derive(Clone, Copy, Debug)]
pub struct AnalyticsStatus {
    pub oee: bool,
    pub energy: bool,
    pub energy_kpis: bool,
    pub predictive: bool,
    pub baseline_ready: Option<bool>,
}
