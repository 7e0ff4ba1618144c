//! Typed configuration: enterprise → sites → assets with their tag/node
//! mappings and per-asset analytics settings, loaded from YAML with
//! environment overrides applied on top.

pub mod env;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::event::Hierarchy;

/// Env var naming the YAML document; the long-running process takes no
/// CLI flags.
pub const CONFIG_PATH_ENV: &str = "OPCUA_BRIDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "use_case_config.yaml";

const DEFAULT_NAMESPACE_URI: &str = "http://globalcorp.com/opcua/simulation";

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Unable to read configuration file {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Configuration is not valid YAML: {source}"))]
    Parse { source: serde_yaml::Error },
    #[snafu(display("Configuration has no sites"))]
    NoSites,
    #[snafu(display("Site {site} has no assets"))]
    NoAssets { site: String },
    #[snafu(display("Asset name {asset} appears more than once"))]
    DuplicateAsset { asset: String },
    #[snafu(display("Asset {asset} has an empty node_mapping"))]
    EmptyNodeMapping { asset: String },
    #[snafu(display(
        "Asset {asset} references tag {tag} in {section} but it is missing from node_mapping"
    ))]
    UnmappedTag {
        asset: String,
        tag: String,
        section: &'static str,
    },
    #[snafu(display("Asset {asset} metadata is missing the {key} hierarchy level"))]
    MissingHierarchy { asset: String, key: &'static str },
}

#[derive(Clone, Debug, Deserialize)]
pub struct BridgeConfig {
    pub enterprise_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SiteConfig {
    pub site_name: String,
    pub enterprise: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AssetConfig {
    pub asset_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub opcua_endpoint: String,
    #[serde(default)]
    pub node_mapping: IndexMap<String, String>,
    #[serde(default)]
    pub oee_monitoring: Option<OeeConfig>,
    #[serde(default)]
    pub energy_monitoring: Option<EnergyConfig>,
    #[serde(default)]
    pub energy_analytics: Option<EnergyAnalyticsConfig>,
    #[serde(default)]
    pub predictive_maintenance: Option<PredictiveConfig>,
    #[serde(default)]
    pub security_settings: Option<SecuritySettings>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AssetConfig {
    /// The five-level hierarchy stamped onto every sample from this asset.
    /// Validation guarantees the metadata levels are present.
    pub fn hierarchy(&self, site: &SiteConfig) -> Hierarchy {
        let level = |key: &str| self.metadata.get(key).cloned().unwrap_or_default();
        Hierarchy {
            enterprise: site.enterprise.clone(),
            site: level("site"),
            area: level("area"),
            line: level("line"),
            machine: self.asset_name.clone(),
        }
    }

    /// Tags referenced by any analytics sub-config, with the section that
    /// references them; used to validate the node mapping is total.
    fn referenced_tags(&self) -> Vec<(&str, &'static str)> {
        let mut tags = Vec::new();
        if let Some(oee) = &self.oee_monitoring {
            for tag in oee
                .availability_tags
                .iter()
                .chain(oee.performance_tags.iter())
                .chain(oee.quality_tags.iter())
                .chain(oee.cycle_count_tag.iter())
                .chain(oee.production_rate_tag.iter())
            {
                tags.push((tag.as_str(), "oee_monitoring"));
            }
        }
        if let Some(energy) = &self.energy_monitoring {
            for tag in energy
                .power_tags
                .iter()
                .chain(energy.energy_tags.iter())
                .chain(energy.voltage_tags.iter())
                .chain(energy.current_tags.iter())
            {
                tags.push((tag.as_str(), "energy_monitoring"));
            }
        }
        if let Some(kpis) = &self.energy_analytics {
            for tag in kpis
                .renewable_tags
                .iter()
                .chain(kpis.battery_tags.iter())
                .chain(kpis.load_tags.iter())
                .chain(kpis.efficiency_tags.iter())
            {
                tags.push((tag.as_str(), "energy_analytics"));
            }
        }
        if let Some(predictive) = &self.predictive_maintenance {
            for tag in predictive
                .vibration_tags
                .iter()
                .chain(predictive.temperature_tags.iter())
                .chain(predictive.pressure_tags.iter())
            {
                tags.push((tag.as_str(), "predictive_maintenance"));
            }
            for tag in predictive.maintenance_thresholds.keys() {
                tags.push((tag.as_str(), "predictive_maintenance"));
            }
        }
        tags
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct OeeConfig {
    #[serde(default)]
    pub availability_tags: Vec<String>,
    #[serde(default)]
    pub performance_tags: Vec<String>,
    #[serde(default)]
    pub quality_tags: Vec<String>,
    #[serde(default)]
    pub cycle_count_tag: Option<String>,
    #[serde(default)]
    pub production_rate_tag: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EnergyConfig {
    #[serde(default)]
    pub power_tags: Vec<String>,
    #[serde(default)]
    pub energy_tags: Vec<String>,
    #[serde(default)]
    pub voltage_tags: Vec<String>,
    #[serde(default)]
    pub current_tags: Vec<String>,
    /// Seconds between aggregation ticks.
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EnergyAnalyticsConfig {
    #[serde(default)]
    pub renewable_tags: Vec<String>,
    #[serde(default)]
    pub battery_tags: Vec<String>,
    #[serde(default)]
    pub load_tags: Vec<String>,
    #[serde(default)]
    pub efficiency_tags: Vec<String>,
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PredictiveConfig {
    #[serde(default)]
    pub vibration_tags: Vec<String>,
    #[serde(default)]
    pub temperature_tags: Vec<String>,
    #[serde(default)]
    pub pressure_tags: Vec<String>,
    #[serde(default)]
    pub maintenance_thresholds: BTreeMap<String, f64>,
    /// Hours, echoed into anomaly records.
    #[serde(default = "default_prediction_horizon")]
    pub prediction_horizon: u32,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub security_policy: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Seconds; applies to field-session establishment.
    pub connection_timeout: f64,
    /// Consecutive connect failures before an asset is quarantined.
    pub retry_attempts: u32,
    /// Seconds; the exponential backoff base.
    pub retry_delay: f64,
    /// Forces the security policy for every asset when set.
    pub security_policy: Option<String>,
    pub namespace_uri: String,
    pub buffer: BufferSettings,
    pub upload: UploadSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            connection_timeout: 10.0,
            retry_attempts: 5,
            retry_delay: 1.0,
            security_policy: None,
            namespace_uri: DEFAULT_NAMESPACE_URI.to_owned(),
            buffer: BufferSettings::default(),
            upload: UploadSettings::default(),
        }
    }
}

impl GlobalSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub path: PathBuf,
    pub max_size_mb: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("edge_buffer.db"),
            max_size_mb: 200,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub send_interval_secs: u64,
    pub batch_size: usize,
    pub analytics_batch_size: usize,
    pub max_retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub measurement_prefix: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            send_interval_secs: 30,
            batch_size: 100,
            analytics_batch_size: 50,
            max_retry_attempts: 3,
            retry_delay_secs: 5,
            measurement_prefix: "opcua".to_owned(),
        }
    }
}

fn default_version() -> String {
    "1.0.0".to_owned()
}

fn default_aggregation_interval() -> u64 {
    300
}

fn default_prediction_horizon() -> u32 {
    24
}

/// Loads, applies env overrides, and validates in one step.
pub fn load(path: impl AsRef<Path>) -> Result<BridgeConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).context(ReadSnafu { path })?;
    let mut config: BridgeConfig = serde_yaml::from_str(&raw).context(ParseSnafu)?;
    env::apply_overrides(&mut config, std::env::vars());
    validate(&config)?;
    Ok(config)
}

/// Structural validation; all failures here are fatal at startup.
pub fn validate(config: &BridgeConfig) -> Result<(), ConfigError> {
    if config.sites.is_empty() {
        return Err(ConfigError::NoSites);
    }

    let mut seen = BTreeSet::new();
    for site in &config.sites {
        if site.assets.is_empty() {
            return Err(ConfigError::NoAssets {
                site: site.site_name.clone(),
            });
        }
        for asset in &site.assets {
            if !seen.insert(asset.asset_name.clone()) {
                return Err(ConfigError::DuplicateAsset {
                    asset: asset.asset_name.clone(),
                });
            }
            if asset.node_mapping.is_empty() {
                return Err(ConfigError::EmptyNodeMapping {
                    asset: asset.asset_name.clone(),
                });
            }
            for key in ["site", "area", "line"] {
                if !asset.metadata.contains_key(key) {
                    return Err(ConfigError::MissingHierarchy {
                        asset: asset.asset_name.clone(),
                        key,
                    });
                }
            }
            for (tag, section) in asset.referenced_tags() {
                if !asset.node_mapping.contains_key(tag) {
                    return Err(ConfigError::UnmappedTag {
                        asset: asset.asset_name.clone(),
                        tag: tag.to_owned(),
                        section,
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
enterprise_name: GlobalCorp
version: "2.1"
sites:
  - site_name: Plant-North
    enterprise: GlobalCorp
    assets:
      - asset_name: Press01
        opcua_endpoint: "opc.tcp://10.0.0.5:4840"
        node_mapping:
          MotorStatus: "2001"
          MotorSpeed: "ns=2;i=2002"
          BearingVib: "Press01.Bearing.Vibration"
        oee_monitoring:
          availability_tags: [MotorStatus]
          performance_tags: [MotorSpeed]
        predictive_maintenance:
          vibration_tags: [BearingVib]
          maintenance_thresholds:
            BearingVib: 5.0
        metadata:
          site: Plant-North
          area: Stamping
          line: Line-1
global_settings:
  connection_timeout: 7.5
  retry_attempts: 4
"#;

    #[test]
    fn parses_and_validates_sample_document() {
        let config: BridgeConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.enterprise_name, "GlobalCorp");
        assert_eq!(config.global_settings.connection_timeout, 7.5);
        assert_eq!(config.global_settings.retry_attempts, 4);
        // Unspecified settings keep their defaults.
        assert_eq!(config.global_settings.upload.batch_size, 100);
        assert_eq!(config.global_settings.buffer.max_size_mb, 200);

        let asset = &config.sites[0].assets[0];
        let hierarchy = asset.hierarchy(&config.sites[0]);
        assert_eq!(hierarchy.machine, "Press01");
        assert_eq!(hierarchy.area, "Stamping");
    }

    #[test]
    fn unmapped_sub_config_tag_is_fatal() {
        let mut config: BridgeConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        config.sites[0].assets[0]
            .oee_monitoring
            .as_mut()
            .unwrap()
            .quality_tags
            .push("MissingTag".into());
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, ConfigError::UnmappedTag { ref tag, .. } if tag == "MissingTag"));
    }

    #[test]
    fn threshold_only_tags_must_be_mapped_too() {
        let mut config: BridgeConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        config.sites[0].assets[0]
            .predictive_maintenance
            .as_mut()
            .unwrap()
            .maintenance_thresholds
            .insert("GhostTag".into(), 1.0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn missing_hierarchy_metadata_is_fatal() {
        let mut config: BridgeConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        config.sites[0].assets[0].metadata.remove("line");
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingHierarchy { key: "line", .. }));
    }

    #[test]
    fn duplicate_asset_names_are_fatal() {
        let mut config: BridgeConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        let dup = config.sites[0].assets[0].clone();
        config.sites[0].assets.push(dup);
        assert!(matches!(
            validate(&config).unwrap_err(),
            ConfigError::DuplicateAsset { .. }
        ));
    }

    #[test]
    fn empty_sites_are_fatal() {
        let config: BridgeConfig =
            serde_yaml::from_str("enterprise_name: X\nsites: []\n").unwrap();
        assert!(matches!(validate(&config).unwrap_err(), ConfigError::NoSites));
    }
}
