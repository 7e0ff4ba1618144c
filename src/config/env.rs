//! Environment-variable overrides, applied after YAML parse and before
//! validation.
//!
//! Recognised variables:
//! - `OPCUA_SERVER_URL` replaces every asset's endpoint (single-server
//!   deployments and test rigs);
//! - `OPCUA_SECURITY_POLICY` forces the policy on every asset;
//! - `OPCUA_CONNECTION_TIMEOUT` in (float) seconds;
//! - `NODE_ID_<ASSET>_<TAG>=<node_id>` per-(asset, tag) overrides. Env
//!   names are conventionally uppercase, so asset/tag matching is
//!   ASCII-case-insensitive.

use tracing::{debug, info, warn};

use super::{BridgeConfig, SecuritySettings};

pub const SERVER_URL: &str = "OPCUA_SERVER_URL";
pub const SECURITY_POLICY: &str = "OPCUA_SECURITY_POLICY";
pub const CONNECTION_TIMEOUT: &str = "OPCUA_CONNECTION_TIMEOUT";
pub const NODE_ID_PREFIX: &str = "NODE_ID_";

pub fn apply_overrides(
    config: &mut BridgeConfig,
    vars: impl IntoIterator<Item = (String, String)>,
) {
    let mut node_overrides: Vec<(String, String, String)> = Vec::new();

    for (name, value) in vars {
        match name.as_str() {
            SERVER_URL => {
                info!(message = "Overriding OPC UA endpoint for all assets.", url = %value);
                for_each_asset(config, |asset| asset.opcua_endpoint = value.clone());
            }
            SECURITY_POLICY => {
                info!(message = "Overriding security policy for all assets.", policy = %value);
                for_each_asset(config, |asset| {
                    asset
                        .security_settings
                        .get_or_insert_with(SecuritySettings::default)
                        .security_policy = Some(value.clone());
                });
            }
            CONNECTION_TIMEOUT => match value.parse::<f64>() {
                Ok(timeout) if timeout > 0.0 => {
                    info!(message = "Overriding connection timeout.", seconds = timeout);
                    config.global_settings.connection_timeout = timeout;
                }
                _ => {
                    warn!(message = "Ignoring invalid connection timeout override.", value = %value);
                }
            },
            _ => {
                if let Some(rest) = name.strip_prefix(NODE_ID_PREFIX) {
                    if let Some((asset, tag)) = rest.split_once('_') {
                        node_overrides.push((asset.to_owned(), tag.to_owned(), value));
                    } else {
                        warn!(message = "Malformed node id override.", variable = %name);
                    }
                }
            }
        }
    }

    if node_overrides.is_empty() {
        return;
    }
    info!(
        message = "Applying node id overrides.",
        count = node_overrides.len()
    );
    for (asset_name, tag_name, node_id) in node_overrides {
        let mut matched = false;
        for_each_asset(config, |asset| {
            if !asset.asset_name.eq_ignore_ascii_case(&asset_name) {
                return;
            }
            let key = asset
                .node_mapping
                .keys()
                .find(|k| k.eq_ignore_ascii_case(&tag_name))
                .cloned();
            if let Some(key) = key {
                debug!(
                    message = "Node id overridden.",
                    asset = %asset.asset_name,
                    tag = %key,
                    node_id = %node_id
                );
                asset.node_mapping.insert(key, node_id.clone());
                matched = true;
            }
        });
        if !matched {
            warn!(
                message = "Node id override matched no configured tag.",
                asset = %asset_name,
                tag = %tag_name
            );
        }
    }
}

fn for_each_asset(config: &mut BridgeConfig, mut f: impl FnMut(&mut super::AssetConfig)) {
    for site in &mut config.sites {
        for asset in &mut site.assets {
            f(asset);
        }
    }
}
