//! Security policy resolution for field sessions: explicit per-asset
//! override, then the global/environment override, then negotiation with
//! the server over a throwaway unsecured exchange.

use std::time::Duration;

use tracing::{info, warn};

use super::transport::{FieldConnector, SecurityPolicy};
use crate::config::AssetConfig;

/// Resolves the effective policy for one asset. Negotiation preference
/// order is Basic256Sha256, then Basic128Rsa15, then None; failures to
/// negotiate fall back to an unsecured session rather than blocking the
/// asset.
pub async fn resolve_policy(
    connector: &dyn FieldConnector,
    asset: &AssetConfig,
    global_policy: Option<&str>,
    timeout: Duration,
) -> SecurityPolicy {
    let explicit = asset
        .security_settings
        .as_ref()
        .and_then(|settings| settings.security_policy.as_deref())
        .or(global_policy);

    if let Some(raw) = explicit {
        match raw.parse() {
            Ok(policy) => return policy,
            Err(_) => {
                warn!(
                    message = "Configured security policy is unknown; negotiating instead.",
                    asset = %asset.asset_name,
                    policy = raw
                );
            }
        }
    }

    negotiate(connector, &asset.opcua_endpoint, timeout).await
}

async fn negotiate(
    connector: &dyn FieldConnector,
    endpoint: &str,
    timeout: Duration,
) -> SecurityPolicy {
    let endpoints = match connector.endpoints(endpoint, timeout).await {
        Ok(endpoints) => endpoints,
        Err(error) => {
            warn!(
                message = "Security negotiation failed; using unsecured session.",
                endpoint,
                %error
            );
            return SecurityPolicy::None;
        }
    };

    let mut chosen = SecurityPolicy::None;
    for profile in &endpoints {
        if profile.security_policy_uri.contains("Basic256Sha256") {
            chosen = SecurityPolicy::Basic256Sha256;
            break;
        }
        if profile.security_policy_uri.contains("Basic128Rsa15") {
            chosen = SecurityPolicy::Basic128Rsa15;
        }
    }

    if chosen == SecurityPolicy::None {
        warn!(
            message = "No compatible security policy advertised; using unsecured session.",
            endpoint
        );
    } else {
        info!(message = "Negotiated security policy.", endpoint, policy = chosen.as_str());
    }
    chosen
}
