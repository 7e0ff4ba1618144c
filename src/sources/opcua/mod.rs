//! Field collector: one long-lived secure subscription session per
//! configured asset, supervised with exponential backoff and quarantine.
//! Each session task owns its asset's analytics state and a write handle
//! onto the durable buffer; samples flow through both synchronously, so
//! buffer pressure is the only backpressure valve.

#[cfg(feature = "transport-opcua")]
pub mod adapter;
pub mod security;
pub mod transport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::AssetAnalytics;
use crate::buffer::DurableBuffer;
use crate::config::{AssetConfig, GlobalSettings, SiteConfig};
use crate::event::{Hierarchy, Quality, Sample};
use transport::{
    FieldConnector, FieldSession, IdentityProvider, NodeRef, SecurityProfile, TagHandle,
    TransportError, ValueChange,
};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const PUBLISHING_INTERVAL: Duration = Duration::from_secs(1);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct CollectorSettings {
    pub connection_timeout: Duration,
    pub max_retry_attempts: u32,
    pub base_retry_delay: Duration,
    pub namespace_uri: String,
    pub security_policy: Option<String>,
    pub trust_store: Option<PathBuf>,
    pub publishing_interval: Duration,
    pub liveness_interval: Duration,
}

impl CollectorSettings {
    pub fn from_config(global: &GlobalSettings) -> Self {
        Self {
            connection_timeout: global.connection_timeout(),
            max_retry_attempts: global.retry_attempts,
            base_retry_delay: global.retry_base_delay(),
            namespace_uri: global.namespace_uri.clone(),
            security_policy: global.security_policy.clone(),
            trust_store: None,
            publishing_interval: PUBLISHING_INTERVAL,
            liveness_interval: LIVENESS_INTERVAL,
        }
    }
}

/// Where an asset's session currently stands, as seen by the health loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Connecting,
    Connected,
    Backoff,
    Quarantined,
    Stopped,
}

/// Shared read view of every asset's session state. Written only by the
/// owning collector tasks.
#[derive(Default)]
pub struct CollectorHealth {
    states: Mutex<HashMap<String, SessionState>>,
}

impl CollectorHealth {
    fn set(&self, asset: &str, state: SessionState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(asset.to_owned(), state);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, SessionState> {
        self.states
            .lock()
            .map(|states| states.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, state: SessionState) -> usize {
        self.snapshot().values().filter(|s| **s == state).count()
    }
}

enum SessionOutcome {
    /// Shutdown requested; the supervisor exits.
    Cancelled,
    /// The session was up and then lost (probe failure, channel close).
    Ended(&'static str),
    /// Session establishment failed; counts toward quarantine.
    Failed(TransportError),
}

/// Supervises one asset: connect, subscribe, pump notifications, and on
/// loss re-enter the backoff path until quarantined or cancelled.
pub struct AssetCollector {
    asset: AssetConfig,
    hierarchy: Hierarchy,
    connector: Arc<dyn FieldConnector>,
    identity: Arc<dyn IdentityProvider>,
    buffer: DurableBuffer,
    analytics: AssetAnalytics,
    settings: CollectorSettings,
    health: Arc<CollectorHealth>,
}

impl AssetCollector {
    pub fn new(
        asset: AssetConfig,
        site: &SiteConfig,
        connector: Arc<dyn FieldConnector>,
        identity: Arc<dyn IdentityProvider>,
        buffer: DurableBuffer,
        settings: CollectorSettings,
        health: Arc<CollectorHealth>,
    ) -> Self {
        let hierarchy = asset.hierarchy(site);
        let analytics = AssetAnalytics::new(&asset);
        Self {
            asset,
            hierarchy,
            connector,
            identity,
            buffer,
            analytics,
            settings,
            health,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let asset_name = self.asset.asset_name.clone();
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                self.health.set(&asset_name, SessionState::Stopped);
                return;
            }

            self.health.set(&asset_name, SessionState::Connecting);
            let delay_exponent = match self.run_session(&shutdown).await {
                SessionOutcome::Cancelled => {
                    self.health.set(&asset_name, SessionState::Stopped);
                    return;
                }
                SessionOutcome::Ended(reason) => {
                    info!(
                        message = "Field session lost; re-entering backoff.",
                        asset = %asset_name,
                        reason
                    );
                    attempt = 0;
                    0
                }
                SessionOutcome::Failed(error) => {
                    warn!(
                        message = "Field session establishment failed.",
                        asset = %asset_name,
                        attempt = attempt + 1,
                        %error
                    );
                    let exponent = attempt;
                    attempt += 1;
                    exponent
                }
            };

            if attempt >= self.settings.max_retry_attempts {
                warn!(
                    message = "Asset quarantined after exhausting reconnect budget; \
                               no further attempts until restart.",
                    asset = %asset_name,
                    attempts = attempt
                );
                counter!("collector_quarantined_total").increment(1);
                self.health.set(&asset_name, SessionState::Quarantined);
                return;
            }

            let delay = backoff_delay(self.settings.base_retry_delay, delay_exponent);
            debug!(
                message = "Backing off before reconnect.",
                asset = %asset_name,
                delay_ms = delay.as_millis() as u64
            );
            self.health.set(&asset_name, SessionState::Backoff);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.health.set(&asset_name, SessionState::Stopped);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(&mut self, shutdown: &CancellationToken) -> SessionOutcome {
        let policy = security::resolve_policy(
            self.connector.as_ref(),
            &self.asset,
            self.settings.security_policy.as_deref(),
            self.settings.connection_timeout,
        )
        .await;

        let mut profile = SecurityProfile {
            policy,
            identity: None,
            trust_store: self.settings.trust_store.clone(),
        };
        if policy.is_secure() {
            match self.identity.ensure_identity() {
                Ok(identity) => profile.identity = Some(identity),
                Err(error) => return SessionOutcome::Failed(error),
            }
        }

        let mut session = match self
            .connector
            .connect(
                &self.asset.opcua_endpoint,
                &profile,
                self.settings.connection_timeout,
            )
            .await
        {
            Ok(session) => session,
            Err(error) => return SessionOutcome::Failed(error),
        };

        let namespace = match session.namespace_index(&self.settings.namespace_uri).await {
            Ok(namespace) => namespace,
            Err(error) => {
                session.disconnect().await;
                return SessionOutcome::Failed(error);
            }
        };

        // Tag order fixes the handle space: handle i is node_mapping[i].
        let tags: Vec<String> = self.asset.node_mapping.keys().cloned().collect();
        let items: Vec<(TagHandle, NodeRef)> = self
            .asset
            .node_mapping
            .values()
            .enumerate()
            .map(|(i, raw)| (TagHandle(i as u32), NodeRef::resolve(raw, namespace)))
            .collect();

        let (outcome, mut notifications) = match session
            .subscribe(
                self.settings.publishing_interval,
                &items,
                NOTIFICATION_CHANNEL_CAPACITY,
            )
            .await
        {
            Ok(result) => result,
            Err(error) => {
                session.disconnect().await;
                return SessionOutcome::Failed(error);
            }
        };

        for handle in &outcome.failed {
            warn!(
                message = "Tag subscription failed; continuing with reduced set.",
                asset = %self.asset.asset_name,
                tag = tags.get(handle.0 as usize).map(String::as_str).unwrap_or("?")
            );
        }
        if outcome.subscribed == 0 {
            session.disconnect().await;
            return SessionOutcome::Failed(TransportError::Subscribe {
                message: "no tags could be subscribed".to_owned(),
            });
        }

        info!(
            message = "Asset connected and subscribed.",
            asset = %self.asset.asset_name,
            policy = policy.as_str(),
            tags = outcome.subscribed
        );
        self.health
            .set(&self.asset.asset_name, SessionState::Connected);

        let mut liveness = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.liveness_interval,
            self.settings.liveness_interval,
        );
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    session.disconnect().await;
                    return SessionOutcome::Cancelled;
                }
                change = notifications.recv() => match change {
                    Some(change) => self.handle_change(change, &tags).await,
                    None => {
                        session.disconnect().await;
                        return SessionOutcome::Ended("notification channel closed");
                    }
                },
                _ = liveness.tick() => {
                    if let Err(error) = session.namespace_array().await {
                        warn!(
                            message = "Liveness probe failed; tearing session down.",
                            asset = %self.asset.asset_name,
                            %error
                        );
                        session.disconnect().await;
                        return SessionOutcome::Ended("liveness probe failed");
                    }
                }
            }
        }
    }

    async fn handle_change(&mut self, change: ValueChange, tags: &[String]) {
        let Some(tag) = tags.get(change.handle.0 as usize) else {
            warn!(
                message = "Notification for unknown tag handle dropped.",
                asset = %self.asset.asset_name,
                handle = change.handle.0
            );
            return;
        };

        let sample = Sample {
            timestamp: Utc::now(),
            hierarchy: self.hierarchy.clone(),
            tag: tag.clone(),
            value: change.value,
            unit: None,
            quality: change.quality.unwrap_or(Quality::Good),
        };
        counter!("samples_received_total").increment(1);

        let records = self.analytics.process(&sample);

        if let Err(error) = self.buffer.append_sample(&sample, None).await {
            // Lossy but never fatal: the sample is gone, the session lives.
            error!(
                message = "Buffer append failed; sample lost.",
                asset = %self.asset.asset_name,
                tag = %sample.tag,
                %error
            );
            counter!("buffer_append_failures_total").increment(1);
        }
        for record in records {
            if let Err(error) = self.buffer.append_analytics(&record, None).await {
                error!(
                    message = "Buffer append failed; analytics record lost.",
                    asset = %self.asset.asset_name,
                    category = record.category(),
                    %error
                );
                counter!("buffer_append_failures_total").increment(1);
            }
        }
    }
}

/// `min(base * 2^attempt, 60s)` plus 10-30% jitter.
fn backoff_delay(base: Duration, exponent: u32) -> Duration {
    let scaled = base.saturating_mul(2u32.saturating_pow(exponent.min(16)));
    let capped = scaled.min(MAX_RETRY_DELAY);
    let jitter = capped.mul_f64(rand::rng().random_range(0.1..0.3));
    capped + jitter
}

/// Identity provider for unsecured deployments; secure policies must be
/// paired with a real provider.
pub struct NoIdentity;

impl IdentityProvider for NoIdentity {
    fn ensure_identity(&self) -> Result<transport::ClientIdentity, TransportError> {
        Err(TransportError::Identity {
            message: "no client identity provider configured".to_owned(),
        })
    }
}
