//! Shared doubles for the integration tests: a scripted field transport
//! and a controllable remote store.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::mpsc;

use opcua_bridge::config::{
    AssetConfig, BridgeConfig, GlobalSettings, OeeConfig, SiteConfig, UploadSettings,
};
use opcua_bridge::event::{Quality, Value};
use opcua_bridge::sinks::influxdb::client::{InfluxSink, SinkError};
use opcua_bridge::sinks::influxdb::encoder::Point;
use opcua_bridge::sources::opcua::transport::{
    EndpointProfile, FieldConnector, FieldSession, NodeRef, SecurityProfile, SubscribeOutcome,
    TagHandle, TransportError, ValueChange,
};

/// Transport whose sessions deliver a scripted burst of data changes on
/// subscribe and then stay quiet but alive.
pub struct StreamingConnector {
    changes: Vec<ValueChange>,
}

impl StreamingConnector {
    pub fn new(changes: Vec<ValueChange>) -> Self {
        Self { changes }
    }

    pub fn running_samples(count: usize) -> Self {
        let changes = (0..count)
            .map(|_| ValueChange {
                handle: TagHandle(0),
                value: Value::String("running".into()),
                quality: Some(Quality::Good),
                server_timestamp: None,
            })
            .collect();
        Self::new(changes)
    }
}

#[async_trait]
impl FieldConnector for StreamingConnector {
    async fn endpoints(
        &self,
        _endpoint_url: &str,
        _timeout: Duration,
    ) -> Result<Vec<EndpointProfile>, TransportError> {
        Ok(vec![])
    }

    async fn connect(
        &self,
        _endpoint_url: &str,
        _security: &SecurityProfile,
        _timeout: Duration,
    ) -> Result<Box<dyn FieldSession>, TransportError> {
        Ok(Box::new(StreamingSession {
            changes: self.changes.clone(),
            held: None,
        }))
    }
}

struct StreamingSession {
    changes: Vec<ValueChange>,
    held: Option<mpsc::Sender<ValueChange>>,
}

#[async_trait]
impl FieldSession for StreamingSession {
    async fn namespace_index(&self, _uri: &str) -> Result<u16, TransportError> {
        Ok(2)
    }

    async fn namespace_array(&self) -> Result<Vec<String>, TransportError> {
        Ok(vec!["urn:test".to_owned()])
    }

    async fn subscribe(
        &mut self,
        _publishing_interval: Duration,
        items: &[(TagHandle, NodeRef)],
        channel_capacity: usize,
    ) -> Result<(SubscribeOutcome, mpsc::Receiver<ValueChange>), TransportError> {
        let (tx, rx) = mpsc::channel(channel_capacity.max(self.changes.len() + 1));
        for change in &self.changes {
            let _ = tx.try_send(change.clone());
        }
        self.held = Some(tx);
        Ok((
            SubscribeOutcome {
                subscribed: items.len(),
                failed: vec![],
            },
            rx,
        ))
    }

    async fn disconnect(&mut self) {
        self.held = None;
    }
}

/// Remote store double whose availability can be flipped mid-test.
pub struct ControlledSink {
    healthy: AtomicBool,
    /// Remaining pings to serve before flipping unhealthy; `usize::MAX`
    /// disables the auto-off.
    auto_off_pings: AtomicUsize,
    points: Mutex<Vec<Point>>,
}

impl ControlledSink {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            auto_off_pings: AtomicUsize::new(usize::MAX),
            points: Mutex::new(Vec::new()),
        }
    }

    /// Healthy for exactly `pings` liveness probes (enough to pass the
    /// startup check), then offline until [`ControlledSink::set_healthy`].
    pub fn healthy_for_pings(pings: usize) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            auto_off_pings: AtomicUsize::new(pings),
            points: Mutex::new(Vec::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.auto_off_pings.store(usize::MAX, Ordering::SeqCst);
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }

    pub fn telemetry_count(&self) -> usize {
        self.points()
            .iter()
            .filter(|p| p.measurement.ends_with("_telemetry"))
            .count()
    }

    pub fn analytics_count(&self) -> usize {
        self.points()
            .iter()
            .filter(|p| p.measurement.ends_with("_analytics"))
            .count()
    }
}

#[async_trait]
impl InfluxSink for ControlledSink {
    async fn ping(&self) -> Result<(), SinkError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected {
                status: 503,
                body: "store offline".to_owned(),
            });
        }
        let remaining = self.auto_off_pings.load(Ordering::SeqCst);
        if remaining != usize::MAX {
            if remaining <= 1 {
                self.healthy.store(false, Ordering::SeqCst);
            }
            self.auto_off_pings
                .store(remaining.saturating_sub(1), Ordering::SeqCst);
        }
        Ok(())
    }

    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        if self.healthy.load(Ordering::SeqCst) {
            self.points.lock().unwrap().extend_from_slice(points);
            Ok(())
        } else {
            Err(SinkError::Rejected {
                status: 503,
                body: "store offline".to_owned(),
            })
        }
    }
}

/// One-asset config with OEE on `MotorStatus`, tuned for fast tests: a
/// one-second upload interval and no retry delay.
pub fn test_config(buffer_path: PathBuf) -> BridgeConfig {
    let asset = AssetConfig {
        asset_name: "Press01".into(),
        description: None,
        opcua_endpoint: "opc.tcp://127.0.0.1:4840".into(),
        node_mapping: IndexMap::from([("MotorStatus".to_owned(), "2001".to_owned())]),
        oee_monitoring: Some(OeeConfig {
            availability_tags: vec!["MotorStatus".into()],
            performance_tags: vec![],
            quality_tags: vec![],
            cycle_count_tag: None,
            production_rate_tag: None,
        }),
        energy_monitoring: None,
        energy_analytics: None,
        predictive_maintenance: None,
        security_settings: None,
        metadata: BTreeMap::from([
            ("site".to_owned(), "Plant-North".to_owned()),
            ("area".to_owned(), "Stamping".to_owned()),
            ("line".to_owned(), "Line-1".to_owned()),
        ]),
    };

    let mut globals = GlobalSettings::default();
    globals.security_policy = Some("None".to_owned());
    globals.buffer.path = buffer_path;
    globals.buffer.max_size_mb = 50;
    globals.upload = UploadSettings {
        send_interval_secs: 1,
        batch_size: 100,
        analytics_batch_size: 50,
        max_retry_attempts: 1,
        retry_delay_secs: 0,
        measurement_prefix: "opcua".to_owned(),
    };

    BridgeConfig {
        enterprise_name: "GlobalCorp".into(),
        version: "1.0.0".into(),
        sites: vec![SiteConfig {
            site_name: "Plant-North".into(),
            enterprise: "GlobalCorp".into(),
            description: None,
            assets: vec![asset],
        }],
        global_settings: globals,
    }
}

/// Polls until `check` passes or the deadline elapses.
pub async fn wait_for(mut check: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
