//! `async-opcua` implementation of the transport contract. This is the
//! only module that sees wire types; everything else talks to the
//! [`FieldConnector`]/[`FieldSession`] traits.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opcua::client::{Client, ClientBuilder, DataChangeCallback, IdentityToken, Session};
use opcua::types::{
    AttributeId, DataValue, EndpointDescription, MessageSecurityMode, MonitoredItemCreateRequest,
    MonitoringMode, MonitoringParameters, NodeId, ReadValueId, TimestampsToReturn, UAString,
    VariableId, Variant,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::transport::{
    ClientIdentity, EndpointProfile, FieldConnector, FieldSession, IdentityProvider, NodeRef,
    SecurityPolicy, SecurityProfile, SubscribeOutcome, TagHandle, TransportError, ValueChange,
};
use crate::event::{Quality, Value};

const APPLICATION_NAME: &str = "opcua-bridge";
const APPLICATION_URI: &str = "urn:opcua-bridge";
const SUBSCRIPTION_LIFETIME_COUNT: u32 = 100;
const SUBSCRIPTION_KEEP_ALIVE_COUNT: u32 = 10;
const SUBSCRIPTION_PRIORITY: u8 = 0;
const MONITORED_ITEM_QUEUE_SIZE: u32 = 10;

fn policy_uri(policy: SecurityPolicy) -> &'static str {
    match policy {
        SecurityPolicy::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
        SecurityPolicy::Basic128Rsa15 => {
            "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15"
        }
        SecurityPolicy::Basic256Sha256 => {
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
        }
    }
}

fn security_mode(policy: SecurityPolicy) -> MessageSecurityMode {
    if policy.is_secure() {
        MessageSecurityMode::SignAndEncrypt
    } else {
        MessageSecurityMode::None
    }
}

fn connect_error(endpoint: &str, error: impl std::fmt::Display) -> TransportError {
    TransportError::Connect {
        endpoint: endpoint.to_owned(),
        message: error.to_string(),
    }
}

/// Connector backed by the `async-opcua` client stack. Each `connect`
/// builds a fresh client so per-asset sessions stay isolated.
pub struct OpcuaConnector {
    pki_dir: PathBuf,
}

impl OpcuaConnector {
    pub fn new(pki_dir: PathBuf) -> Self {
        Self { pki_dir }
    }

    fn build_client(&self) -> Client {
        let config = ClientBuilder::new()
            .application_name(APPLICATION_NAME)
            .application_uri(APPLICATION_URI)
            .pki_dir(self.pki_dir.clone())
            // A self-signed 2048-bit RSA pair with a one-year validity is
            // generated under the PKI dir when none exists yet.
            .create_sample_keypair(true)
            .trust_server_certs(true)
            .session_retry_limit(0)
            .config();
        Client::new(config)
    }
}

#[async_trait]
impl FieldConnector for OpcuaConnector {
    async fn endpoints(
        &self,
        endpoint_url: &str,
        timeout: Duration,
    ) -> Result<Vec<EndpointProfile>, TransportError> {
        let mut client = self.build_client();
        let endpoints = tokio::time::timeout(
            timeout,
            client.get_server_endpoints_from_url(endpoint_url),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            endpoint: endpoint_url.to_owned(),
        })?
        .map_err(|status| TransportError::Discovery {
            endpoint: endpoint_url.to_owned(),
            message: status.to_string(),
        })?;

        Ok(endpoints
            .into_iter()
            .map(|endpoint: EndpointDescription| EndpointProfile {
                security_policy_uri: endpoint.security_policy_uri.to_string(),
                security_mode: format!("{:?}", endpoint.security_mode),
            })
            .collect())
    }

    async fn connect(
        &self,
        endpoint_url: &str,
        security: &SecurityProfile,
        timeout: Duration,
    ) -> Result<Box<dyn FieldSession>, TransportError> {
        let mut client = self.build_client();

        let endpoint = EndpointDescription {
            endpoint_url: UAString::from(endpoint_url),
            security_policy_uri: UAString::from(policy_uri(security.policy)),
            security_mode: security_mode(security.policy),
            ..Default::default()
        };

        // Certificate-based user identity on secure sessions, anonymous
        // otherwise.
        let identity_token = match (&security.identity, security.policy.is_secure()) {
            (Some(identity), true) => {
                IdentityToken::X509(identity.cert_path.clone(), identity.key_path.clone())
            }
            _ => IdentityToken::Anonymous,
        };

        let (session, event_loop) = tokio::time::timeout(
            timeout,
            client.connect_to_matching_endpoint(endpoint, identity_token),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            endpoint: endpoint_url.to_owned(),
        })?
        .map_err(|status| connect_error(endpoint_url, status))?;

        let event_loop_handle = event_loop.spawn();
        if !tokio::time::timeout(timeout, session.wait_for_connection())
            .await
            .unwrap_or(false)
        {
            event_loop_handle.abort();
            return Err(TransportError::Timeout {
                endpoint: endpoint_url.to_owned(),
            });
        }

        debug!(message = "Field session established.", endpoint = endpoint_url);
        Ok(Box::new(OpcuaSession {
            session,
            event_loop_handle: Some(event_loop_handle),
        }))
    }
}

struct OpcuaSession {
    session: Arc<Session>,
    event_loop_handle: Option<tokio::task::JoinHandle<opcua::types::StatusCode>>,
}

#[async_trait]
impl FieldSession for OpcuaSession {
    async fn namespace_index(&self, uri: &str) -> Result<u16, TransportError> {
        self.session
            .get_namespace_index(uri)
            .await
            .map_err(|error| TransportError::Namespace {
                uri: uri.to_owned(),
                message: error.to_string(),
            })
    }

    async fn namespace_array(&self) -> Result<Vec<String>, TransportError> {
        let read = ReadValueId {
            node_id: VariableId::Server_NamespaceArray.into(),
            attribute_id: AttributeId::Value as u32,
            ..Default::default()
        };
        let mut results = self
            .session
            .read(&[read], TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(|error| TransportError::SessionLost {
                message: error.to_string(),
            })?;
        let value = results.pop().ok_or_else(|| TransportError::SessionLost {
            message: "empty namespace array read".to_owned(),
        })?;
        match value.value {
            Some(Variant::Array(array)) => Ok(array
                .values
                .into_iter()
                .map(|v| match v {
                    Variant::String(s) => s.to_string(),
                    other => format!("{other:?}"),
                })
                .collect()),
            _ => Err(TransportError::SessionLost {
                message: "namespace array read returned no value".to_owned(),
            }),
        }
    }

    async fn subscribe(
        &mut self,
        publishing_interval: Duration,
        items: &[(TagHandle, NodeRef)],
        channel_capacity: usize,
    ) -> Result<(SubscribeOutcome, mpsc::Receiver<ValueChange>), TransportError> {
        let (tx, rx) = mpsc::channel(channel_capacity);

        let callback = DataChangeCallback::new(move |value: DataValue, item| {
            let handle = TagHandle(item.client_handle());
            let Some(mapped) = data_value_to_change(handle, &value) else {
                debug!(
                    message = "Unsupported variant dropped.",
                    handle = handle.0
                );
                return;
            };
            // The wire thread only enqueues; the owning task drains. A
            // full channel drops the oldest pressure point: this change.
            if tx.try_send(mapped).is_err() {
                warn!(
                    message = "Notification channel full; data change dropped.",
                    handle = handle.0
                );
            }
        });

        let subscription_id = self
            .session
            .create_subscription(
                publishing_interval,
                SUBSCRIPTION_LIFETIME_COUNT,
                SUBSCRIPTION_KEEP_ALIVE_COUNT,
                items.len() as u32,
                SUBSCRIPTION_PRIORITY,
                true,
                callback,
            )
            .await
            .map_err(|error| TransportError::Subscribe {
                message: error.to_string(),
            })?;

        let mut outcome = SubscribeOutcome::default();
        let mut requests = Vec::with_capacity(items.len());
        let mut requested_handles = Vec::with_capacity(items.len());
        for (handle, node) in items {
            match NodeId::from_str(node.as_str()) {
                Ok(node_id) => {
                    requests.push(MonitoredItemCreateRequest {
                        item_to_monitor: node_id.into(),
                        monitoring_mode: MonitoringMode::Reporting,
                        requested_parameters: MonitoringParameters {
                            client_handle: handle.0,
                            sampling_interval: publishing_interval.as_millis() as f64,
                            queue_size: MONITORED_ITEM_QUEUE_SIZE,
                            discard_oldest: true,
                            ..Default::default()
                        },
                    });
                    requested_handles.push(*handle);
                }
                Err(error) => {
                    warn!(
                        message = "Configured node id does not parse.",
                        node = node.as_str(),
                        %error
                    );
                    outcome.failed.push(*handle);
                }
            }
        }

        if !requests.is_empty() {
            let results = self
                .session
                .create_monitored_items(subscription_id, TimestampsToReturn::Both, requests)
                .await
                .map_err(|error| TransportError::Subscribe {
                    message: error.to_string(),
                })?;
            for (result, handle) in results.iter().zip(requested_handles) {
                if result.status_code.is_good() {
                    outcome.subscribed += 1;
                } else {
                    outcome.failed.push(handle);
                }
            }
        }

        Ok((outcome, rx))
    }

    async fn disconnect(&mut self) {
        if let Err(status) = self.session.disconnect().await {
            debug!(message = "Disconnect returned an error status.", %status);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

fn data_value_to_change(handle: TagHandle, value: &DataValue) -> Option<ValueChange> {
    let variant = value.value.clone()?;
    let mapped = variant_to_value(variant)?;
    let quality = value.status.map(|status| {
        if status.is_good() {
            Quality::Good
        } else if status.is_bad() {
            Quality::Bad
        } else {
            Quality::Uncertain
        }
    });
    let server_timestamp: Option<DateTime<Utc>> =
        value.server_timestamp.as_ref().map(|ts| ts.as_chrono());
    Some(ValueChange {
        handle,
        value: mapped,
        quality,
        server_timestamp,
    })
}

fn variant_to_value(variant: Variant) -> Option<Value> {
    match variant {
        Variant::Double(v) => Some(Value::Float(v)),
        Variant::Float(v) => Some(Value::Float(f64::from(v))),
        Variant::SByte(v) => Some(Value::Integer(i64::from(v))),
        Variant::Byte(v) => Some(Value::Integer(i64::from(v))),
        Variant::Int16(v) => Some(Value::Integer(i64::from(v))),
        Variant::UInt16(v) => Some(Value::Integer(i64::from(v))),
        Variant::Int32(v) => Some(Value::Integer(i64::from(v))),
        Variant::UInt32(v) => Some(Value::Integer(i64::from(v))),
        Variant::Int64(v) => Some(Value::Integer(v)),
        Variant::UInt64(v) => i64::try_from(v).ok().map(Value::Integer),
        Variant::Boolean(v) => Some(Value::Bool(v)),
        Variant::String(v) => Some(Value::String(v.to_string())),
        _ => None,
    }
}

/// Identity provider rooted in the adapter's PKI directory. The key pair
/// itself is generated by the client stack on first secure connect.
pub struct PkiIdentity {
    pki_dir: PathBuf,
}

impl PkiIdentity {
    pub fn new(pki_dir: PathBuf) -> Self {
        Self { pki_dir }
    }
}

impl IdentityProvider for PkiIdentity {
    fn ensure_identity(&self) -> Result<ClientIdentity, TransportError> {
        Ok(ClientIdentity {
            cert_path: self.pki_dir.join("own").join("cert.der"),
            key_path: self.pki_dir.join("private").join("private.pem"),
        })
    }
}
