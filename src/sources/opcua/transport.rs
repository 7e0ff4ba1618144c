//! The collaborator contract between the collector and the field-protocol
//! wire implementation. The core only ever sees these traits; the real
//! OPC UA stack lives behind the `transport-opcua` adapter, and tests run
//! an in-process mock.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;
use tokio::sync::mpsc;

use crate::event::{Quality, Value};

#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("Connect to {endpoint} failed: {message}"))]
    Connect { endpoint: String, message: String },
    #[snafu(display("Connect to {endpoint} timed out"))]
    Timeout { endpoint: String },
    #[snafu(display("Endpoint discovery at {endpoint} failed: {message}"))]
    Discovery { endpoint: String, message: String },
    #[snafu(display("Namespace {uri} could not be resolved: {message}"))]
    Namespace { uri: String, message: String },
    #[snafu(display("Subscription setup failed: {message}"))]
    Subscribe { message: String },
    #[snafu(display("Session lost: {message}"))]
    SessionLost { message: String },
    #[snafu(display("Client identity unavailable: {message}"))]
    Identity { message: String },
}

/// Effective security policy for a session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SecurityPolicy {
    #[default]
    None,
    Basic128Rsa15,
    Basic256Sha256,
}

impl SecurityPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityPolicy::None => "None",
            SecurityPolicy::Basic128Rsa15 => "Basic128Rsa15",
            SecurityPolicy::Basic256Sha256 => "Basic256Sha256",
        }
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, SecurityPolicy::None)
    }
}

impl FromStr for SecurityPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(SecurityPolicy::None),
            "Basic128Rsa15" => Ok(SecurityPolicy::Basic128Rsa15),
            "Basic256Sha256" => Ok(SecurityPolicy::Basic256Sha256),
            _ => Err(UnknownPolicy {
                policy: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("Unknown security policy {policy}"))]
pub struct UnknownPolicy {
    pub policy: String,
}

/// Client certificate/key pair used for secure sessions.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Everything the wire client needs to open a session. Secure policies
/// connect sign-and-encrypt with the client identity.
#[derive(Clone, Debug, Default)]
pub struct SecurityProfile {
    pub policy: SecurityPolicy,
    pub identity: Option<ClientIdentity>,
    pub trust_store: Option<PathBuf>,
}

/// One advertised server endpoint, as seen during policy negotiation.
#[derive(Clone, Debug)]
pub struct EndpointProfile {
    pub security_policy_uri: String,
    pub security_mode: String,
}

/// Provides the client certificate/key pair, generating a self-signed
/// pair (2048-bit RSA, one-year validity, SAN covering localhost,
/// 127.0.0.1, and the configured hostname) when none exists yet.
pub trait IdentityProvider: Send + Sync {
    fn ensure_identity(&self) -> Result<ClientIdentity, TransportError>;
}

/// A resolved wire-level node reference in canonical `ns=…;i=…` /
/// `ns=…;s=…` form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeRef(pub String);

impl NodeRef {
    /// Resolves a configured node id against the session's namespace
    /// index: full references pass through, bare numerics become
    /// `ns=<ns>;i=<id>`, bare strings `ns=<ns>;s=<id>`.
    pub fn resolve(raw: &str, namespace: u16) -> Self {
        if raw.starts_with("ns=") {
            NodeRef(raw.to_owned())
        } else if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            NodeRef(format!("ns={namespace};i={raw}"))
        } else {
            NodeRef(format!("ns={namespace};s={raw}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque per-tag handle carried through subscription notifications.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TagHandle(pub u32);

/// One data-change notification from the wire.
#[derive(Clone, Debug)]
pub struct ValueChange {
    pub handle: TagHandle,
    pub value: Value,
    pub quality: Option<Quality>,
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Result of registering the monitored items: how many subscribed and
/// which handles failed. A reduced set is tolerated; zero is a session
/// failure.
#[derive(Clone, Debug, Default)]
pub struct SubscribeOutcome {
    pub subscribed: usize,
    pub failed: Vec<TagHandle>,
}

/// Factory for field sessions; also serves endpoint discovery for policy
/// negotiation (a throwaway unsecured exchange).
#[async_trait]
pub trait FieldConnector: Send + Sync {
    async fn endpoints(
        &self,
        endpoint_url: &str,
        timeout: Duration,
    ) -> Result<Vec<EndpointProfile>, TransportError>;

    async fn connect(
        &self,
        endpoint_url: &str,
        security: &SecurityProfile,
        timeout: Duration,
    ) -> Result<Box<dyn FieldSession>, TransportError>;
}

/// One live, authenticated session. Notifications arrive on the bounded
/// channel returned by [`FieldSession::subscribe`]; the wire callback
/// enqueues, the owning collector task drains.
#[async_trait]
pub trait FieldSession: Send + Sync {
    async fn namespace_index(&self, uri: &str) -> Result<u16, TransportError>;

    /// Cheap metadata read used as the liveness probe.
    async fn namespace_array(&self) -> Result<Vec<String>, TransportError>;

    async fn subscribe(
        &mut self,
        publishing_interval: Duration,
        items: &[(TagHandle, NodeRef)],
        channel_capacity: usize,
    ) -> Result<(SubscribeOutcome, mpsc::Receiver<ValueChange>), TransportError>;

    async fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_node_references_pass_through() {
        assert_eq!(NodeRef::resolve("ns=2;i=1001", 4).as_str(), "ns=2;i=1001");
        assert_eq!(
            NodeRef::resolve("ns=2;s=Press01.Speed", 4).as_str(),
            "ns=2;s=Press01.Speed"
        );
    }

    #[test]
    fn bare_ids_pick_up_the_namespace() {
        assert_eq!(NodeRef::resolve("1001", 4).as_str(), "ns=4;i=1001");
        assert_eq!(
            NodeRef::resolve("Press01.Speed", 4).as_str(),
            "ns=4;s=Press01.Speed"
        );
        // Mixed alphanumerics are string ids.
        assert_eq!(NodeRef::resolve("12a", 4).as_str(), "ns=4;s=12a");
    }

    #[test]
    fn policy_parsing_round_trips() {
        for policy in [
            SecurityPolicy::None,
            SecurityPolicy::Basic128Rsa15,
            SecurityPolicy::Basic256Sha256,
        ] {
            assert_eq!(policy.as_str().parse::<SecurityPolicy>().unwrap(), policy);
        }
        assert!("Basic256".parse::<SecurityPolicy>().is_err());
        assert!(!SecurityPolicy::None.is_secure());
        assert!(SecurityPolicy::Basic256Sha256.is_secure());
    }
}
