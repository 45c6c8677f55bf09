//! Client configuration.
//!
//! All knobs are typed fields with defaults; there is no config-file or
//! environment lookup in the library.  Hosts construct a [`ClientConfig`],
//! adjust what they need, and pass it to `DcpClient::open`.
//!
//! # Required fields
//! - `seed_nodes`: at least one `host:port` of a data node
//! - `bucket`
//! - `credentials`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Supplies SASL credentials per node address.
///
/// Most deployments use one set of credentials for the whole cluster
/// ([`StaticCredentials`]); the per-address form exists for hosts that front
/// nodes with different auth domains.
pub trait CredentialsProvider: Send + Sync {
    fn credentials_for(&self, node: SocketAddr) -> (String, String);
}

/// The common case: same username/password for every node.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    pub username: String,
    pub password: String,
}

impl CredentialsProvider for StaticCredentials {
    fn credentials_for(&self, _node: SocketAddr) -> (String, String) {
        (self.username.clone(), self.password.clone())
    }
}

// ---------------------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------------------

/// When flow-control credit is returned to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControlMode {
    /// Credit returned before the listener callback runs.
    #[default]
    Auto,
    /// Credit returned after the callback returns.
    AutoAfterCallback,
    /// The application calls the ack handle itself.
    Manual,
}

// ---------------------------------------------------------------------------
// HELLO feature flags
// ---------------------------------------------------------------------------

/// Optional HELLO features; the baseline set (TCP_NODELAY, XERROR,
/// SELECT_BUCKET, JSON, DUPLEX, clustermap notifications) is always
/// requested.  The server may still decline anything here; channels branch
/// on the honored subset, not on these switches.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub xattrs: bool,
    pub snappy: bool,
    pub collections: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            xattrs: true,
            snappy: true,
            collections: true,
        }
    }
}

// ---------------------------------------------------------------------------
// DCP control options
// ---------------------------------------------------------------------------

/// Channel-wide DCP_CONTROL switches, sent in a fixed order during the
/// handshake.  A rejection of any emitted key is fatal for the channel.
#[derive(Debug, Clone)]
pub struct DcpControl {
    /// Server-side buffer bound in bytes; 0 disables flow control.
    pub connection_buffer_size: u32,
    /// Fraction of the buffer consumed before a buffer-ack is emitted.
    pub ack_threshold: f64,
    pub enable_noop: bool,
    pub noop_interval: Duration,
    pub enable_expiry_opcode: bool,
    pub send_stream_end_on_client_close_stream: bool,
    pub enable_stream_id: bool,
    pub force_value_compression: bool,
}

impl Default for DcpControl {
    fn default() -> Self {
        DcpControl {
            connection_buffer_size: 20 * 1024 * 1024,
            ack_threshold: 0.5,
            enable_noop: true,
            noop_interval: Duration::from_secs(120),
            enable_expiry_opcode: false,
            send_stream_end_on_client_close_stream: false,
            enable_stream_id: false,
            force_value_compression: false,
        }
    }
}

impl DcpControl {
    /// The key/value pairs in wire order.
    pub(crate) fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if self.connection_buffer_size > 0 {
            pairs.push((
                "connection_buffer_size".to_owned(),
                self.connection_buffer_size.to_string(),
            ));
        }
        if self.enable_noop {
            pairs.push(("enable_noop".to_owned(), "true".to_owned()));
            pairs.push((
                "set_noop_interval".to_owned(),
                self.noop_interval.as_secs().to_string(),
            ));
        }
        if self.enable_expiry_opcode {
            pairs.push(("enable_expiry_opcode".to_owned(), "true".to_owned()));
        }
        if self.send_stream_end_on_client_close_stream {
            pairs.push((
                "send_stream_end_on_client_close_stream".to_owned(),
                "true".to_owned(),
            ));
        }
        if self.enable_stream_id {
            pairs.push(("enable_stream_id".to_owned(), "true".to_owned()));
        }
        if self.force_value_compression {
            pairs.push(("force_value_compression".to_owned(), "true".to_owned()));
        }
        pairs
    }
}

// ---------------------------------------------------------------------------
// Rollback mitigation
// ---------------------------------------------------------------------------

/// Hold events until the active copy reports them persisted before
/// delivering them to the listener.
#[derive(Debug, Clone)]
pub struct MitigationConfig {
    /// OBSERVE_SEQNO polling period.
    pub poll_interval: Duration,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        MitigationConfig {
            poll_interval: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// TLS / collections
// ---------------------------------------------------------------------------

/// TLS material carried for the host's connector; engine construction is
/// the host's concern.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_chain_path: Option<String>,
    pub trust_store_path: Option<String>,
}

/// Restrict streamed events to named scopes/collections.  Empty filter
/// means "everything".
#[derive(Debug, Clone, Default)]
pub struct CollectionsFilter {
    pub scopes: Vec<String>,
    pub collections: Vec<String>,
}

impl CollectionsFilter {
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty() && self.collections.is_empty()
    }

    /// True when a system event named `name` passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        self.is_empty()
            || self.scopes.iter().any(|s| s == name)
            || self.collections.iter().any(|c| c == name)
    }
}

// ---------------------------------------------------------------------------
// Top-level client config
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ClientConfig {
    /// `host:port` of data nodes used for the first cluster-config fetch.
    pub seed_nodes: Vec<SocketAddr>,
    pub bucket: String,
    pub credentials: Arc<dyn CredentialsProvider>,
    /// DCP connection name; visible in server stats.  A random suffix is
    /// appended at open so concurrent clients never collide.
    pub connection_name_prefix: String,
    pub features: FeatureFlags,
    pub control: DcpControl,
    pub flow_control_mode: FlowControlMode,
    pub socket_connect_timeout: Duration,
    /// Added on top of `socket_connect_timeout` to bound each handshake
    /// phase.
    pub connect_callback_grace_period: Duration,
    pub tls: Option<TlsConfig>,
    pub collections_filter: CollectionsFilter,
    pub mitigation: Option<MitigationConfig>,
}

impl ClientConfig {
    pub fn new(
        seed_nodes: Vec<SocketAddr>,
        bucket: impl Into<String>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        ClientConfig {
            seed_nodes,
            bucket: bucket.into(),
            credentials,
            connection_name_prefix: "dcp-client".to_owned(),
            features: FeatureFlags::default(),
            control: DcpControl::default(),
            flow_control_mode: FlowControlMode::default(),
            socket_connect_timeout: Duration::from_secs(10),
            connect_callback_grace_period: Duration::from_millis(2000),
            tls: None,
            collections_filter: CollectionsFilter::default(),
            mitigation: None,
        }
    }

    /// Deadline for one handshake phase.
    pub fn handshake_timeout(&self) -> Duration {
        self.socket_connect_timeout + self.connect_callback_grace_period
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("seed_nodes", &self.seed_nodes)
            .field("bucket", &self.bucket)
            .field("connection_name_prefix", &self.connection_name_prefix)
            .field("features", &self.features)
            .field("control", &self.control)
            .field("flow_control_mode", &self.flow_control_mode)
            .field("socket_connect_timeout", &self.socket_connect_timeout)
            .field(
                "connect_callback_grace_period",
                &self.connect_callback_grace_period,
            )
            .field("mitigation", &self.mitigation)
            .finish_non_exhaustive()
    }
}
