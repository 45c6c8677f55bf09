//! Cluster topology: the parsed cluster map and the config arbiter.
//!
//! Cluster maps reach the client from several sources (seed-node fetch,
//! server push, explicit refresh); all of them funnel through one
//! [`BucketConfigArbiter`] that keeps only the freshest revision and
//! publishes accepted maps to subscribers over a watch channel.

use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::DcpError;

// ---------------------------------------------------------------------------
// Cluster map
// ---------------------------------------------------------------------------

/// The subset of a bucket config the client consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMap {
    pub rev_epoch: u64,
    pub rev: u64,
    /// Data-node addresses, indexed by the vbucket map's server index.
    pub nodes: Vec<SocketAddr>,
    /// `vbucket_map[vbid][0]` is the active node index; further entries are
    /// replicas.  `-1` means "no owner yet".
    pub vbucket_map: Vec<Vec<i32>>,
}

impl ClusterMap {
    /// Strict `(epoch, rev)` lexicographic ordering.
    pub fn revision(&self) -> (u64, u64) {
        (self.rev_epoch, self.rev)
    }

    pub fn num_partitions(&self) -> u16 {
        self.vbucket_map.len() as u16
    }

    /// A map without vbucket assignments is "not ready" (bucket still
    /// warming up); consumers must wait for a ready map.
    pub fn is_ready(&self) -> bool {
        !self.vbucket_map.is_empty()
    }

    /// The active node serving `vbucket`, if assigned.  Replicas are never
    /// returned: streams only ever open against the active copy.
    pub fn active_node(&self, vbucket: u16) -> Option<SocketAddr> {
        let owners = self.vbucket_map.get(vbucket as usize)?;
        let index = *owners.first()?;
        if index < 0 {
            return None;
        }
        self.nodes.get(index as usize).copied()
    }

    /// Vbuckets from `of_interest` whose active copy lives on `node`.
    pub fn owned_vbuckets(&self, node: SocketAddr, of_interest: &[u16]) -> Vec<u16> {
        of_interest
            .iter()
            .copied()
            .filter(|vb| self.active_node(*vb) == Some(node))
            .collect()
    }

    /// Parse the consumed fields out of a bucket-config JSON document.
    pub fn parse(raw: &[u8]) -> Result<Self, DcpError> {
        let parsed: RawBucketConfig = serde_json::from_slice(raw)
            .map_err(|e| DcpError::ProtocolViolation(format!("bad bucket config: {e}")))?;

        let server_map = parsed.vbucket_server_map.unwrap_or_default();
        let nodes = server_map
            .server_list
            .iter()
            .map(|hostport| {
                hostport.parse().map_err(|e| {
                    DcpError::ProtocolViolation(format!("bad server address {hostport}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ClusterMap {
            rev_epoch: parsed.rev_epoch.unwrap_or(0),
            rev: parsed.rev,
            nodes,
            vbucket_map: server_map.vbucket_map,
        })
    }
}

/// Raw JSON shape; only the fields consumed are declared.
#[derive(Debug, Deserialize)]
struct RawBucketConfig {
    rev: u64,
    #[serde(rename = "revEpoch")]
    rev_epoch: Option<u64>,
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: Option<RawServerMap>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServerMap {
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

// ---------------------------------------------------------------------------
// Arbiter
// ---------------------------------------------------------------------------

/// Elects the freshest cluster map among all sources and publishes it.
///
/// Accepts a map only when its `(epoch, rev)` pair is strictly greater than
/// the current one -- on a tie the first map wins.  Not-ready maps (empty
/// vbucket assignment) are never published; waiters block until a ready map
/// lands.
pub struct BucketConfigArbiter {
    tx: watch::Sender<Option<Arc<ClusterMap>>>,
}

impl BucketConfigArbiter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        BucketConfigArbiter { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ClusterMap>>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<Arc<ClusterMap>> {
        self.tx.borrow().clone()
    }

    /// Offer a map from any source.  Returns true when it was accepted and
    /// published.
    pub fn offer(&self, map: ClusterMap) -> bool {
        let incoming = map.revision();
        let current = self.tx.borrow().as_ref().map(|m| m.revision());
        if let Some(current) = current
            && incoming <= current
        {
            debug!(?incoming, ?current, "stale cluster map rejected");
            return false;
        }
        if !map.is_ready() {
            debug!(?incoming, "cluster map has no vbucket assignments yet, holding");
            return false;
        }
        info!(
            epoch = map.rev_epoch,
            rev = map.rev,
            nodes = map.nodes.len(),
            partitions = map.num_partitions(),
            "cluster map accepted"
        );
        self.tx.send_replace(Some(Arc::new(map)));
        true
    }

    /// Offer a raw JSON config; parse failures are returned to the caller
    /// (the channel treats them as protocol violations).
    pub fn offer_raw(&self, raw: &[u8]) -> Result<bool, DcpError> {
        Ok(self.offer(ClusterMap::parse(raw)?))
    }

}

impl Default for BucketConfigArbiter {
    fn default() -> Self {
        Self::new()
    }
}
