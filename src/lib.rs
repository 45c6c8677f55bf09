//! A Couchbase DCP (Database Change Protocol) consumer client.
//!
//! DCP is Couchbase's server-push binary change feed: a bucket's keyspace is
//! split into 1024 vbuckets, and a consumer opens one stream per vbucket to
//! receive its mutations, deletions, and control events in order.  This
//! crate manages the connections (one per data node, rebalanced as the
//! cluster map changes), the per-vbucket session state needed to resume
//! after disconnection without gaps or duplicates, and the flow-control
//! credit that keeps the server from overrunning the consumer.
//!
//! # Overview
//!
//! ```no_run
//! use std::sync::Arc;
//! use dcp_client::{
//!     ClientConfig, DatabaseChangeListener, DcpClient, DcpError, StaticCredentials,
//!     StreamFrom, StreamTo,
//! };
//!
//! struct Printer;
//!
//! impl DatabaseChangeListener for Printer {
//!     fn on_mutation(&self, mutation: dcp_client::Mutation, ack: dcp_client::AckHandle) {
//!         println!("vb {} seqno {}", mutation.vbucket, mutation.by_seqno);
//!         ack.ack();
//!     }
//!     fn on_failure(&self, error: DcpError) {
//!         eprintln!("dcp failure: {error}");
//!     }
//! }
//!
//! # async fn run() -> Result<(), DcpError> {
//! let config = ClientConfig::new(
//!     vec!["127.0.0.1:11210".parse().unwrap()],
//!     "travel-sample",
//!     Arc::new(StaticCredentials {
//!         username: "reader".into(),
//!         password: "secret".into(),
//!     }),
//! );
//! let mut client = DcpClient::open(config);
//! client.set_listener(Arc::new(Printer));
//! client.connect().await?;
//! let all: Vec<u16> = (0..client.num_partitions()?).collect();
//! client.stream_partitions(&all, StreamFrom::Beginning, StreamTo::Infinity)?;
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod channel;
mod client;
mod conductor;
mod config;
mod error;
mod flow;
mod listener;
mod mitigation;
mod session;
mod stream;
mod topology;

pub use channel::EndSpec;
pub use client::{DcpClient, StreamFrom, StreamTo};
pub use config::{
    ClientConfig, CollectionsFilter, CredentialsProvider, DcpControl, FeatureFlags,
    FlowControlMode, MitigationConfig, StaticCredentials, TlsConfig,
};
pub use error::DcpError;
pub use listener::{AckHandle, DatabaseChangeListener, RollbackAction};
pub use session::{PartitionState, SessionSnapshot};
pub use topology::ClusterMap;

// Protocol types that appear in the listener surface.
pub use dcp_protocol::{
    Deletion, Expiration, FailoverLogEntry, Mutation, OsoSnapshot, SeqnoAdvanced,
    SnapshotMarker, StreamEndReason, SystemEvent, SystemEventKind,
};
