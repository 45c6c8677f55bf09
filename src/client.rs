//! The host-facing client facade.
//!
//! `DcpClient::open` takes a config; `connect` bootstraps the first cluster
//! map (waiting out a bucket that is still warming up), sizes the session
//! store, and starts the conductor.  Everything after that is driven by
//! topology updates and the host's `stream_partitions` calls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::channel::{ChannelShared, EndSpec, SharedListener};
use crate::conductor::{Conductor, ConductorCommand};
use crate::config::{ClientConfig, FlowControlMode};
use crate::error::DcpError;
use crate::listener::{DatabaseChangeListener, NullListener};
use crate::session::{SessionSnapshot, SessionStore};
use crate::topology::BucketConfigArbiter;

/// Where a partition stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFrom {
    /// Resume from session state; zero for fresh partitions.
    Beginning,
    /// Capture the current high seqno at open and start there.
    Now,
    Seqno(u64),
}

/// Where a partition stream stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTo {
    /// Capture the current high seqno at open and stop there.
    Now,
    Infinity,
    Seqno(u64),
}

/// Interval between bootstrap config polls while the bucket map is empty.
const BOOTSTRAP_POLL: Duration = Duration::from_millis(200);

struct Connected {
    session: Arc<SessionStore>,
    commands: mpsc::UnboundedSender<ConductorCommand>,
    shutdown: watch::Sender<bool>,
    conductor: tokio::task::JoinHandle<()>,
}

/// One DCP client for one bucket.
pub struct DcpClient {
    config: ClientConfig,
    listener: SharedListener,
    connected: Option<Connected>,
}

impl DcpClient {
    pub fn open(config: ClientConfig) -> Self {
        DcpClient {
            config,
            listener: Arc::new(std::sync::RwLock::new(Arc::new(NullListener))),
            connected: None,
        }
    }

    /// Register the change listener.  May be called before or after
    /// `connect`; events already in flight keep going to the old listener.
    pub fn set_listener(&self, listener: Arc<dyn DatabaseChangeListener>) {
        *self.listener.write().expect("listener lock poisoned") = listener;
    }

    /// Set before `connect`; changing it mid-stream is refused.
    pub fn set_flow_control_mode(&mut self, mode: FlowControlMode) -> Result<(), DcpError> {
        if self.connected.is_some() {
            return Err(DcpError::Fatal(
                "flow control mode cannot change while connected".into(),
            ));
        }
        self.config.flow_control_mode = mode;
        Ok(())
    }

    /// Bootstrap the cluster map from the seed list and start the conductor.
    ///
    /// Blocks until a ready (non-empty) map is published; a bucket that was
    /// just created reports an empty partition map for a short while and
    /// this call waits it out.
    pub async fn connect(&mut self) -> Result<(), DcpError> {
        if self.connected.is_some() {
            return Ok(());
        }
        if self.config.seed_nodes.is_empty() {
            return Err(DcpError::Fatal("no seed nodes configured".into()));
        }

        let arbiter = Arc::new(BucketConfigArbiter::new());
        let map = self.bootstrap(&arbiter).await?;
        info!(
            partitions = map.num_partitions(),
            nodes = map.nodes.len(),
            bucket = %self.config.bucket,
            "connected"
        );

        let session = Arc::new(SessionStore::new(map.num_partitions()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = ChannelShared {
            config: Arc::new(self.config.clone()),
            session: session.clone(),
            arbiter: arbiter.clone(),
            listener: self.listener.clone(),
        };
        let conductor = Conductor::new(shared, shutdown_rx);
        let task = tokio::spawn(conductor.run(command_rx));

        self.connected = Some(Connected {
            session,
            commands: command_tx,
            shutdown: shutdown_tx,
            conductor: task,
        });
        Ok(())
    }

    async fn bootstrap(
        &self,
        arbiter: &Arc<BucketConfigArbiter>,
    ) -> Result<Arc<crate::topology::ClusterMap>, DcpError> {
        loop {
            let mut permanent_failures = 0;
            let mut last_error = None;
            for &seed in &self.config.seed_nodes {
                match crate::bootstrap::fetch_bucket_config(seed, &self.config).await {
                    Ok(raw) => {
                        if let Err(error) = arbiter.offer_raw(&raw) {
                            warn!(%seed, %error, "seed returned an unparseable config");
                        }
                    }
                    Err(error) => {
                        if !error.is_recoverable() {
                            permanent_failures += 1;
                        }
                        warn!(%seed, %error, "seed bootstrap failed");
                        last_error = Some(error);
                    }
                }
                if let Some(map) = arbiter.current() {
                    return Ok(map);
                }
            }
            if permanent_failures == self.config.seed_nodes.len() {
                return Err(last_error.expect("at least one failure recorded"));
            }
            // Bucket not ready (or seeds flaky); poll until a usable map
            // shows up.
            tokio::time::sleep(BOOTSTRAP_POLL).await;
        }
    }

    /// Stop all channels.  In-flight frames are drained, not delivered.
    pub async fn disconnect(&mut self) {
        if let Some(connected) = self.connected.take() {
            let _ = connected.shutdown.send(true);
            let _ = connected.conductor.await;
            info!("disconnected");
        }
    }

    fn connected(&self) -> Result<&Connected, DcpError> {
        self.connected.as_ref().ok_or(DcpError::NotConnected)
    }

    /// The bucket's partition count (normally 1024).
    pub fn num_partitions(&self) -> Result<u16, DcpError> {
        Ok(self.connected()?.session.num_partitions())
    }

    /// Open (or resume) streams for `vbuckets`.
    pub fn stream_partitions(
        &self,
        vbuckets: &[u16],
        from: StreamFrom,
        to: StreamTo,
    ) -> Result<(), DcpError> {
        let connected = self.connected()?;
        let partitions = connected.session.num_partitions();
        if let Some(&bad) = vbuckets.iter().find(|vb| **vb >= partitions) {
            return Err(DcpError::Fatal(format!(
                "vbucket {bad} out of range (partition count {partitions})"
            )));
        }

        let from_now = match from {
            StreamFrom::Beginning => false,
            StreamFrom::Now => true,
            StreamFrom::Seqno(seqno) => {
                for &vbucket in vbuckets {
                    connected.session.update(vbucket, |state| {
                        state.seqno = seqno;
                        state.set_snapshot(seqno, seqno);
                    });
                }
                false
            }
        };
        let end = match to {
            StreamTo::Now => EndSpec::Now,
            StreamTo::Infinity => EndSpec::Infinity,
            StreamTo::Seqno(seqno) => EndSpec::Seqno(seqno),
        };

        connected
            .commands
            .send(ConductorCommand::StreamPartitions {
                vbuckets: vbuckets.to_vec(),
                from_now,
                end,
            })
            .map_err(|_| DcpError::NotConnected)
    }

    /// Close streams for `vbuckets` without touching their session state.
    pub fn stop_partitions(&self, vbuckets: &[u16]) -> Result<(), DcpError> {
        self.connected()?
            .commands
            .send(ConductorCommand::StopPartitions {
                vbuckets: vbuckets.to_vec(),
            })
            .map_err(|_| DcpError::NotConnected)
    }

    /// A consistent snapshot of every partition's resume state.
    pub fn session_state(&self) -> Result<SessionSnapshot, DcpError> {
        Ok(self.connected()?.session.snapshot())
    }

    /// Restore a snapshot taken by [`DcpClient::session_state`].  Call
    /// before `stream_partitions`; restoring under open streams races the
    /// stream writers.
    pub fn restore_session_state(&self, snapshot: &SessionSnapshot) -> Result<(), DcpError> {
        self.connected()?.session.restore(snapshot)
    }

    /// Reset one partition to the fresh state; its next stream starts from
    /// zero.
    pub fn clear_partition_state(&self, vbucket: u16) -> Result<(), DcpError> {
        let connected = self.connected()?;
        if vbucket >= connected.session.num_partitions() {
            return Err(DcpError::Fatal(format!("vbucket {vbucket} out of range")));
        }
        connected.session.clear(vbucket);
        Ok(())
    }
}

impl Drop for DcpClient {
    fn drop(&mut self) {
        if let Some(connected) = self.connected.take() {
            let _ = connected.shutdown.send(true);
        }
    }
}
