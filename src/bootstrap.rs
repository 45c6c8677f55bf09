//! Seed-node bootstrap: fetch the first bucket config.
//!
//! Before any channel exists the client knows only its seed list.  A
//! bootstrap pass opens a short-lived connection to a seed, authenticates,
//! selects the bucket, and pulls the cluster config in-band; the arbiter
//! takes it from there.  The connection is then dropped -- real channels are
//! the conductor's job.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use dcp_protocol::{Frame, FrameCodec, status};

use crate::config::ClientConfig;
use crate::error::DcpError;

async fn roundtrip(
    framed: &mut Framed<TcpStream, FrameCodec>,
    mut frame: Frame,
    opaque: u32,
) -> Result<Frame, DcpError> {
    frame.opaque = opaque;
    framed
        .send(frame)
        .await
        .map_err(|e| DcpError::ChannelDropped(e.to_string()))?;
    loop {
        match framed.next().await {
            Some(Ok(frame)) if frame.is_response() && frame.opaque == opaque => {
                return Ok(frame);
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(DcpError::from_codec(e)),
            None => return Err(DcpError::ChannelDropped("connection closed".into())),
        }
    }
}

/// Fetch the raw bucket-config JSON from one seed node.
pub(crate) async fn fetch_bucket_config(
    node: SocketAddr,
    config: &ClientConfig,
) -> Result<Bytes, DcpError> {
    let overall = config.handshake_timeout();
    tokio::time::timeout(overall, fetch_inner(node, config))
        .await
        .map_err(|_| DcpError::HandshakeFailure {
            phase: "bootstrap",
            detail: format!("timed out against seed {node}"),
            permanent: false,
        })?
}

async fn fetch_inner(node: SocketAddr, config: &ClientConfig) -> Result<Bytes, DcpError> {
    let stream = TcpStream::connect(node)
        .await
        .map_err(|e| DcpError::HandshakeFailure {
            phase: "bootstrap",
            detail: e.to_string(),
            permanent: false,
        })?;
    let mut framed = Framed::new(stream, FrameCodec);

    let (username, password) = config.credentials.credentials_for(node);
    let response = roundtrip(
        &mut framed,
        dcp_protocol::sasl_auth_plain(&username, &password),
        1,
    )
    .await?;
    if response.status() == status::AUTH_ERROR {
        return Err(DcpError::HandshakeFailure {
            phase: "bootstrap",
            detail: "credentials rejected".into(),
            permanent: true,
        });
    }

    let response = roundtrip(&mut framed, dcp_protocol::select_bucket(&config.bucket), 2).await?;
    if response.status() == status::KEY_ENOENT {
        return Err(DcpError::HandshakeFailure {
            phase: "bootstrap",
            detail: format!("no such bucket: {}", config.bucket),
            permanent: true,
        });
    }

    let response = roundtrip(&mut framed, dcp_protocol::get_cluster_config(0), 3).await?;
    if response.status() != status::SUCCESS {
        return Err(DcpError::HandshakeFailure {
            phase: "bootstrap",
            detail: format!("get_cluster_config status 0x{:02x}", response.status()),
            permanent: false,
        });
    }
    debug!(%node, bytes = response.value.len(), "bootstrap config fetched");
    Ok(response.value)
}
