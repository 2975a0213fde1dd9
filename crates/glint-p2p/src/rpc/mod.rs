//! Streaming request/response over per-request substreams.
//!
//! `RpcClient::request` opens a substream, writes the request and hands back a
//! lazy `ResponseStream`. Items are read one frame per poll under a
//! time-to-first-byte deadline and then a per-item deadline.

pub mod codec;
pub mod limiter;
pub mod protocol;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use glint_core::types::spec::ChainSpec;
use libp2p::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::peers::score::RequestFailure;
use crate::transport::{Transport, TransportError};

pub use codec::{CodecError, GossipPayload, JsonPayloadCodec, PayloadCodec, ResponseItem, ResponsePayload};
pub use limiter::RequestLimiter;
pub use protocol::{Protocol, Request, ResponseCode, ResponseShape};
pub use stream::ResponseStream;

use stream::{cancelled, StreamState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Peer does not support {0}")]
    UnsupportedProtocol(Protocol),

    #[error("Timed out waiting for a {protocol} response item (first item: {first_item})")]
    Timeout { protocol: Protocol, first_item: bool },

    #[error("Stream ended before the expected response")]
    IncompleteStream,

    #[error("Peer responded with {code}: {message}")]
    ErrorResponse { code: ResponseCode, message: String },

    #[error("Invalid response code {0}")]
    InvalidResponseCode(u8),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Stream I/O error: {0}")]
    Io(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(e.to_string())
    }
}

impl RpcError {
    /// How the failure reflects on the peer, or `None` when it doesn't.
    pub fn failure_kind(&self) -> Option<RequestFailure> {
        match self {
            RpcError::Transport(TransportError::UnsupportedProtocol(_))
            | RpcError::UnsupportedProtocol(_) => Some(RequestFailure::UnsupportedProtocol),
            RpcError::Transport(_) | RpcError::Io(_) => Some(RequestFailure::ConnectionError),
            RpcError::Timeout { .. } => Some(RequestFailure::Timeout),
            RpcError::IncompleteStream => Some(RequestFailure::IncompleteStream),
            RpcError::ErrorResponse {
                code: ResponseCode::ResourceUnavailable,
                ..
            } => Some(RequestFailure::ResourceUnavailable),
            RpcError::ErrorResponse { .. } => Some(RequestFailure::ServerError),
            RpcError::Codec(CodecError::UnknownForkDigest(_)) => Some(RequestFailure::WrongNetwork),
            RpcError::InvalidResponseCode(_) | RpcError::Codec(_) => Some(RequestFailure::Malformed),
            RpcError::Cancelled => None,
        }
    }
}

/// Request/response settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Deadline for the first response item.
    pub ttfb_timeout_ms: u64,
    /// Deadline for each later item.
    pub resp_timeout_ms: u64,
    /// Outstanding requests allowed per peer and protocol.
    pub max_concurrent_requests: usize,
    pub max_payload_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ttfb_timeout_ms: 5_000,
            resp_timeout_ms: 10_000,
            max_concurrent_requests: 2,
            max_payload_size: codec::MAX_PAYLOAD_SIZE,
        }
    }
}

/// Issues requests to peers and tracks what is in flight.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PayloadCodec>,
    spec: Arc<ChainSpec>,
    config: RpcConfig,
    limiter: RequestLimiter,
    cancellations: Mutex<HashMap<PeerId, watch::Sender<bool>>>,
}

impl RpcClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PayloadCodec>,
        spec: Arc<ChainSpec>,
        config: RpcConfig,
    ) -> Self {
        let limiter = RequestLimiter::new(config.max_concurrent_requests);
        Self {
            transport,
            codec,
            spec,
            config,
            limiter,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn codec(&self) -> &Arc<dyn PayloadCodec> {
        &self.codec
    }

    /// Send `request` to `peer` and return its response stream.
    ///
    /// Waits for a free request slot first. Nothing is read from the peer
    /// until the returned stream is polled.
    pub async fn request(&self, peer: PeerId, request: Request) -> Result<ResponseStream, RpcError> {
        let protocol = request.protocol();
        let mut cancel = self.cancel_receiver(peer);

        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(RpcError::Cancelled),
            permit = self.limiter.acquire(peer, protocol) => permit.ok_or(RpcError::Cancelled)?,
        };

        let protocol_id = protocol.protocol_id();
        let open = self.transport.open_stream(peer, &protocol_id);
        let mut substream = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(RpcError::Cancelled),
            opened = open => opened.map_err(|e| match e {
                TransportError::UnsupportedProtocol(_) => RpcError::UnsupportedProtocol(protocol),
                other => RpcError::Transport(other),
            })?,
        };

        codec::write_request(&mut substream, &request).await?;
        trace!(%peer, %protocol, "Request sent");

        Ok(ResponseStream::new(
            peer,
            StreamState {
                substream,
                protocol,
                max_items: request.max_items(),
                ttfb_timeout: Duration::from_millis(self.config.ttfb_timeout_ms),
                resp_timeout: Duration::from_millis(self.config.resp_timeout_ms),
                max_payload: self.config.max_payload_size,
                codec: self.codec.clone(),
                spec: self.spec.clone(),
                cancel,
                _permit: permit,
                received: 0,
                done: false,
            },
        ))
    }

    /// Request exactly one item.
    pub async fn request_one(&self, peer: PeerId, request: Request) -> Result<ResponseItem, RpcError> {
        let mut stream = self.request(peer, request).await?;
        stream.next().await.unwrap_or(Err(RpcError::IncompleteStream))
    }

    /// Liveness check on the optional ping protocol. Returns the peer's sequence number.
    pub async fn ping(&self, peer: PeerId, seq_number: u64) -> Result<u64, RpcError> {
        match self.request_one(peer, Request::Ping { seq_number }).await?.payload {
            ResponsePayload::Pong(seq) => Ok(seq),
            _ => Err(CodecError::Malformed("unexpected payload for ping".into()).into()),
        }
    }

    /// Terminate every in-flight request to `peer` with `Cancelled`.
    pub fn cancel_peer(&self, peer: &PeerId) {
        if let Some(sender) = self.cancellations.lock().remove(peer) {
            let _ = sender.send(true);
            debug!(%peer, "Cancelled in-flight requests");
        }
        self.limiter.remove_idle(peer);
    }

    pub fn in_flight(&self, peer: &PeerId, protocol: Protocol) -> usize {
        self.limiter.in_flight(peer, protocol)
    }

    fn cancel_receiver(&self, peer: PeerId) -> watch::Receiver<bool> {
        self.cancellations
            .lock()
            .entry(peer)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }
}
