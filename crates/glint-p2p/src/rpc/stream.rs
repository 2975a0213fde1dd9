use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use glint_core::types::spec::ChainSpec;
use libp2p::PeerId;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::Duration;

use super::codec::{read_response_item, CodecError, PayloadCodec, RawResponseItem, ResponseItem, ResponsePayload};
use super::protocol::{Protocol, ResponseShape};
use super::RpcError;
use crate::transport::Substream;

/// Everything a live response stream owns. Dropping it closes the substream
/// and returns the request permit.
pub(crate) struct StreamState {
    pub(crate) substream: Box<dyn Substream>,
    pub(crate) protocol: Protocol,
    pub(crate) max_items: u64,
    pub(crate) ttfb_timeout: Duration,
    pub(crate) resp_timeout: Duration,
    pub(crate) max_payload: usize,
    pub(crate) codec: Arc<dyn PayloadCodec>,
    pub(crate) spec: Arc<ChainSpec>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) _permit: OwnedSemaphorePermit,
    pub(crate) received: u64,
    pub(crate) done: bool,
}

/// Lazily read response items.
///
/// Each poll reads at most one frame from the substream. Nothing is buffered
/// ahead of the consumer, so a slow consumer applies backpressure all the way
/// to the responding peer.
pub struct ResponseStream {
    peer: PeerId,
    protocol: Protocol,
    inner: BoxStream<'static, Result<ResponseItem, RpcError>>,
}

impl ResponseStream {
    pub(crate) fn new(peer: PeerId, state: StreamState) -> Self {
        let protocol = state.protocol;
        let inner = stream::unfold(state, |mut state| async move {
            let item = next_item(&mut state).await;
            item.map(|item| (item, state))
        })
        .boxed();
        Self {
            peer,
            protocol,
            inner,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl Stream for ResponseStream {
    type Item = Result<ResponseItem, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Resolves once the peer's requests are cancelled.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            if *cancel.borrow() {
                return;
            }
            futures::future::pending::<()>().await;
        }
    }
}

async fn next_item(state: &mut StreamState) -> Option<Result<ResponseItem, RpcError>> {
    if state.done || state.received >= state.max_items {
        return None;
    }

    let (deadline, first_item) = if state.received == 0 {
        (state.ttfb_timeout, true)
    } else {
        (state.resp_timeout, false)
    };
    let protocol = state.protocol;
    let read = read_response_item(&mut *state.substream, protocol, state.max_payload);

    let outcome = tokio::select! {
        biased;
        _ = cancelled(&mut state.cancel) => Err(RpcError::Cancelled),
        result = tokio::time::timeout(deadline, read) => match result {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout { protocol, first_item }),
        },
    };

    match outcome {
        Ok(Some(raw)) => match decode_item(state, raw) {
            Ok(item) => {
                state.received += 1;
                Some(Ok(item))
            }
            Err(e) => {
                state.done = true;
                Some(Err(e))
            }
        },
        Ok(None) => {
            state.done = true;
            let expects_one = protocol.response_shape() == ResponseShape::ExactlyOne;
            if state.received == 0 && expects_one {
                Some(Err(RpcError::IncompleteStream))
            } else {
                None
            }
        }
        Err(e) => {
            state.done = true;
            Some(Err(e))
        }
    }
}

fn decode_item(state: &StreamState, raw: RawResponseItem) -> Result<ResponseItem, RpcError> {
    if state.protocol == Protocol::Ping {
        let bytes: [u8; 8] = raw
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::Malformed("ping payload must be 8 bytes".into()))?;
        return Ok(ResponseItem {
            fork: None,
            payload: ResponsePayload::Pong(u64::from_le_bytes(bytes)),
        });
    }

    let digest = raw
        .context
        .ok_or_else(|| CodecError::Malformed("missing context bytes".into()))?;
    let fork = state
        .spec
        .fork_for_digest(&digest)
        .ok_or(CodecError::UnknownForkDigest(digest))?;
    let payload = state
        .codec
        .decode_response(state.protocol, fork, &raw.payload)?;
    Ok(ResponseItem {
        fork: Some(fork),
        payload,
    })
}
