//! Wire framing for requests and response items, and the payload codec boundary.
//!
//! Request: `<varint length><body>`.
//! Response item: `<status u8>`, then on success the 4-byte fork digest
//! context (for protocols that carry one), then `<varint length><payload>`.
//! Error items carry a UTF-8 message as payload.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use glint_core::types::beacon::*;
use glint_core::types::spec::{ForkDigest, ForkName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::protocol::{Protocol, Request, ResponseCode};
use super::RpcError;
use crate::gossip::GossipKind;

/// Largest payload accepted in a single frame.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Longest valid encoding of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Invalid length prefix: {0}")]
    InvalidVarint(String),

    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("{field} has {got} nodes, {fork} expects {expected}")]
    InvalidBranchLength {
        field: &'static str,
        fork: ForkName,
        expected: usize,
        got: usize,
    },

    #[error("Unknown fork digest 0x{}", hex::encode(.0))]
    UnknownForkDigest(ForkDigest),

    #[error("Protocol {0} has no payload codec")]
    UnexpectedProtocol(Protocol),
}

/// A decoded response payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponsePayload {
    Bootstrap(LightClientBootstrap),
    Update(LightClientUpdate),
    FinalityUpdate(LightClientFinalityUpdate),
    OptimisticUpdate(LightClientOptimisticUpdate),
    Pong(u64),
}

/// One item of a response stream, tagged with the fork its context named.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseItem {
    /// `None` for protocols without context bytes.
    pub fork: Option<ForkName>,
    pub payload: ResponsePayload,
}

/// A decoded gossip payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipPayload {
    FinalityUpdate(LightClientFinalityUpdate),
    OptimisticUpdate(LightClientOptimisticUpdate),
}

impl GossipPayload {
    pub fn attested_slot(&self) -> u64 {
        match self {
            GossipPayload::FinalityUpdate(update) => update.attested_header.slot,
            GossipPayload::OptimisticUpdate(update) => update.attested_header.slot,
        }
    }

    pub fn to_generic(&self) -> GenericUpdate {
        match self {
            GossipPayload::FinalityUpdate(update) => GenericUpdate::from(update),
            GossipPayload::OptimisticUpdate(update) => GenericUpdate::from(update),
        }
    }
}

/// Turns payload bytes into light client types, per fork.
///
/// The fork comes from the response context bytes or the gossip topic digest,
/// so a codec can switch schemas at fork boundaries.
pub trait PayloadCodec: Send + Sync {
    fn decode_response(
        &self,
        protocol: Protocol,
        fork: ForkName,
        bytes: &[u8],
    ) -> Result<ResponsePayload, CodecError>;

    fn decode_gossip(
        &self,
        kind: GossipKind,
        fork: ForkName,
        bytes: &[u8],
    ) -> Result<GossipPayload, CodecError>;
}

/// JSON payloads in the beacon API's hex encoding.
///
/// The fork determines the expected proof depths, so a pre-Electra branch
/// under an Electra context is rejected here rather than at verification.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonPayloadCodec;

impl JsonPayloadCodec {
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn parse<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

fn check_branch(
    field: &'static str,
    branch: &[Root],
    fork: ForkName,
    expected: usize,
) -> Result<(), CodecError> {
    if branch.len() != expected {
        return Err(CodecError::InvalidBranchLength {
            field,
            fork,
            expected,
            got: branch.len(),
        });
    }
    Ok(())
}

fn check_finality_update(update: &LightClientFinalityUpdate, fork: ForkName) -> Result<(), CodecError> {
    check_branch(
        "finality_branch",
        &update.finality_branch,
        fork,
        fork.finality_branch_depth(),
    )
}

impl PayloadCodec for JsonPayloadCodec {
    fn decode_response(
        &self,
        protocol: Protocol,
        fork: ForkName,
        bytes: &[u8],
    ) -> Result<ResponsePayload, CodecError> {
        match protocol {
            Protocol::LightClientBootstrap => {
                let bootstrap: LightClientBootstrap = Self::parse(bytes)?;
                check_branch(
                    "current_sync_committee_branch",
                    &bootstrap.current_sync_committee_branch,
                    fork,
                    fork.sync_committee_branch_depth(),
                )?;
                Ok(ResponsePayload::Bootstrap(bootstrap))
            }
            Protocol::LightClientUpdatesByRange => {
                let update: LightClientUpdate = Self::parse(bytes)?;
                check_branch(
                    "finality_branch",
                    &update.finality_branch,
                    fork,
                    fork.finality_branch_depth(),
                )?;
                if update.next_sync_committee.is_some() || !update.next_sync_committee_branch.is_empty() {
                    check_branch(
                        "next_sync_committee_branch",
                        &update.next_sync_committee_branch,
                        fork,
                        fork.sync_committee_branch_depth(),
                    )?;
                }
                Ok(ResponsePayload::Update(update))
            }
            Protocol::LightClientFinalityUpdate => {
                let update: LightClientFinalityUpdate = Self::parse(bytes)?;
                check_finality_update(&update, fork)?;
                Ok(ResponsePayload::FinalityUpdate(update))
            }
            Protocol::LightClientOptimisticUpdate => {
                Ok(ResponsePayload::OptimisticUpdate(Self::parse(bytes)?))
            }
            Protocol::Ping => Err(CodecError::UnexpectedProtocol(protocol)),
        }
    }

    fn decode_gossip(
        &self,
        kind: GossipKind,
        fork: ForkName,
        bytes: &[u8],
    ) -> Result<GossipPayload, CodecError> {
        match kind {
            GossipKind::FinalityUpdate => {
                let update: LightClientFinalityUpdate = Self::parse(bytes)?;
                check_finality_update(&update, fork)?;
                Ok(GossipPayload::FinalityUpdate(update))
            }
            GossipKind::OptimisticUpdate => Ok(GossipPayload::OptimisticUpdate(Self::parse(bytes)?)),
        }
    }
}

/// Frame a payload with its varint length prefix.
fn length_prefixed(payload: &[u8]) -> Vec<u8> {
    let mut buf = unsigned_varint::encode::u64_buffer();
    let prefix = unsigned_varint::encode::u64(payload.len() as u64, &mut buf);
    let mut frame = Vec::with_capacity(prefix.len() + payload.len());
    frame.extend_from_slice(prefix);
    frame.extend_from_slice(payload);
    frame
}

pub fn encode_request(request: &Request) -> Vec<u8> {
    length_prefixed(&request.encode_body())
}

/// Encode one response item. `context` is written only for successful items.
pub fn encode_response_item(code: ResponseCode, context: Option<ForkDigest>, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![code.as_u8()];
    if code == ResponseCode::Success {
        if let Some(digest) = context {
            frame.extend_from_slice(&digest);
        }
    }
    frame.extend_from_slice(&length_prefixed(payload));
    frame
}

pub fn encode_error_response(code: ResponseCode, message: &str) -> Vec<u8> {
    encode_response_item(code, None, message.as_bytes())
}

pub async fn write_request<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    request: &Request,
) -> Result<(), RpcError> {
    writer.write_all(&encode_request(request)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one varint byte by byte so nothing past it is consumed.
async fn read_varint<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<u64, RpcError> {
    let mut bytes = Vec::with_capacity(MAX_VARINT_LEN);
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        bytes.push(byte[0]);
        if unsigned_varint::decode::is_last(byte[0]) {
            let (value, _) = unsigned_varint::decode::u64(&bytes)
                .map_err(|e| CodecError::InvalidVarint(e.to_string()))?;
            return Ok(value);
        }
        if bytes.len() >= MAX_VARINT_LEN {
            return Err(CodecError::InvalidVarint("length prefix overflows u64".into()).into());
        }
    }
}

async fn read_payload<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Vec<u8>, RpcError> {
    let len = read_varint(reader).await?;
    if len > max_payload as u64 {
        return Err(CodecError::PayloadTooLarge {
            size: len,
            max: max_payload,
        }
        .into());
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// A response item before payload decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponseItem {
    pub context: Option<ForkDigest>,
    pub payload: Vec<u8>,
}

/// Read exactly one response item. `Ok(None)` means the responder closed the
/// stream cleanly before another item began.
pub async fn read_response_item<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    protocol: Protocol,
    max_payload: usize,
) -> Result<Option<RawResponseItem>, RpcError> {
    let mut status = [0u8; 1];
    if reader.read(&mut status).await? == 0 {
        return Ok(None);
    }
    let code = ResponseCode::from_u8(status[0]).ok_or(RpcError::InvalidResponseCode(status[0]))?;

    let context = if code == ResponseCode::Success && protocol.has_context_bytes() {
        let mut digest = [0u8; 4];
        reader.read_exact(&mut digest).await?;
        Some(digest)
    } else {
        None
    };

    let payload = read_payload(reader, max_payload).await?;
    if code != ResponseCode::Success {
        return Err(RpcError::ErrorResponse {
            code,
            message: String::from_utf8_lossy(&payload).into_owned(),
        });
    }
    Ok(Some(RawResponseItem { context, payload }))
}

/// Read a request for `protocol`, as a serving peer would.
pub async fn read_request<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    protocol: Protocol,
) -> Result<Request, RpcError> {
    let body = read_payload(reader, MAX_PAYLOAD_SIZE).await?;
    Request::decode_body(protocol, &body)
        .ok_or_else(|| CodecError::Malformed(format!("invalid {} request body", protocol)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use glint_core::test_utils::*;
    use glint_core::types::spec::ChainSpec;

    #[tokio::test]
    async fn test_request_frame_round_trip() {
        let request = Request::Bootstrap {
            block_root: [9; 32],
        };
        let frame = encode_request(&request);
        assert_eq!(frame[0], 32);

        let mut reader = Cursor::new(frame);
        let decoded = read_request(&mut reader, Protocol::LightClientBootstrap)
            .await
            .unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_read_items_one_at_a_time() {
        let mut wire = encode_response_item(ResponseCode::Success, Some([1, 2, 3, 4]), b"first");
        wire.extend(encode_response_item(ResponseCode::Success, Some([1, 2, 3, 4]), b"second"));
        let mut reader = Cursor::new(wire);

        let first = read_response_item(&mut reader, Protocol::LightClientUpdatesByRange, 1024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.context, Some([1, 2, 3, 4]));
        assert_eq!(first.payload, b"first");
        // Only the first frame was consumed
        assert_eq!(reader.position(), 1 + 4 + 1 + 5);

        let second = read_response_item(&mut reader, Protocol::LightClientUpdatesByRange, 1024)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload, b"second");
        assert!(read_response_item(&mut reader, Protocol::LightClientUpdatesByRange, 1024)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_error_status_carries_message() {
        let wire = encode_error_response(ResponseCode::ResourceUnavailable, "no such block");
        let mut reader = Cursor::new(wire);

        let err = read_response_item(&mut reader, Protocol::LightClientBootstrap, 1024)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::ErrorResponse {
                code: ResponseCode::ResourceUnavailable,
                ref message,
            } if message == "no such block"
        ));
    }

    #[tokio::test]
    async fn test_unknown_status_rejected() {
        let mut reader = Cursor::new(vec![0x7f, 0, 0, 0, 0, 0]);
        let err = read_response_item(&mut reader, Protocol::LightClientBootstrap, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidResponseCode(0x7f)));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let wire = encode_response_item(ResponseCode::Success, Some([0; 4]), &[0u8; 64]);
        let mut reader = Cursor::new(wire);
        let err = read_response_item(&mut reader, Protocol::LightClientBootstrap, 32)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Codec(CodecError::PayloadTooLarge { size: 64, max: 32 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_item_is_io_error() {
        let mut wire = encode_response_item(ResponseCode::Success, Some([0; 4]), b"payload");
        wire.truncate(wire.len() - 2);
        let mut reader = Cursor::new(wire);
        let err = read_response_item(&mut reader, Protocol::LightClientBootstrap, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Io(_)));
    }

    #[test]
    fn test_json_codec_checks_branch_depth_per_fork() {
        let spec = ChainSpec::minimal(0);
        let committee = TestCommittee::new(&spec, 1);
        let (bootstrap, _) = make_bootstrap(&spec, &committee, 8);
        let bytes = JsonPayloadCodec::encode(&bootstrap).unwrap();
        let codec = JsonPayloadCodec;

        let decoded = codec
            .decode_response(Protocol::LightClientBootstrap, ForkName::Deneb, &bytes)
            .unwrap();
        assert_eq!(decoded, ResponsePayload::Bootstrap(bootstrap));

        let err = codec
            .decode_response(Protocol::LightClientBootstrap, ForkName::Electra, &bytes)
            .unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidBranchLength {
                expected: 6,
                got: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_json_codec_gossip_and_garbage() {
        let spec = ChainSpec::minimal(0);
        let committee = TestCommittee::new(&spec, 1);
        let update = make_finality_update(&spec, &committee, 40, 32, 32);
        let bytes = JsonPayloadCodec::encode(&update).unwrap();
        let codec = JsonPayloadCodec;

        let decoded = codec
            .decode_gossip(GossipKind::FinalityUpdate, ForkName::Deneb, &bytes)
            .unwrap();
        assert_eq!(decoded.attested_slot(), 40);
        assert!(matches!(
            codec.decode_gossip(GossipKind::OptimisticUpdate, ForkName::Deneb, b"not json"),
            Err(CodecError::Malformed(_))
        ));
    }
}
