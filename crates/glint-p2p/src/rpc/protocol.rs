//! Request/response protocol identifiers and request bodies.

use glint_core::types::beacon::{Root, MAX_REQUEST_LIGHT_CLIENT_UPDATES};
use serde::{Deserialize, Serialize};

const PROTOCOL_PREFIX: &str = "/eth2/beacon_chain/req";
const ENCODING: &str = "ssz_snappy";

/// The methods the light client speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    LightClientBootstrap,
    LightClientUpdatesByRange,
    LightClientFinalityUpdate,
    LightClientOptimisticUpdate,
    Ping,
}

/// How many response items a method produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseShape {
    ExactlyOne,
    /// Up to the count in the request.
    Range,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::LightClientBootstrap,
        Protocol::LightClientUpdatesByRange,
        Protocol::LightClientFinalityUpdate,
        Protocol::LightClientOptimisticUpdate,
        Protocol::Ping,
    ];

    pub fn method_name(&self) -> &'static str {
        match self {
            Protocol::LightClientBootstrap => "light_client_bootstrap",
            Protocol::LightClientUpdatesByRange => "light_client_updates_by_range",
            Protocol::LightClientFinalityUpdate => "light_client_finality_update",
            Protocol::LightClientOptimisticUpdate => "light_client_optimistic_update",
            Protocol::Ping => "ping",
        }
    }

    pub fn version(&self) -> u8 {
        1
    }

    /// Full protocol id, e.g. `/eth2/beacon_chain/req/ping/1/ssz_snappy`.
    pub fn protocol_id(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            PROTOCOL_PREFIX,
            self.method_name(),
            self.version(),
            ENCODING
        )
    }

    pub fn from_protocol_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|protocol| protocol.protocol_id() == id)
    }

    /// Sync cannot progress without these; peers that don't serve them are penalized.
    pub fn is_load_bearing(&self) -> bool {
        !matches!(self, Protocol::Ping)
    }

    pub fn response_shape(&self) -> ResponseShape {
        match self {
            Protocol::LightClientUpdatesByRange => ResponseShape::Range,
            _ => ResponseShape::ExactlyOne,
        }
    }

    /// Successful response items carry a 4-byte fork digest before the payload.
    pub fn has_context_bytes(&self) -> bool {
        !matches!(self, Protocol::Ping)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.method_name())
    }
}

/// An outbound request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Bootstrap { block_root: Root },
    UpdatesByRange { start_period: u64, count: u64 },
    FinalityUpdate,
    OptimisticUpdate,
    Ping { seq_number: u64 },
}

impl Request {
    /// A range request, with `count` clamped to what a server will serve.
    pub fn updates_by_range(start_period: u64, count: u64) -> Self {
        Request::UpdatesByRange {
            start_period,
            count: count.clamp(1, MAX_REQUEST_LIGHT_CLIENT_UPDATES),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Request::Bootstrap { .. } => Protocol::LightClientBootstrap,
            Request::UpdatesByRange { .. } => Protocol::LightClientUpdatesByRange,
            Request::FinalityUpdate => Protocol::LightClientFinalityUpdate,
            Request::OptimisticUpdate => Protocol::LightClientOptimisticUpdate,
            Request::Ping { .. } => Protocol::Ping,
        }
    }

    /// Most response items the request can legitimately produce.
    pub fn max_items(&self) -> u64 {
        match self {
            Request::UpdatesByRange { count, .. } => (*count).min(MAX_REQUEST_LIGHT_CLIENT_UPDATES),
            _ => 1,
        }
    }

    /// Fixed-layout request body: a root, two little-endian u64s, one u64, or nothing.
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Request::Bootstrap { block_root } => block_root.to_vec(),
            Request::UpdatesByRange {
                start_period,
                count,
            } => {
                let mut body = Vec::with_capacity(16);
                body.extend_from_slice(&start_period.to_le_bytes());
                body.extend_from_slice(&count.to_le_bytes());
                body
            }
            Request::FinalityUpdate | Request::OptimisticUpdate => Vec::new(),
            Request::Ping { seq_number } => seq_number.to_le_bytes().to_vec(),
        }
    }

    /// Parse a request body for `protocol`. Used by serving peers and tests.
    pub fn decode_body(protocol: Protocol, body: &[u8]) -> Option<Self> {
        let u64_at = |offset: usize| -> Option<u64> {
            let bytes: [u8; 8] = body.get(offset..offset + 8)?.try_into().ok()?;
            Some(u64::from_le_bytes(bytes))
        };
        match protocol {
            Protocol::LightClientBootstrap if body.len() == 32 => {
                let mut block_root = [0u8; 32];
                block_root.copy_from_slice(body);
                Some(Request::Bootstrap { block_root })
            }
            Protocol::LightClientUpdatesByRange if body.len() == 16 => Some(Request::UpdatesByRange {
                start_period: u64_at(0)?,
                count: u64_at(8)?,
            }),
            Protocol::LightClientFinalityUpdate if body.is_empty() => Some(Request::FinalityUpdate),
            Protocol::LightClientOptimisticUpdate if body.is_empty() => {
                Some(Request::OptimisticUpdate)
            }
            Protocol::Ping if body.len() == 8 => Some(Request::Ping {
                seq_number: u64_at(0)?,
            }),
            _ => None,
        }
    }
}

/// Status byte leading every response item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    InvalidRequest,
    ServerError,
    ResourceUnavailable,
}

impl ResponseCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ResponseCode::Success),
            1 => Some(ResponseCode::InvalidRequest),
            2 => Some(ResponseCode::ServerError),
            3 => Some(ResponseCode::ResourceUnavailable),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::InvalidRequest => 1,
            ResponseCode::ServerError => 2,
            ResponseCode::ResourceUnavailable => 3,
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResponseCode::Success => "success",
            ResponseCode::InvalidRequest => "invalid request",
            ResponseCode::ServerError => "server error",
            ResponseCode::ResourceUnavailable => "resource unavailable",
        };
        f.write_str(name)
    }
}
