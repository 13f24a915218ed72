//! Wire codec for the channel envelope.
//!
//! Every transport message is one JSON object tagged by `kind`:
//!
//! ```text
//! {"kind":"client","clientId":"CLIENT_ID_..."}
//! {"kind":"heartbeat","clientId":"CLIENT_ID_..."}
//! {"kind":"open","id":"C1:RPCService","path":"RPCService"}
//! {"kind":"ready","id":"C1:RPCService"}
//! {"kind":"data","id":"C1:RPCService","content":"..."}
//! {"kind":"close","id":"C1:RPCService","code":1000,"reason":"bye"}
//! ```

use crate::{MuxError, Result};
use serde::{Deserialize, Serialize};

/// Tagged message unit exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    /// Announces the client id, once per transport open.
    #[serde(rename_all = "camelCase")]
    Client { client_id: String },

    /// Idle liveness pulse.
    #[serde(rename_all = "camelCase")]
    Heartbeat { client_id: String },

    /// Requests that the peer open the channel `id` for `path`.
    Open { id: String, path: String },

    /// Peer acknowledgement of `Open`; moves the channel to `Open`.
    Ready { id: String },

    /// Opaque channel payload.
    Data { id: String, content: String },

    /// Channel closed on the sending side.
    Close {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Envelope {
    /// Channel id for channel-scoped kinds.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Envelope::Client { .. } | Envelope::Heartbeat { .. } => None,
            Envelope::Open { id, .. }
            | Envelope::Ready { id }
            | Envelope::Data { id, .. }
            | Envelope::Close { id, .. } => Some(id.as_str()),
        }
    }

    /// Wire name of the envelope kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Client { .. } => "client",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::Open { .. } => "open",
            Envelope::Ready { .. } => "ready",
            Envelope::Data { .. } => "data",
            Envelope::Close { .. } => "close",
        }
    }
}

/// Serialize an envelope to its wire text.
pub fn encode(envelope: &Envelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parse wire text into an envelope.
///
/// Returns `MuxError::Protocol` for anything that is not a well-formed
/// envelope; callers log and drop it.
pub fn decode(text: &str) -> Result<Envelope> {
    serde_json::from_str(text).map_err(|e| MuxError::Protocol {
        message: format!("malformed envelope: {}", e),
    })
}
