//! Client → server messages of the conversation channels.
//!
//! Every client frame is a JSON text message:
//!
//! ```json
//! {"seq": 2, "total": 3, "data": "<base64>"}                  // audio channel packet
//! {"type": "image", "seq": 1, "total": 4, "data": "<base64>"} // multimodal packet
//! {"type": "end"}                                             // finalize the upload
//! {"type": "cancel"}                                          // abandon the current turn
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Deserialize;

use crate::core::reassembly::{Channel, Packet};
use crate::session::PipelineError;

/// Raw frame shape; every field is optional so malformed input can be
/// reported field by field instead of as a single parse error.
#[derive(Debug, Default, Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    seq: Option<i64>,
    total: Option<i64>,
    data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Packet(Packet),
    End,
    Cancel,
}

fn field_u32(name: &str, value: Option<i64>) -> Result<u32, PipelineError> {
    let value = value.ok_or_else(|| PipelineError::Malformed(format!("Missing '{name}'")))?;
    u32::try_from(value)
        .map_err(|_| PipelineError::Malformed(format!("'{name}' must be a non-negative integer")))
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, PipelineError> {
    let raw: RawClientMessage = serde_json::from_str(text)
        .map_err(|e| PipelineError::Malformed(format!("Invalid JSON message: {e}")))?;

    let channel = match raw.kind.as_deref() {
        Some("end") => return Ok(ClientMessage::End),
        Some("cancel") => return Ok(ClientMessage::Cancel),
        None | Some("audio") => Channel::Audio,
        Some("image") => Channel::Image,
        Some(other) => {
            return Err(PipelineError::Malformed(format!(
                "Unknown message type '{other}'"
            )));
        }
    };

    let seq = field_u32("seq", raw.seq)?;
    let total = field_u32("total", raw.total)?;
    let data = raw
        .data
        .ok_or_else(|| PipelineError::Malformed("Missing 'data'".to_string()))?;
    let payload = STANDARD
        .decode(data.as_bytes())
        .map_err(|e| PipelineError::Malformed(format!("'data' is not valid base64: {e}")))?;

    Ok(ClientMessage::Packet(Packet {
        channel,
        seq,
        total,
        payload: Bytes::from(payload),
    }))
}
