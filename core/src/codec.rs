//! Payload Codec
//!
//! Encodes `Message.data` before a protocol message reaches the transport and
//! decodes it after receipt. The connection core treats this as an opaque
//! pre/post step; `JsonPayloadCodec` is the default for text transports.

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;

use crate::error::RealtimeError;
use crate::protocol::{MessageData, ProtocolMessage};

pub trait PayloadCodec: Send + Sync {
    /// Encode every payload in an outbound message in place
    fn encode(&self, message: &mut ProtocolMessage) -> Result<(), RealtimeError>;

    /// Decode every payload in an inbound message in place
    fn decode(&self, message: &mut ProtocolMessage) -> Result<(), RealtimeError>;
}

/// Leaves payloads untouched (binary transports that carry data natively)
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCodec;

impl PayloadCodec for PassthroughCodec {
    fn encode(&self, _message: &mut ProtocolMessage) -> Result<(), RealtimeError> {
        Ok(())
    }

    fn decode(&self, _message: &mut ProtocolMessage) -> Result<(), RealtimeError> {
        Ok(())
    }
}

/// JSON values become `json`-encoded strings, binary becomes `base64`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPayloadCodec;

impl JsonPayloadCodec {
    fn encode_data(
        data: &mut Option<MessageData>,
        encoding: &mut Option<String>,
    ) -> Result<(), RealtimeError> {
        let step = match data.take() {
            Some(MessageData::Json(value)) => {
                *data = Some(MessageData::Text(serde_json::to_string(&value)?));
                Some("json")
            }
            Some(MessageData::Binary(bytes)) => {
                *data = Some(MessageData::Text(general_purpose::STANDARD.encode(&bytes)));
                Some("base64")
            }
            other => {
                *data = other;
                None
            }
        };
        if let Some(step) = step {
            *encoding = Some(match encoding.take() {
                Some(existing) if !existing.is_empty() => format!("{}/{}", existing, step),
                _ => step.to_string(),
            });
        }
        Ok(())
    }

    /// Undo a single encoding step. `None` for a step this codec does not know.
    fn decode_step(step: &str, data: &MessageData) -> Result<Option<MessageData>, RealtimeError> {
        let decoded = match (step, data) {
            ("json", MessageData::Text(text)) => MessageData::Json(serde_json::from_str(text)?),
            ("base64", MessageData::Text(text)) => {
                let raw = general_purpose::STANDARD
                    .decode(text.as_bytes())
                    .map_err(|e| RealtimeError::Codec(format!("invalid base64: {}", e)))?;
                MessageData::Binary(Bytes::from(raw))
            }
            ("utf-8", MessageData::Binary(raw)) => MessageData::Text(
                String::from_utf8(raw.to_vec())
                    .map_err(|e| RealtimeError::Codec(format!("invalid utf-8: {}", e)))?,
            ),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    /// Decodes right to left. On failure `data` keeps the last good layer and
    /// `encoding` the steps still applied to it.
    fn decode_data(
        data: &mut Option<MessageData>,
        encoding: &mut Option<String>,
    ) -> Result<(), RealtimeError> {
        let Some(chain) = encoding.take() else {
            return Ok(());
        };
        let mut steps: Vec<&str> = chain.split('/').filter(|s| !s.is_empty()).collect();
        let mut result = Ok(());

        while let Some(step) = steps.last().copied() {
            let Some(current) = data.as_ref() else {
                break;
            };
            match Self::decode_step(step, current) {
                Ok(Some(decoded)) => {
                    *data = Some(decoded);
                    steps.pop();
                }
                Ok(None) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if !steps.is_empty() {
            *encoding = Some(steps.join("/"));
        }
        result
    }
}

impl PayloadCodec for JsonPayloadCodec {
    fn encode(&self, message: &mut ProtocolMessage) -> Result<(), RealtimeError> {
        for msg in &mut message.messages {
            Self::encode_data(&mut msg.data, &mut msg.encoding)?;
        }
        for presence in &mut message.presence {
            Self::encode_data(&mut presence.data, &mut presence.encoding)?;
        }
        Ok(())
    }

    fn decode(&self, message: &mut ProtocolMessage) -> Result<(), RealtimeError> {
        // A bad payload must not stop the others from decoding
        let mut first_error = None;
        let payloads = message
            .messages
            .iter_mut()
            .map(|m| (&mut m.data, &mut m.encoding))
            .chain(message.presence.iter_mut().map(|p| (&mut p.data, &mut p.encoding)));
        for (data, encoding) in payloads {
            if let Err(e) = Self::decode_data(data, encoding) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
