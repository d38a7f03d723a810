//! Conversion between broker messages and transport records.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::warn;

use super::message::Message;
use crate::transport::Record;

/// Header carrying the request/reply correlation identifier.
pub const CORRELATION_ID_HEADER: &str = "correlationId";

/// Errors raised while converting messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Header '{0}' is not valid UTF-8")]
    InvalidHeader(String),
}

/// Converts between `Message` and the transport's `Record`.
pub trait Codec: Send + Sync {
    /// Encode `message` for `topic`. The record always carries a
    /// correlation ID header.
    fn marshal(&self, topic: &str, message: &Message) -> Result<Record, CodecError>;

    /// Decode a consumed record.
    fn unmarshal(&self, record: &Record) -> Result<Message, CodecError>;
}

/// Headers map one-to-one onto record headers; the body is the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

impl Codec for DefaultCodec {
    fn marshal(&self, topic: &str, message: &Message) -> Result<Record, CodecError> {
        let mut headers: Vec<(String, Vec<u8>)> = message
            .headers
            .iter()
            .filter(|(k, v)| k.as_str() != CORRELATION_ID_HEADER || !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone().into_bytes()))
            .collect();

        if message.correlation_id().is_none() {
            headers.push((
                CORRELATION_ID_HEADER.to_string(),
                uuid::Uuid::new_v4().to_string().into_bytes(),
            ));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Record {
            topic: topic.to_string(),
            key: None,
            headers,
            payload: message.body.to_vec(),
        })
    }

    fn unmarshal(&self, record: &Record) -> Result<Message, CodecError> {
        let mut headers = HashMap::with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            let value = match std::str::from_utf8(value) {
                Ok(v) => v.to_string(),
                // A mangled correlation ID would match the wrong waiter.
                Err(_) if key == CORRELATION_ID_HEADER => {
                    return Err(CodecError::InvalidHeader(key.clone()));
                }
                Err(_) => {
                    warn!(topic = %record.topic, header = %key, "Header is not valid UTF-8, decoding lossily");
                    String::from_utf8_lossy(value).into_owned()
                }
            };
            headers.insert(key.clone(), value);
        }

        Ok(Message {
            headers,
            body: Bytes::copy_from_slice(&record.payload),
        })
    }
}
