//! Message envelope, subscription events and handlers.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::CORRELATION_ID_HEADER;
use super::{BrokerError, Result};
use crate::transport::{Claim, OffsetCommitter};

/// Error type returned by subscription handlers.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Message sent to or received from the broker.
///
/// Headers are string pairs; the body is opaque. A message handed to a
/// handler is shared read-only, so cloning is cheap (`Bytes` body).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Serialize `value` as a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value).map_err(|e| BrokerError::InvalidDataFormat(e.to_string()))?;
        Ok(Self::new(body))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.with_header(CORRELATION_ID_HEADER, correlation_id)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Correlation ID, ignoring an empty header value.
    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_ID_HEADER).filter(|id| !id.is_empty())
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Decode the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.is_empty() {
            return Err(BrokerError::EmptyMessage);
        }
        serde_json::from_slice(&self.body).map_err(|e| BrokerError::InvalidDataFormat(e.to_string()))
    }

    /// Build a reply carrying this message's headers unchanged.
    pub fn reply(&self, body: impl Into<Bytes>) -> Self {
        Self {
            headers: self.headers.clone(),
            body: body.into(),
        }
    }

    /// Build a JSON reply carrying this message's headers unchanged.
    pub fn reply_json<T: Serialize>(&self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value).map_err(|e| BrokerError::InvalidDataFormat(e.to_string()))?;
        Ok(self.reply(body))
    }

    /// Return the correlation ID, assigning a fresh UUID first if absent.
    pub(crate) fn ensure_correlation_id(&mut self) -> String {
        if let Some(id) = self.correlation_id() {
            return id.to_string();
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.headers
            .insert(CORRELATION_ID_HEADER.to_string(), id.clone());
        id
    }
}

#[derive(Clone)]
struct AckHandle {
    committer: Arc<dyn OffsetCommitter>,
    partition: i32,
    offset: i64,
}

/// A message delivered to a subscription handler.
#[derive(Clone)]
pub struct Event {
    topic: String,
    message: Arc<Message>,
    error: Option<Arc<dyn StdError + Send + Sync>>,
    ack: Option<AckHandle>,
}

impl Event {
    /// Event not bound to a transport claim. `ack` is a no-op.
    pub fn new(topic: impl Into<String>, message: Message) -> Self {
        Self {
            topic: topic.into(),
            message: Arc::new(message),
            error: None,
            ack: None,
        }
    }

    pub(crate) fn from_claim(claim: &Claim, message: Message) -> Self {
        Self {
            topic: claim.record.topic.clone(),
            message: Arc::new(message),
            error: None,
            ack: Some(AckHandle {
                committer: claim.committer(),
                partition: claim.partition,
                offset: claim.offset,
            }),
        }
    }

    pub(crate) fn with_error(mut self, error: HandlerError) -> Self {
        self.error = Some(Arc::from(error));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Mark the event as processed.
    pub fn ack(&self) -> Result<()> {
        match self.ack {
            Some(ref handle) => handle
                .committer
                .commit(&self.topic, handle.partition, handle.offset)
                .map_err(BrokerError::Transport),
            None => Ok(()),
        }
    }

    /// Handler error, set on events passed to the broker's error handler.
    pub fn error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.error.as_deref()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("topic", &self.topic)
            .field("message", &self.message)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// Handler for messages received on a subscription.
pub trait Handler: Send + Sync {
    /// Process one event.
    fn handle(&self, event: Event) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: Event) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(self(event))
    }
}
