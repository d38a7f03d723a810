//! Message broker with request/reply on top of publish/subscribe.
//!
//! This module contains:
//! - `Broker` trait: publish, request/reply and subscribe
//! - `MessageBroker`: the broker over any `Transport`
//! - `Message`, `Event`, `Handler`: what flows through subscriptions
//! - `Codec`: conversion to and from transport records
//! - `ReplyCoordinator`: correlation of replies to blocked callers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

pub mod codec;
pub mod envelope;
mod facade;
pub mod message;
pub mod options;
pub mod publisher;
pub mod reply;
pub mod subscriber;

pub use codec::{Codec, CodecError, DefaultCodec, CORRELATION_ID_HEADER};
pub use envelope::{ErrorResponse, Response, ResponseResult};
pub use facade::MessageBroker;
pub use message::{Event, Handler, HandlerError, Message};
pub use options::{
    BrokerOption, BrokerOptions, ProducerMode, PublishOptions, SaslMechanism, SaslOptions,
    SubscribeOptions, TlsOptions,
};
pub use publisher::{ProduceFailure, ProducedRecord};
pub use reply::ReplyCoordinator;
pub use subscriber::Subscriber;

use crate::config::{MessagingConfig, MessagingType};
use crate::transport::{Transport, TransportError};

// ============================================================================
// Traits
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Broker is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Invalid data format: {0}")]
    InvalidDataFormat(String),

    #[error("Message has no correlation id")]
    MissingCorrelationId,

    #[error("A request with correlation id '{0}' is already waiting")]
    DuplicateCorrelationId(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("No reply within {timeout:?}")]
    RequestTimeout { timeout: Duration },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Broker disconnected while waiting for a reply")]
    Disconnected,
}

/// Publish/subscribe broker with request/reply.
///
/// Implementations:
/// - `MessageBroker`: over any `Transport` (memory, Kafka)
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Display {
    /// Apply option overrides. After `connect`, only subscriptions created
    /// later see the change.
    fn init(&self, options: Vec<BrokerOption>) -> Result<()>;

    /// Snapshot of the current options.
    fn options(&self) -> BrokerOptions;

    /// First configured transport address.
    fn address(&self) -> String;

    /// Connect the transport client and producer. No-op when connected.
    async fn connect(&self) -> Result<()>;

    /// Close subscriptions, producer and client. Callers blocked in
    /// `publish_and_receive` get `BrokerError::Disconnected`.
    async fn disconnect(&self) -> Result<()>;

    /// Publish `message` to `topic`.
    ///
    /// With the sync producer this waits for the transport acknowledgement;
    /// with the async producer it returns once the record is queued.
    async fn publish(&self, topic: &str, message: Message, options: PublishOptions) -> Result<()>;

    /// Publish a request and wait for the reply carrying its correlation ID.
    async fn publish_and_receive(
        &self,
        topic: &str,
        message: Message,
        options: PublishOptions,
    ) -> Result<Message>;

    /// Start consuming `topic`, passing each message to `handler`.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscriber>>;
}

// ============================================================================
// Factory
// ============================================================================

/// Build a broker for the configured transport.
///
/// Requires the corresponding feature to be enabled:
/// - Memory: `--features channel` (included in default)
/// - Kafka: `--features kafka`
pub fn init_broker(config: &MessagingConfig) -> Result<MessageBroker> {
    let options = config
        .kafka
        .to_broker_options()
        .map_err(|e| BrokerError::Configuration(e.to_string()))?;
    let transport = transport_for(&config.messaging_type)?;
    info!(transport = transport.name(), "Broker initialized");
    Ok(MessageBroker::new(transport, options))
}

fn transport_for(messaging_type: &MessagingType) -> Result<Arc<dyn Transport>> {
    match messaging_type {
        MessagingType::Memory => {
            #[cfg(feature = "channel")]
            {
                Ok(Arc::new(crate::transport::MemoryTransport::new()))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err(BrokerError::Configuration(
                    "Memory transport requires the 'channel' feature. Rebuild with --features channel"
                        .to_string(),
                ))
            }
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                Ok(Arc::new(crate::transport::KafkaTransport::default()))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err(BrokerError::Configuration(
                    "Kafka transport requires the 'kafka' feature. Rebuild with --features kafka"
                        .to_string(),
                ))
            }
        }
    }
}
