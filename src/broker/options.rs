//! Broker, publish and subscribe options.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::message::Handler;
use super::publisher::{ProduceFailure, ProducedRecord};
pub use crate::transport::{SaslMechanism, SaslOptions, TlsOptions};

/// Address used when none is configured.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9092";
/// Default time `publish_and_receive` waits for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);
/// Default capacity of the async producer input queue.
pub const DEFAULT_ASYNC_QUEUE_CAPACITY: usize = 1024;
/// Suffix appended to a request topic to derive its reply topic.
pub const REPLY_TOPIC_SUFFIX: &str = ".reply";

/// Which producer the broker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProducerMode {
    /// `publish` waits for the transport acknowledgement.
    #[default]
    Sync,
    /// `publish` enqueues; failures go to the async error sink.
    Async,
}

/// Broker-wide configuration.
#[derive(Clone)]
pub struct BrokerOptions {
    /// Transport addresses. Empty entries are ignored.
    pub addresses: Vec<String>,
    /// Receives events whose handler failed. Failures are logged when unset.
    pub error_handler: Option<Arc<dyn Handler>>,
    pub tls: Option<TlsOptions>,
    pub sasl: Option<SaslOptions>,
    pub producer: ProducerMode,
    /// Required in `ProducerMode::Async`.
    pub async_errors: Option<mpsc::Sender<ProduceFailure>>,
    pub async_successes: Option<mpsc::Sender<ProducedRecord>>,
    pub async_queue_capacity: usize,
    /// Default wait for `publish_and_receive`.
    pub reply_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            error_handler: None,
            tls: None,
            sasl: None,
            producer: ProducerMode::Sync,
            async_errors: None,
            async_successes: None,
            async_queue_capacity: DEFAULT_ASYNC_QUEUE_CAPACITY,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

impl BrokerOptions {
    pub fn with_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_sasl(mut self, sasl: SaslOptions) -> Self {
        self.sasl = Some(sasl);
        self
    }

    /// Switch to the async producer, reporting failures to `errors`.
    pub fn with_async_producer(mut self, errors: mpsc::Sender<ProduceFailure>) -> Self {
        self.producer = ProducerMode::Async;
        self.async_errors = Some(errors);
        self
    }

    pub fn with_async_successes(mut self, successes: mpsc::Sender<ProducedRecord>) -> Self {
        self.async_successes = Some(successes);
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Configured addresses without blanks, or the default address.
    pub fn resolved_addresses(&self) -> Vec<String> {
        let addresses: Vec<String> = self
            .addresses
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        if addresses.is_empty() {
            vec![DEFAULT_ADDRESS.to_string()]
        } else {
            addresses
        }
    }
}

impl std::fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("addresses", &self.addresses)
            .field("error_handler", &self.error_handler.is_some())
            .field("tls", &self.tls)
            .field("sasl", &self.sasl)
            .field("producer", &self.producer)
            .field("async_queue_capacity", &self.async_queue_capacity)
            .field("reply_timeout", &self.reply_timeout)
            .finish()
    }
}

/// A single override applied by `Broker::init`.
pub enum BrokerOption {
    Addresses(Vec<String>),
    ErrorHandler(Arc<dyn Handler>),
    Tls(TlsOptions),
    Sasl(SaslOptions),
    AsyncProducer(mpsc::Sender<ProduceFailure>),
    AsyncSuccesses(mpsc::Sender<ProducedRecord>),
    ReplyTimeout(Duration),
}

impl BrokerOption {
    pub(crate) fn apply(self, options: &mut BrokerOptions) {
        match self {
            Self::Addresses(addresses) => options.addresses = addresses,
            Self::ErrorHandler(handler) => options.error_handler = Some(handler),
            Self::Tls(tls) => options.tls = Some(tls),
            Self::Sasl(sasl) => options.sasl = Some(sasl),
            Self::AsyncProducer(errors) => {
                options.producer = ProducerMode::Async;
                options.async_errors = Some(errors);
            }
            Self::AsyncSuccesses(successes) => options.async_successes = Some(successes),
            Self::ReplyTimeout(timeout) => options.reply_timeout = timeout,
        }
    }
}

/// Per-call options for `publish` and `publish_and_receive`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Reply wait; the broker's `reply_timeout` when unset.
    pub timeout: Option<Duration>,
    /// Reply topic; `<topic>.reply` when unset.
    pub reply_to_topic: Option<String>,
    /// Shared consumer group for the reply topic. Needed when several
    /// instances wait on the same reply topic.
    pub reply_consumer_group: Option<String>,
    /// Abandons the wait when cancelled.
    pub cancel: Option<CancellationToken>,
    /// Partition key.
    pub key: Option<Vec<u8>>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_reply_to_topic(mut self, topic: impl Into<String>) -> Self {
        self.reply_to_topic = Some(topic.into());
        self
    }

    pub fn with_reply_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.reply_consumer_group = Some(group.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Reply topic for a request sent to `topic`.
    pub fn reply_topic_for(&self, topic: &str) -> String {
        self.reply_to_topic
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("{}{}", topic, REPLY_TOPIC_SUFFIX))
    }
}

/// Per-subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Consumer group. A fresh UUID by default, so each subscription
    /// consumes independently.
    pub group: String,
    /// Acknowledge automatically when the handler succeeds.
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            group: uuid::Uuid::new_v4().to_string(),
            auto_ack: true,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }
}
