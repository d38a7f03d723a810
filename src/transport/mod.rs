//! Transport boundary for the broker.
//!
//! The broker never talks to a message queue directly. Everything it needs
//! from the underlying system is expressed by the traits in this module:
//! - `Transport`: opens a client connection
//! - `TransportClient`: synchronous produce, consumer groups, close
//! - `ConsumerGroup` / `GroupSession`: join a group and claim records
//!
//! Implementations: in-memory (`channel` feature), Kafka (`kafka` feature).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "channel")]
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
#[cfg(feature = "channel")]
pub use memory::{MemoryCluster, MemoryTransport};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Consumer group was closed")]
    GroupClosed,

    #[error("Operation not supported by this transport: {0}")]
    Unsupported(String),
}

/// Wire-level message as seen by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Destination (producing) or source (consuming) topic.
    pub topic: String,
    /// Optional partition key.
    pub key: Option<Vec<u8>>,
    /// Header list in wire order. Keys may repeat on the wire.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            headers: Vec::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Last value of a header, if present.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}

/// SASL mechanism for authenticated clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    /// Wire name of the mechanism.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SASL credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslOptions {
    pub username: String,
    pub password: String,
    pub mechanism: SaslMechanism,
}

impl std::fmt::Debug for SaslOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslOptions")
            .field("username", &self.username)
            .field("password", &"***")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// TLS material for the transport connection.
///
/// Client certificate, key and CA are only used when all three are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
    pub skip_verify: bool,
}

impl TlsOptions {
    /// Whether mutual TLS material is fully configured.
    pub fn has_client_auth(&self) -> bool {
        self.client_cert_file.is_some()
            && self.client_key_file.is_some()
            && self.ca_cert_file.is_some()
    }

    /// Paths of configured material files that do not exist.
    pub fn missing_files(&self) -> Vec<PathBuf> {
        if !self.has_client_auth() {
            return Vec::new();
        }
        [
            &self.client_cert_file,
            &self.client_key_file,
            &self.ca_cert_file,
        ]
        .into_iter()
        .flatten()
        .filter(|p| !p.exists())
        .cloned()
        .collect()
    }
}

/// Everything a transport needs to open a client.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub addresses: Vec<String>,
    pub sasl: Option<SaslOptions>,
    pub tls: Option<TlsOptions>,
}

/// Where a produced record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Marks claimed offsets as consumed for a consumer group.
pub trait OffsetCommitter: Send + Sync {
    /// Mark `offset` on `topic`/`partition` as processed. The next session
    /// of the group resumes after it.
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

/// A record claimed by one member of a consumer group.
#[derive(Clone)]
pub struct Claim {
    pub record: Record,
    pub partition: i32,
    pub offset: i64,
    committer: Arc<dyn OffsetCommitter>,
}

impl Claim {
    pub fn new(
        record: Record,
        partition: i32,
        offset: i64,
        committer: Arc<dyn OffsetCommitter>,
    ) -> Self {
        Self {
            record,
            partition,
            offset,
            committer,
        }
    }

    /// Acknowledge this record to the transport.
    pub fn commit(&self) -> Result<()> {
        self.committer
            .commit(&self.record.topic, self.partition, self.offset)
    }

    pub(crate) fn committer(&self) -> Arc<dyn OffsetCommitter> {
        Arc::clone(&self.committer)
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("record", &self.record)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .finish()
    }
}

/// A live membership in a consumer group.
///
/// `next` yields claimed records until the session ends. `None` means the
/// session is over (rebalance or close); callers rejoin the group.
#[async_trait]
pub trait GroupSession: Send {
    async fn next(&mut self) -> Option<Result<Claim>>;
}

/// Named consumer group handle.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Group identity.
    fn group_id(&self) -> &str;

    /// Join the group for `topics` and open a claim session.
    ///
    /// Returns `TransportError::GroupClosed` once `close` has been called.
    async fn join(&self, topics: &[String]) -> Result<Box<dyn GroupSession>>;

    /// Leave the group. Open sessions end and further joins fail.
    async fn close(&self) -> Result<()>;
}

/// Connected client of a transport.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Produce a record and wait for the transport's acknowledgement.
    async fn send(&self, record: Record) -> Result<Delivery>;

    /// Create a consumer group handle. No membership is taken until `join`.
    async fn consumer_group(&self, group_id: &str) -> Result<Arc<dyn ConsumerGroup>>;

    /// Release the client.
    async fn close(&self) -> Result<()>;
}

/// Factory for transport clients.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Open a client.
    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn TransportClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_last_value_wins() {
        let record = Record::new("orders", b"body".to_vec())
            .with_header("k", b"first".to_vec())
            .with_header("k", b"second".to_vec());

        assert_eq!(record.header("k"), Some(&b"second"[..]));
        assert_eq!(record.header("missing"), None);
    }

    #[test]
    fn test_tls_missing_files_only_checked_for_client_auth() {
        let partial = TlsOptions {
            client_cert_file: Some("/does/not/exist.crt".into()),
            ..Default::default()
        };
        assert!(partial.missing_files().is_empty());

        let full = TlsOptions {
            client_cert_file: Some("/does/not/exist.crt".into()),
            client_key_file: Some("/does/not/exist.key".into()),
            ca_cert_file: Some("/does/not/exist-ca.crt".into()),
            skip_verify: false,
        };
        assert_eq!(full.missing_files().len(), 3);
    }

    #[test]
    fn test_sasl_debug_hides_password() {
        let sasl = SaslOptions {
            username: "user".to_string(),
            password: "secret".to_string(),
            mechanism: SaslMechanism::ScramSha512,
        };
        let rendered = format!("{:?}", sasl);
        assert!(!rendered.contains("secret"));
        assert_eq!(sasl.mechanism.as_str(), "SCRAM-SHA-512");
    }

    #[test]
    fn test_record_key() {
        let record = Record::new("orders", Vec::new()).with_key("root-1");
        assert_eq!(record.key.as_deref(), Some(&b"root-1"[..]));
    }
}
