//! Kafka transport implementation.
//!
//! Producing goes through a `FutureProducer` shared by the client. Every
//! group session owns its own `StreamConsumer`; offsets are stored explicitly
//! (`enable.auto.offset.store=false`) when a claim is committed and flushed by
//! the consumer's auto-commit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    Claim, ClientSettings, ConsumerGroup, Delivery, GroupSession, OffsetCommitter, Record, Result,
    Transport, TransportClient, TransportError,
};

/// Tunables for the Kafka transport.
#[derive(Clone, Debug)]
pub struct KafkaTransportConfig {
    /// How long a synchronous send waits for the broker acknowledgement.
    pub send_timeout: Duration,
    /// How long `connect` waits for cluster metadata.
    pub metadata_timeout: Duration,
    /// Consumer session timeout.
    pub session_timeout: Duration,
}

impl Default for KafkaTransportConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            metadata_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport speaking to a Kafka cluster.
#[derive(Clone, Debug, Default)]
pub struct KafkaTransport {
    config: KafkaTransportConfig,
}

impl KafkaTransport {
    pub fn new(config: KafkaTransportConfig) -> Self {
        Self { config }
    }
}

/// Build a ClientConfig for producers.
fn build_producer_config(settings: &ClientSettings, config: &KafkaTransportConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", settings.addresses.join(","));
    client.set(
        "message.timeout.ms",
        config.send_timeout.as_millis().to_string(),
    );
    client.set("acks", "all");
    client.set("retries", "1");

    apply_security_config(&mut client, settings);
    client
}

/// Build a ClientConfig for a consumer group member.
fn build_consumer_config(
    settings: &ClientSettings,
    config: &KafkaTransportConfig,
    group_id: &str,
) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", settings.addresses.join(","));
    client.set("group.id", group_id);
    client.set("enable.auto.commit", "true");
    client.set("enable.auto.offset.store", "false");
    client.set("auto.offset.reset", "earliest");
    client.set(
        "session.timeout.ms",
        config.session_timeout.as_millis().to_string(),
    );

    apply_security_config(&mut client, settings);
    client
}

/// Apply SASL and TLS settings to a ClientConfig.
fn apply_security_config(client: &mut ClientConfig, settings: &ClientSettings) {
    let protocol = match (&settings.sasl, &settings.tls) {
        (Some(_), Some(_)) => Some("SASL_SSL"),
        (Some(_), None) => Some("SASL_PLAINTEXT"),
        (None, Some(_)) => Some("SSL"),
        (None, None) => None,
    };
    if let Some(protocol) = protocol {
        client.set("security.protocol", protocol);
    }

    if let Some(ref sasl) = settings.sasl {
        client.set("sasl.mechanism", sasl.mechanism.as_str());
        client.set("sasl.username", &sasl.username);
        client.set("sasl.password", &sasl.password);
    }

    if let Some(ref tls) = settings.tls {
        if tls.skip_verify {
            client.set("enable.ssl.certificate.verification", "false");
        }
        if tls.has_client_auth() {
            if let Some(ref cert) = tls.client_cert_file {
                client.set("ssl.certificate.location", cert.display().to_string());
            }
            if let Some(ref key) = tls.client_key_file {
                client.set("ssl.key.location", key.display().to_string());
            }
            if let Some(ref ca) = tls.ca_cert_file {
                client.set("ssl.ca.location", ca.display().to_string());
            }
        }
    }
}

fn to_owned_headers(record: &Record) -> OwnedHeaders {
    record
        .headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(record.headers.len()), |acc, (k, v)| {
            acc.insert(Header {
                key: k.as_str(),
                value: Some(v.as_slice()),
            })
        })
}

fn from_owned_message(message: &OwnedMessage) -> Record {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    Record {
        topic: message.topic().to_string(),
        key: message.key().map(<[u8]>::to_vec),
        headers,
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn TransportClient>> {
        let producer: FutureProducer = build_producer_config(settings, &self.config)
            .create()
            .map_err(|e| {
                TransportError::Unavailable(format!("Failed to create Kafka producer: {}", e))
            })?;

        // librdkafka connects lazily; fetch metadata so an unreachable
        // cluster fails here rather than on the first send.
        let probe = producer.clone();
        let timeout = self.config.metadata_timeout;
        tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .map_err(|e| {
                TransportError::Unavailable(format!("Failed to reach Kafka cluster: {}", e))
            })?;

        info!(
            bootstrap_servers = %settings.addresses.join(","),
            "Connected to Kafka"
        );

        Ok(Arc::new(KafkaClient {
            producer,
            settings: settings.clone(),
            config: self.config.clone(),
        }))
    }
}

struct KafkaClient {
    producer: FutureProducer,
    settings: ClientSettings,
    config: KafkaTransportConfig,
}

#[async_trait]
impl TransportClient for KafkaClient {
    async fn send(&self, record: Record) -> Result<Delivery> {
        let headers = to_owned_headers(&record);
        let mut future_record = FutureRecord::<[u8], [u8]>::to(&record.topic)
            .payload(record.payload.as_slice())
            .headers(headers);
        if let Some(ref key) = record.key {
            future_record = future_record.key(key.as_slice());
        }

        let (partition, offset) = self
            .producer
            .send(future_record, self.config.send_timeout)
            .await
            .map_err(|(e, _)| TransportError::Produce(e.to_string()))?;

        debug!(topic = %record.topic, partition, offset, "Produced record to Kafka");
        Ok(Delivery { partition, offset })
    }

    async fn consumer_group(&self, group_id: &str) -> Result<Arc<dyn ConsumerGroup>> {
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(KafkaConsumerGroup {
            group_id: group_id.to_string(),
            client_config: build_consumer_config(&self.settings, &self.config, group_id),
            closed,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.producer
            .flush(self.config.send_timeout)
            .map_err(|e| TransportError::Produce(format!("Failed to flush producer: {}", e)))
    }
}

struct KafkaConsumerGroup {
    group_id: String,
    client_config: ClientConfig,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn join(&self, topics: &[String]) -> Result<Box<dyn GroupSession>> {
        if *self.closed.borrow() {
            return Err(TransportError::GroupClosed);
        }

        let consumer: StreamConsumer = self.client_config.create().map_err(|e| {
            TransportError::Unavailable(format!("Failed to create Kafka consumer: {}", e))
        })?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| TransportError::Consume(format!("Failed to subscribe: {}", e)))?;

        let consumer = Arc::new(consumer);
        Ok(Box::new(KafkaSession {
            committer: Arc::new(KafkaCommitter {
                consumer: Arc::clone(&consumer),
            }),
            consumer,
            closed: self.closed.subscribe(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

struct KafkaCommitter {
    consumer: Arc<StreamConsumer>,
}

impl OffsetCommitter for KafkaCommitter {
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| TransportError::Consume(e.to_string()))?;
        self.consumer
            .store_offsets(&tpl)
            .map_err(|e| TransportError::Consume(format!("Failed to store offset: {}", e)))
    }
}

struct KafkaSession {
    consumer: Arc<StreamConsumer>,
    committer: Arc<KafkaCommitter>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl GroupSession for KafkaSession {
    async fn next(&mut self) -> Option<Result<Claim>> {
        if *self.closed.borrow_and_update() {
            return None;
        }

        let message = loop {
            tokio::select! {
                _ = self.closed.changed() => return None,
                received = self.consumer.recv() => match received {
                    Ok(borrowed) => break borrowed.detach(),
                    // librdkafka recovers from these itself.
                    Err(e) if is_transient(&e) => {
                        warn!(error = %e, "Transient Kafka consume error");
                    }
                    Err(e) => return Some(Err(TransportError::Consume(e.to_string()))),
                },
            }
        };

        let record = from_owned_message(&message);
        Some(Ok(Claim::new(
            record,
            message.partition(),
            message.offset(),
            Arc::clone(&self.committer) as Arc<dyn OffsetCommitter>,
        )))
    }
}

/// Consume errors the session can ride out without rejoining.
fn is_transient(error: &KafkaError) -> bool {
    match error {
        KafkaError::MessageConsumption(code) => *code != RDKafkaErrorCode::Fatal,
        KafkaError::PartitionEOF(_) => true,
        _ => false,
    }
}
