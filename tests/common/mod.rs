//! Shared utilities for integration tests.
//!
//! Brokers here run on the in-memory transport, so tests need no external
//! services.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relaykit::broker::{Broker, BrokerOptions, Event, HandlerError, MessageBroker};
use relaykit::transport::{
    ClientSettings, ConsumerGroup, Delivery, MemoryCluster, MemoryTransport, Record, Transport,
    TransportClient, TransportError,
};
use relaykit::{PublishOptions, SubscribeOptions};

pub const SQUARE_TOPIC: &str = "square.request";

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SquareRequest {
    #[serde(rename = "Number")]
    pub number: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SquareResponse {
    #[serde(rename = "Result")]
    pub result: f64,
}

/// Connected broker on `cluster`.
pub async fn connected_broker(cluster: &MemoryCluster, options: BrokerOptions) -> MessageBroker {
    let broker = MessageBroker::new(
        Arc::new(MemoryTransport::with_cluster(cluster.clone())),
        options,
    );
    broker.connect().await.unwrap();
    broker
}

/// Subscribe a responder that squares `Number` and replies on
/// `<topic>.reply`, or on `reply_topic` when given.
pub async fn start_square_responder(broker: &MessageBroker, reply_topic: Option<&str>) {
    let responder = broker.clone();
    let reply_topic = reply_topic.map(str::to_string);
    broker
        .subscribe(
            SQUARE_TOPIC,
            Arc::new(move |event: Event| {
                let broker = responder.clone();
                let reply_topic = reply_topic
                    .clone()
                    .unwrap_or_else(|| format!("{}.reply", event.topic()));
                async move {
                    let request: SquareRequest = event.message().decode()?;
                    let n = request.number as f64;
                    let reply = event
                        .message()
                        .reply_json(&SquareResponse { result: n * n })?;
                    broker
                        .publish(&reply_topic, reply, PublishOptions::new())
                        .await?;
                    Ok::<(), HandlerError>(())
                }
            }),
            SubscribeOptions::new().with_group("square-responders"),
        )
        .await
        .unwrap();
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Await `future`, failing the test if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .unwrap_or_else(|_| panic!("operation did not finish within {:?}", timeout))
}

/// Memory transport whose clients can produce but never consume.
pub struct ProduceOnlyTransport {
    inner: MemoryTransport,
}

impl ProduceOnlyTransport {
    pub fn new(cluster: &MemoryCluster) -> Self {
        Self {
            inner: MemoryTransport::with_cluster(cluster.clone()),
        }
    }
}

#[async_trait]
impl Transport for ProduceOnlyTransport {
    fn name(&self) -> &'static str {
        "produce-only"
    }

    async fn connect(
        &self,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        Ok(Arc::new(ProduceOnlyClient {
            inner: self.inner.connect(settings).await?,
        }))
    }
}

struct ProduceOnlyClient {
    inner: Arc<dyn TransportClient>,
}

#[async_trait]
impl TransportClient for ProduceOnlyClient {
    async fn send(&self, record: Record) -> Result<Delivery, TransportError> {
        self.inner.send(record).await
    }

    async fn consumer_group(
        &self,
        _group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, TransportError> {
        // Give concurrent callers time to share the pending subscription.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(TransportError::Consume("consumer groups disabled".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
