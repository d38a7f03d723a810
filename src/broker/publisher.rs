//! Sync and async producing.
//!
//! Exactly one producer runs per connection. The async producer drains a
//! bounded queue on a background task; results travel over side channels that
//! forwarding tasks empty into the sinks registered in `BrokerOptions`.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::options::{BrokerOptions, ProducerMode};
use super::{BrokerError, Result};
use crate::transport::{Delivery, Record, TransportClient, TransportError};

/// A record the async producer failed to deliver.
#[derive(Debug, Clone)]
pub struct ProduceFailure {
    pub record: Record,
    pub error: TransportError,
}

/// A record the async producer delivered.
#[derive(Debug, Clone)]
pub struct ProducedRecord {
    pub record: Record,
    pub delivery: Delivery,
}

pub(crate) enum Producer {
    Sync(Arc<dyn TransportClient>),
    Async(AsyncProducer),
}

impl Producer {
    /// Start the producer selected by `options`.
    pub(crate) fn start(client: Arc<dyn TransportClient>, options: &BrokerOptions) -> Result<Self> {
        match options.producer {
            ProducerMode::Sync => Ok(Self::Sync(client)),
            ProducerMode::Async => {
                let errors = options.async_errors.clone().ok_or_else(|| {
                    BrokerError::Configuration(
                        "async producer requires an error sink".to_string(),
                    )
                })?;
                if options.async_queue_capacity == 0 {
                    return Err(BrokerError::Configuration(
                        "async producer queue capacity must be positive".to_string(),
                    ));
                }
                Ok(Self::Async(AsyncProducer::spawn(
                    client,
                    options.async_queue_capacity,
                    errors,
                    options.async_successes.clone(),
                )))
            }
        }
    }

    pub(crate) async fn publish(&self, record: Record) -> Result<()> {
        match self {
            Self::Sync(client) => {
                let topic = record.topic.clone();
                let delivery = client.send(record).await?;
                debug!(
                    topic = %topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Published message"
                );
                Ok(())
            }
            Self::Async(producer) => producer.enqueue(record).await,
        }
    }

    /// Stop accepting records and wait for queued ones to drain.
    pub(crate) async fn close(&self) {
        if let Self::Async(producer) = self {
            producer.close().await;
        }
    }
}

pub(crate) struct AsyncProducer {
    input: Mutex<Option<mpsc::Sender<Record>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncProducer {
    fn spawn(
        client: Arc<dyn TransportClient>,
        capacity: usize,
        error_sink: mpsc::Sender<ProduceFailure>,
        success_sink: Option<mpsc::Sender<ProducedRecord>>,
    ) -> Self {
        let (input_tx, mut input_rx) = mpsc::channel::<Record>(capacity);
        let (errors_tx, errors_rx) = mpsc::channel::<ProduceFailure>(capacity);
        let successes_tx = success_sink.map(|sink| {
            let (tx, rx) = mpsc::channel::<ProducedRecord>(capacity);
            tokio::spawn(forward(rx, sink, "success"));
            tx
        });
        tokio::spawn(forward(errors_rx, error_sink, "error"));

        // Senders of the side channels live in this task, so the forwarders
        // finish once the queue is drained after close.
        let task = tokio::spawn(async move {
            while let Some(record) = input_rx.recv().await {
                match client.send(record.clone()).await {
                    Ok(delivery) => {
                        if let Some(ref tx) = successes_tx {
                            let _ = tx.send(ProducedRecord { record, delivery }).await;
                        }
                    }
                    Err(error) => {
                        warn!(topic = %record.topic, error = %error, "Async publish failed");
                        let _ = errors_tx.send(ProduceFailure { record, error }).await;
                    }
                }
            }
            debug!("Async producer stopped");
        });

        Self {
            input: Mutex::new(Some(input_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    async fn enqueue(&self, record: Record) -> Result<()> {
        let input = self
            .input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(BrokerError::NotConnected)?;
        input
            .send(record)
            .await
            .map_err(|_| BrokerError::NotConnected)
    }

    async fn close(&self) {
        self.input.lock().unwrap_or_else(|e| e.into_inner()).take();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Async producer task failed");
            }
        }
    }
}

/// Move items from a side channel into the caller's sink.
///
/// Keeps draining after the sink is dropped so the producer never stalls on
/// an unread side channel.
async fn forward<T: Send + std::fmt::Debug>(
    mut rx: mpsc::Receiver<T>,
    sink: mpsc::Sender<T>,
    kind: &'static str,
) {
    let mut sink = Some(sink);
    while let Some(item) = rx.recv().await {
        let Some(ref tx) = sink else {
            debug!(kind, item = ?item, "Dropping async producer result");
            continue;
        };
        if tx.send(item).await.is_err() {
            error!(kind, "Async producer sink closed, results will be dropped");
            sink = None;
        }
    }
}
