//! Consumer loop and subscription handles.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use backon::BackoffBuilder;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::codec::Codec;
use super::facade::BrokerInner;
use super::message::{Event, Handler};
use super::options::SubscribeOptions;
use super::Result;
use crate::transport::{Claim, ConsumerGroup, GroupSession, TransportError};
use crate::utils::retry::{rejoin_backoff, REJOIN_MAX_DELAY};

/// Handle returned by `Broker::subscribe`.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Options the subscription was created with.
    fn options(&self) -> &SubscribeOptions;

    /// Subscribed topic.
    fn topic(&self) -> &str;

    /// Stop consuming. Calling it again is a no-op.
    async fn unsubscribe(&self) -> Result<()>;
}

/// Per-topic worker that claims records from a consumer group and feeds them
/// to a handler.
pub(crate) struct ConsumerLoop {
    pub(crate) topic: String,
    pub(crate) group: Arc<dyn ConsumerGroup>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) error_handler: Option<Arc<dyn Handler>>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) auto_ack: bool,
}

impl ConsumerLoop {
    /// Join the group and spawn the loop.
    ///
    /// The first join happens before returning so that a group that cannot be
    /// joined at all fails the subscription instead of retrying forever.
    pub(crate) async fn start(self) -> Result<JoinHandle<()>> {
        let session = self.group.join(&[self.topic.clone()]).await?;
        info!(
            topic = %self.topic,
            group = %self.group.group_id(),
            "Subscribed"
        );
        Ok(tokio::spawn(self.run(session)))
    }

    async fn run(self, session: Box<dyn GroupSession>) {
        let topics = [self.topic.clone()];
        let mut delays = rejoin_backoff().build();
        let mut session = Some(session);

        loop {
            let mut current = match session.take() {
                Some(s) => s,
                None => match self.group.join(&topics).await {
                    Ok(s) => {
                        debug!(topic = %self.topic, group = %self.group.group_id(), "Rejoined consumer group");
                        s
                    }
                    Err(TransportError::GroupClosed) => break,
                    Err(e) => {
                        let delay = delays.next().unwrap_or(REJOIN_MAX_DELAY);
                        warn!(
                            topic = %self.topic,
                            group = %self.group.group_id(),
                            error = %e,
                            ?delay,
                            "Failed to rejoin consumer group"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
            };

            while let Some(next) = current.next().await {
                match next {
                    Ok(claim) => {
                        self.process(claim).await;
                        delays = rejoin_backoff().build();
                    }
                    Err(TransportError::GroupClosed) => {
                        debug!(topic = %self.topic, "Consumer group closed");
                        return;
                    }
                    Err(e) => {
                        error!(topic = %self.topic, group = %self.group.group_id(), error = %e, "Consumer error");
                        tokio::time::sleep(delays.next().unwrap_or(REJOIN_MAX_DELAY)).await;
                        break;
                    }
                }
            }
        }

        debug!(topic = %self.topic, group = %self.group.group_id(), "Consumer loop stopped");
    }

    async fn process(&self, claim: Claim) {
        if claim.record.payload.is_empty() {
            debug!(topic = %self.topic, offset = claim.offset, "Skipping empty message");
            self.skip(&claim);
            return;
        }

        let message = match self.codec.unmarshal(&claim.record) {
            Ok(m) => m,
            Err(e) => {
                error!(topic = %self.topic, offset = claim.offset, error = %e, "Failed to decode message");
                self.skip(&claim);
                return;
            }
        };

        let event = Event::from_claim(&claim, message);
        match self.handler.handle(event.clone()).await {
            Ok(()) => {
                if self.auto_ack {
                    if let Err(e) = claim.commit() {
                        error!(topic = %self.topic, offset = claim.offset, error = %e, "Failed to commit offset");
                    }
                }
            }
            Err(e) => match self.error_handler {
                Some(ref error_handler) => {
                    if let Err(he) = error_handler.handle(event.with_error(e)).await {
                        error!(topic = %self.topic, error = %he, "Error handler failed");
                    }
                }
                None => {
                    error!(
                        topic = %self.topic,
                        group = %self.group.group_id(),
                        offset = claim.offset,
                        error = %e,
                        "Handler failed"
                    );
                }
            },
        }
    }

    /// Records that can never be handled are committed under auto-ack so the
    /// group does not stall on them after a rejoin.
    fn skip(&self, claim: &Claim) {
        if self.auto_ack {
            if let Err(e) = claim.commit() {
                error!(topic = %self.topic, offset = claim.offset, error = %e, "Failed to commit offset");
            }
        }
    }
}

/// Subscription owned by a `MessageBroker`.
pub(crate) struct BrokerSubscriber {
    pub(crate) id: u64,
    pub(crate) topic: String,
    pub(crate) options: SubscribeOptions,
    pub(crate) group: Arc<dyn ConsumerGroup>,
    pub(crate) broker: Weak<BrokerInner>,
}

#[async_trait]
impl Subscriber for BrokerSubscriber {
    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.group.close().await?;
        if let Some(broker) = self.broker.upgrade() {
            broker.forget_subscriber(self.id).await;
        }
        info!(topic = %self.topic, group = %self.options.group, "Unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::codec::DefaultCodec;
    use crate::broker::message::HandlerError;
    use crate::transport::{
        ClientSettings, MemoryCluster, MemoryTransport, Record, Transport, TransportClient,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn client(cluster: &MemoryCluster) -> Arc<dyn TransportClient> {
        MemoryTransport::with_cluster(cluster.clone())
            .connect(&ClientSettings::default())
            .await
            .unwrap()
    }

    fn recording_handler(tx: mpsc::UnboundedSender<Event>) -> Arc<dyn Handler> {
        Arc::new(move |event: Event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok::<(), HandlerError>(())
            }
        })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_loop_skips_empty_and_undecodable_records() {
        let cluster = MemoryCluster::new();
        let client = client(&cluster).await;
        let group = client.consumer_group("g").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        ConsumerLoop {
            topic: "orders".to_string(),
            group: Arc::clone(&group),
            handler: recording_handler(tx),
            error_handler: None,
            codec: Arc::new(DefaultCodec),
            auto_ack: true,
        }
        .start()
        .await
        .unwrap();

        client.send(Record::new("orders", Vec::new())).await.unwrap();
        client
            .send(
                Record::new("orders", b"x".to_vec())
                    .with_header(crate::broker::codec::CORRELATION_ID_HEADER, vec![0xff]),
            )
            .await
            .unwrap();
        client.send(Record::new("orders", b"ok".to_vec())).await.unwrap();

        let event = recv(&mut rx).await;
        assert_eq!(&event.message().body[..], b"ok");
        tokio::time::timeout(Duration::from_secs(1), async {
            while cluster.committed_offset("g", "orders") != Some(3) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_goes_to_error_handler_without_commit() {
        let cluster = MemoryCluster::new();
        let client = client(&cluster).await;
        let group = client.consumer_group("g").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let failing: Arc<dyn Handler> =
            Arc::new(|_event: Event| async { Err::<(), HandlerError>("boom".into()) });

        ConsumerLoop {
            topic: "orders".to_string(),
            group: Arc::clone(&group),
            handler: failing,
            error_handler: Some(recording_handler(tx)),
            codec: Arc::new(DefaultCodec),
            auto_ack: true,
        }
        .start()
        .await
        .unwrap();

        client.send(Record::new("orders", b"x".to_vec())).await.unwrap();

        let event = recv(&mut rx).await;
        assert_eq!(event.error().map(|e| e.to_string()), Some("boom".to_string()));
        assert_eq!(cluster.committed_offset("g", "orders"), None);
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_rejoins_after_outage() {
        let cluster = MemoryCluster::new();
        let client = client(&cluster).await;
        let group = client.consumer_group("g").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        ConsumerLoop {
            topic: "orders".to_string(),
            group: Arc::clone(&group),
            handler: recording_handler(tx),
            error_handler: None,
            codec: Arc::new(DefaultCodec),
            auto_ack: true,
        }
        .start()
        .await
        .unwrap();

        cluster.set_offline(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cluster.set_offline(false);
        client
            .send(Record::new("orders", b"after".to_vec()))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&event.message().body[..], b"after");
        assert!(cluster.join_count("orders") >= 2);
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_ends_when_group_closes() {
        let cluster = MemoryCluster::new();
        let client = client(&cluster).await;
        let group = client.consumer_group("g").await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = ConsumerLoop {
            topic: "orders".to_string(),
            group: Arc::clone(&group),
            handler: recording_handler(tx),
            error_handler: None,
            codec: Arc::new(DefaultCodec),
            auto_ack: true,
        }
        .start()
        .await
        .unwrap();

        group.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_on_closed_group() {
        let cluster = MemoryCluster::new();
        let client = client(&cluster).await;
        let group = client.consumer_group("g").await.unwrap();
        group.close().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = ConsumerLoop {
            topic: "orders".to_string(),
            group,
            handler: recording_handler(tx),
            error_handler: None,
            codec: Arc::new(DefaultCodec),
            auto_ack: true,
        }
        .start()
        .await;

        assert!(matches!(
            result,
            Err(crate::broker::BrokerError::Transport(TransportError::GroupClosed))
        ));
    }
}
