//! `MessageBroker`: the broker over a `Transport`.
//!
//! Connection lifecycle is `created -> connected -> disconnected`, guarded by
//! a single async mutex. Request/reply state lives in the `ReplyCoordinator`
//! and is reset on connect and disconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::{Codec, DefaultCodec};
use super::message::{Handler, Message};
use super::options::{BrokerOption, BrokerOptions, PublishOptions, SubscribeOptions};
use super::publisher::Producer;
use super::reply::{ReplyCoordinator, ReplyDispatcher, RouteEntry, RouteState, Waiter};
use super::subscriber::{BrokerSubscriber, ConsumerLoop, Subscriber};
use super::{Broker, BrokerError, Result};
use crate::transport::{ClientSettings, ConsumerGroup, Transport, TransportClient};

#[derive(Default)]
struct ConnectionState {
    client: Option<Arc<dyn TransportClient>>,
    producer: Option<Arc<Producer>>,
    subscribers: HashMap<u64, Arc<dyn ConsumerGroup>>,
}

pub(crate) struct BrokerInner {
    options: RwLock<BrokerOptions>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    state: Mutex<ConnectionState>,
    replies: Arc<ReplyCoordinator>,
    next_subscriber_id: AtomicU64,
}

impl BrokerInner {
    fn read_options(&self) -> BrokerOptions {
        self.options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn client(&self) -> Result<Arc<dyn TransportClient>> {
        self.state
            .lock()
            .await
            .client
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    async fn producer(&self) -> Result<Arc<Producer>> {
        self.state
            .lock()
            .await
            .producer
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    async fn send(&self, topic: &str, message: &Message, key: Option<Vec<u8>>) -> Result<()> {
        let producer = self.producer().await?;
        let mut record = self.codec.marshal(topic, message)?;
        record.key = key;
        producer.publish(record).await
    }

    async fn subscribe(
        self: &Arc<Self>,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Result<BrokerSubscriber> {
        let started = Instant::now();
        let client = self.client().await?;
        let group = client.consumer_group(&options.group).await?;

        let consumer = ConsumerLoop {
            topic: topic.to_string(),
            group: Arc::clone(&group),
            handler,
            error_handler: self.read_options().error_handler,
            codec: Arc::clone(&self.codec),
            auto_ack: options.auto_ack,
        };
        if let Err(e) = consumer.start().await {
            let _ = group.close().await;
            return Err(e);
        }

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock().await;
            if state.client.is_none() {
                drop(state);
                let _ = group.close().await;
                return Err(BrokerError::NotConnected);
            }
            state.subscribers.insert(id, Arc::clone(&group));
        }

        info!(
            topic = %topic,
            group = %options.group,
            duration_ms = started.elapsed().as_millis() as u64,
            "Subscription established"
        );

        Ok(BrokerSubscriber {
            id,
            topic: topic.to_string(),
            options,
            group,
            broker: Arc::downgrade(self),
        })
    }

    pub(crate) async fn forget_subscriber(&self, id: u64) {
        self.state.lock().await.subscribers.remove(&id);
    }

    /// Subscription state of `topic`, subscribing in the background if no
    /// request has used it yet.
    fn reply_route(
        self: &Arc<Self>,
        topic: &str,
        group: Option<String>,
    ) -> watch::Receiver<RouteState> {
        let (id, state, watch) = match self.replies.route(topic) {
            RouteEntry::Existing(watch) => return watch,
            RouteEntry::Created { id, state, watch } => (id, state, watch),
        };

        let inner = Arc::clone(self);
        let topic = topic.to_string();
        tokio::spawn(async move {
            let options = match group {
                Some(group) if !group.is_empty() => SubscribeOptions::new().with_group(group),
                _ => SubscribeOptions::new(),
            };
            let dispatcher = Arc::new(ReplyDispatcher {
                coordinator: Arc::clone(&inner.replies),
            });
            match inner.subscribe(&topic, dispatcher, options).await {
                Ok(_) => {
                    state.send_replace(RouteState::Ready);
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Failed to subscribe to reply topic");
                    inner.replies.route_failed(&topic, id, &state, e.to_string());
                }
            }
        });

        watch
    }

    async fn await_reply(
        &self,
        waiter: &mut Waiter<'_>,
        route: &mut watch::Receiver<RouteState>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message> {
        let failed = failure(&route.borrow_and_update());
        if let Some(reason) = failed {
            return Err(BrokerError::Subscribe(reason));
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(cancelled);
        let mut watching_route = true;

        loop {
            tokio::select! {
                reply = &mut waiter.reply => {
                    return reply.map_err(|_| BrokerError::Disconnected);
                }
                _ = &mut deadline => {
                    if waiter.abandon() {
                        return Err(BrokerError::RequestTimeout { timeout });
                    }
                    // Lost the race to a reply that is already in the slot.
                    return (&mut waiter.reply).await.map_err(|_| BrokerError::Disconnected);
                }
                _ = &mut cancelled => {
                    if waiter.abandon() {
                        return Err(BrokerError::Cancelled);
                    }
                    return (&mut waiter.reply).await.map_err(|_| BrokerError::Disconnected);
                }
                changed = route.changed(), if watching_route => {
                    if changed.is_err() {
                        watching_route = false;
                        continue;
                    }
                    let failed = failure(&route.borrow_and_update());
                    if let Some(reason) = failed {
                        return Err(BrokerError::Subscribe(reason));
                    }
                }
            }
        }
    }
}

fn failure(state: &RouteState) -> Option<String> {
    match state {
        RouteState::Failed(reason) => Some(reason.clone()),
        RouteState::Pending | RouteState::Ready => None,
    }
}

/// Broker over any `Transport`.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl MessageBroker {
    /// Broker using the default codec.
    pub fn new(transport: Arc<dyn Transport>, options: BrokerOptions) -> Self {
        Self::with_codec(transport, options, Arc::new(DefaultCodec))
    }

    pub fn with_codec(
        transport: Arc<dyn Transport>,
        options: BrokerOptions,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                options: RwLock::new(options),
                transport,
                codec,
                state: Mutex::new(ConnectionState::default()),
                replies: Arc::new(ReplyCoordinator::new()),
                next_subscriber_id: AtomicU64::new(0),
            }),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.client.is_some()
    }

    /// Request/reply bookkeeping of this broker.
    pub fn replies(&self) -> &ReplyCoordinator {
        &self.inner.replies
    }

    /// Number of active subscriptions, reply topics included.
    pub async fn subscription_count(&self) -> usize {
        self.inner.state.lock().await.subscribers.len()
    }
}

#[async_trait]
impl Broker for MessageBroker {
    fn init(&self, options: Vec<BrokerOption>) -> Result<()> {
        let mut current = self
            .inner
            .options
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let mut updated = current.clone();
        for option in options {
            option.apply(&mut updated);
        }
        if updated.reply_timeout.is_zero() {
            return Err(BrokerError::Configuration(
                "reply timeout must be positive".to_string(),
            ));
        }
        *current = updated;
        Ok(())
    }

    fn options(&self) -> BrokerOptions {
        self.inner.read_options()
    }

    fn address(&self) -> String {
        self.inner
            .read_options()
            .resolved_addresses()
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    async fn connect(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.client.is_some() {
            return Ok(());
        }

        let options = self.inner.read_options();
        if let Some(ref tls) = options.tls {
            let missing = tls.missing_files();
            if !missing.is_empty() {
                return Err(BrokerError::Configuration(format!(
                    "TLS files not found: {:?}",
                    missing
                )));
            }
        }

        let settings = ClientSettings {
            addresses: options.resolved_addresses(),
            sasl: options.sasl.clone(),
            tls: options.tls.clone(),
        };
        let client = self.inner.transport.connect(&settings).await?;
        let producer = match Producer::start(Arc::clone(&client), &options) {
            Ok(p) => p,
            Err(e) => {
                let _ = client.close().await;
                return Err(e);
            }
        };

        self.inner.replies.clear();
        state.client = Some(client);
        state.producer = Some(Arc::new(producer));

        info!(
            transport = self.inner.transport.name(),
            addresses = ?settings.addresses,
            producer = ?options.producer,
            "Broker connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let (client, producer, subscribers) = {
            let mut state = self.inner.state.lock().await;
            let Some(client) = state.client.take() else {
                return Ok(());
            };
            (
                client,
                state.producer.take(),
                std::mem::take(&mut state.subscribers),
            )
        };
        self.inner.replies.clear();

        let mut first_error = None;
        for group in subscribers.into_values() {
            if let Err(e) = group.close().await {
                error!(group = %group.group_id(), error = %e, "Failed to close consumer group");
                first_error.get_or_insert(BrokerError::Transport(e));
            }
        }
        if let Some(producer) = producer {
            producer.close().await;
        }
        if let Err(e) = client.close().await {
            error!(error = %e, "Failed to close transport client");
            first_error.get_or_insert(BrokerError::Transport(e));
        }

        info!(transport = self.inner.transport.name(), "Broker disconnected");
        first_error.map_or(Ok(()), Err)
    }

    #[tracing::instrument(name = "broker.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, message: Message, options: PublishOptions) -> Result<()> {
        self.inner.send(topic, &message, options.key).await
    }

    #[tracing::instrument(name = "broker.request", skip_all, fields(topic = %topic, correlation_id = tracing::field::Empty))]
    async fn publish_and_receive(
        &self,
        topic: &str,
        mut message: Message,
        options: PublishOptions,
    ) -> Result<Message> {
        if message.is_empty() {
            return Err(BrokerError::EmptyMessage);
        }
        self.inner.producer().await?;

        let correlation_id = message.ensure_correlation_id();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        let reply_topic = options.reply_topic_for(topic);
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.read_options().reply_timeout);

        let mut route = self
            .inner
            .reply_route(&reply_topic, options.reply_consumer_group.clone());
        let mut waiter = self.inner.replies.register(&correlation_id)?;
        self.inner.send(topic, &message, options.key.clone()).await?;
        debug!(reply_topic = %reply_topic, ?timeout, "Request published, awaiting reply");

        let result = self
            .inner
            .await_reply(&mut waiter, &mut route, timeout, options.cancel.as_ref())
            .await;
        if let Err(ref e) = result {
            warn!(reply_topic = %reply_topic, error = %e, "Request failed");
        }
        result
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Handler>,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Subscriber>> {
        let subscriber = self.inner.subscribe(topic, handler, options).await?;
        Ok(Box::new(subscriber))
    }
}

impl fmt::Display for MessageBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} broker", self.inner.transport.name())
    }
}
