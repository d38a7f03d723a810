//! Request/reply coordination.
//!
//! Two concurrent tables back `publish_and_receive`:
//! - the waiter table maps a correlation ID to the single-slot channel of the
//!   caller blocked on it
//! - the route table records which reply topics already have a consumer, so
//!   each topic is subscribed at most once per connection
//!
//! Removing a waiter is the only way to obtain its sender, so a reply and a
//! timeout racing for the same ID resolve to exactly one winner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::message::{Event, Handler, HandlerError, Message};
use super::{BrokerError, Result};

/// A caller blocked on a reply.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    token: u64,
    reply: oneshot::Sender<Message>,
    created_at: DateTime<Utc>,
}

/// Setup progress of a reply-topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RouteState {
    Pending,
    Ready,
    Failed(String),
}

struct Route {
    id: u64,
    state: watch::Receiver<RouteState>,
}

/// Outcome of looking up a reply topic.
pub(crate) enum RouteEntry {
    /// Another call already owns the subscription.
    Existing(watch::Receiver<RouteState>),
    /// This call created the entry and must establish the subscription,
    /// reporting progress through `state`.
    Created {
        id: u64,
        state: watch::Sender<RouteState>,
        watch: watch::Receiver<RouteState>,
    },
}

/// Waiter table and reply-topic registry for one broker.
#[derive(Default)]
pub struct ReplyCoordinator {
    waiters: DashMap<String, PendingRequest>,
    routes: DashMap<String, Route>,
    next_id: AtomicU64,
}

impl ReplyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`.
    ///
    /// The returned ticket removes the waiter when dropped, unless a reply or
    /// timeout already took it.
    pub(crate) fn register(&self, correlation_id: &str) -> Result<Waiter<'_>> {
        match self.waiters.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => Err(BrokerError::DuplicateCorrelationId(
                correlation_id.to_string(),
            )),
            Entry::Vacant(slot) => {
                let token = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingRequest {
                    token,
                    reply: tx,
                    created_at: Utc::now(),
                });
                Ok(Waiter {
                    coordinator: self,
                    correlation_id: correlation_id.to_string(),
                    token,
                    reply: rx,
                })
            }
        }
    }

    /// Atomically remove the waiter for `correlation_id`.
    pub(crate) fn take(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.waiters.remove(correlation_id).map(|(_, p)| p)
    }

    /// Hand a reply to its waiter.
    ///
    /// Replies without a correlation ID, or whose waiter is gone, are
    /// dropped. Returns whether the reply reached a waiter.
    pub fn deliver(&self, message: Message) -> bool {
        let Some(correlation_id) = message.correlation_id().map(str::to_string) else {
            debug!("Dropping reply without correlation id");
            return false;
        };
        let Some(pending) = self.take(&correlation_id) else {
            debug!(correlation_id = %correlation_id, "Dropping reply with no waiter");
            return false;
        };

        let waited_ms = (Utc::now() - pending.created_at).num_milliseconds();
        if pending.reply.send(message).is_err() {
            debug!(correlation_id = %correlation_id, "Waiter left before reply arrived");
            return false;
        }
        debug!(correlation_id = %correlation_id, waited_ms, "Delivered reply");
        true
    }

    /// Look up the subscription state for `topic`, creating the entry if
    /// this is the first request to use it.
    pub(crate) fn route(&self, topic: &str) -> RouteEntry {
        match self.routes.entry(topic.to_string()) {
            Entry::Occupied(route) => RouteEntry::Existing(route.get().state.clone()),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(RouteState::Pending);
                slot.insert(Route {
                    id,
                    state: rx.clone(),
                });
                RouteEntry::Created {
                    id,
                    state: tx,
                    watch: rx,
                }
            }
        }
    }

    /// Report that the subscription for `topic` could not be established.
    ///
    /// The entry is removed so the next request retries, and every waiter
    /// watching it observes the failure.
    pub(crate) fn route_failed(
        &self,
        topic: &str,
        id: u64,
        state: &watch::Sender<RouteState>,
        reason: String,
    ) {
        self.routes.remove_if(topic, |_, route| route.id == id);
        state.send_replace(RouteState::Failed(reason));
    }

    /// Drop every waiter and route. Blocked callers see their channel close.
    pub(crate) fn clear(&self) {
        self.waiters.clear();
        self.routes.clear();
    }

    /// Number of callers waiting for a reply.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Whether a caller is waiting on `correlation_id`.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.waiters.contains_key(correlation_id)
    }

    /// Whether `topic` has a live or in-progress reply subscription.
    pub fn has_route(&self, topic: &str) -> bool {
        self.routes.contains_key(topic)
    }
}

/// Registration held by a blocked `publish_and_receive` call.
pub(crate) struct Waiter<'a> {
    coordinator: &'a ReplyCoordinator,
    correlation_id: String,
    token: u64,
    pub(crate) reply: oneshot::Receiver<Message>,
}

impl Waiter<'_> {
    /// Give up on the reply. `true` if the waiter was still registered, i.e.
    /// no reply had been handed over yet.
    pub(crate) fn abandon(&self) -> bool {
        self.coordinator
            .waiters
            .remove_if(&self.correlation_id, |_, p| p.token == self.token)
            .is_some()
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Handler installed on reply topics.
pub(crate) struct ReplyDispatcher {
    pub(crate) coordinator: Arc<ReplyCoordinator>,
}

impl Handler for ReplyDispatcher {
    fn handle(&self, event: Event) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        self.coordinator.deliver(event.message().clone());
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests;
