//! Relaykit - message broker with request/reply over publish/subscribe.
//!
//! Publish, subscribe and request/reply over a pluggable transport: an
//! in-process cluster for development and tests, or Kafka.

pub mod broker;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::{
    Broker, BrokerError, BrokerOptions, Event, Handler, HandlerError, Message, MessageBroker,
    PublishOptions, SubscribeOptions, Subscriber,
};
