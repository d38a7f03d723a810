//! relaykit-square: request/reply demo
//!
//! Runs a responder that squares numbers and sends it one request.
//!
//! ## Flow
//! ```text
//! [requester] --square.request--> [responder]
//!      ^                              |
//!      +------square.request.reply----+
//! ```
//!
//! ## Configuration
//! - RELAYKIT_CONFIG: YAML config file (optional; memory transport by default)
//! - RELAYKIT_LOG: log filter (default: info)
//! - first argument: number to square (default: 7)

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use relaykit::broker::{init_broker, Broker, Event, HandlerError, Message};
use relaykit::config::Config;
use relaykit::utils::bootstrap::{connect_with_retry, init_tracing};
use relaykit::{PublishOptions, SubscribeOptions};

const REQUEST_TOPIC: &str = "square.request";

#[derive(Debug, Serialize, Deserialize)]
struct SquareRequest {
    #[serde(rename = "Number")]
    number: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SquareResponse {
    #[serde(rename = "Result")]
    result: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let number: i64 = std::env::args()
        .nth(1)
        .map(|n| n.parse::<i64>())
        .transpose()?
        .unwrap_or(7);

    let config = Config::load(None)?;
    let broker = init_broker(&config.messaging)?;
    let address = broker.address();
    connect_with_retry("broker", &address, || broker.connect()).await?;

    let responder = broker.clone();
    broker
        .subscribe(
            REQUEST_TOPIC,
            Arc::new(move |event: Event| {
                let broker = responder.clone();
                async move {
                    let request: SquareRequest = event.message().decode()?;
                    let n = request.number as f64;
                    let reply = event.message().reply_json(&SquareResponse { result: n * n })?;
                    broker
                        .publish(
                            &format!("{}.reply", event.topic()),
                            reply,
                            PublishOptions::new(),
                        )
                        .await?;
                    Ok::<(), HandlerError>(())
                }
            }),
            SubscribeOptions::new().with_group("square-responders"),
        )
        .await?;

    info!(number, "relaykit-square started");

    let reply = broker
        .publish_and_receive(
            REQUEST_TOPIC,
            Message::json(&SquareRequest { number })?,
            PublishOptions::new(),
        )
        .await?;
    let response: SquareResponse = reply.decode()?;
    println!("{}^2 = {}", number, response.result);

    broker.disconnect().await?;
    Ok(())
}
