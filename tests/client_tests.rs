//! Offline behavior: construction, configuration, registry rules,
//! backoff bounds and the closed-client precondition.

use std::time::Duration;

use centrifuge_client::client::{Client, State};
use centrifuge_client::config::{BackoffReconnect, Config, Protocol, ReconnectStrategy, SubscriptionConfig};
use centrifuge_client::errors::{ClientError, NewSubscriptionError, RemoveSubscriptionError};
use centrifuge_client::protocol::StreamPosition;
use centrifuge_client::subscription;

#[tokio::test]
async fn client_starts_disconnected() {
    let client = Client::new("ws://localhost:8000/connection/websocket", Config::new());
    assert_eq!(client.state(), State::Disconnected);
    assert_eq!(client.client_id(), None);

    let metrics = client.metrics();
    assert_eq!(metrics.connects, 0);
    assert_eq!(metrics.messages_sent, 0);
    assert!(metrics.reconnect_url.is_none());
    assert!(metrics.next_reconnect_at.is_none());
}

#[tokio::test]
async fn config_builders_apply() {
    let config = Config::new()
        .with_token("secret")
        .with_name("test-app")
        .with_version("1.2.3")
        .with_timeout(Duration::from_secs(30))
        .with_header("Authorization", "Bearer x")
        .with_max_pending_commands(8);

    assert_eq!(config.token, "secret");
    assert_eq!(config.name, "test-app");
    assert_eq!(config.version, "1.2.3");
    assert_eq!(config.timeout, Duration::from_secs(30));
    assert_eq!(config.headers.len(), 1);
    assert_eq!(config.max_pending_commands, 8);

    // protobuf is the canonical encoding
    assert_eq!(config.protocol, Protocol::Protobuf);
    assert_eq!(config.protocol.subprotocol(), "centrifuge-protobuf");
    assert_eq!(config.use_json().protocol.subprotocol(), "centrifuge-json");
}

#[tokio::test]
async fn subscription_registry_enforces_uniqueness() {
    let client = Client::new("ws://localhost:8000/connection/websocket", Config::new());

    let sub = client.new_subscription("news").unwrap();
    assert_eq!(sub.state(), subscription::State::Unsubscribed);
    assert_eq!(sub.channel(), "news");

    assert!(matches!(
        client.new_subscription("news"),
        Err(NewSubscriptionError::Duplicate)
    ));
    assert!(matches!(
        client.new_subscription(""),
        Err(NewSubscriptionError::EmptyChannel)
    ));

    assert!(client.get_subscription("news").is_some());
    assert!(client.get_subscription("other").is_none());
}

#[tokio::test]
async fn remove_requires_unsubscribed() {
    let client = Client::new("ws://localhost:8000/connection/websocket", Config::new());
    let sub = client.new_subscription("news").unwrap();

    // while offline, subscribe() records the desire and parks the record
    // in Subscribing until a session exists
    let _pending = sub.subscribe();
    assert_eq!(sub.state(), subscription::State::Subscribing);
    assert!(matches!(
        client.remove_subscription(sub.clone()),
        Err(RemoveSubscriptionError::NotUnsubscribed)
    ));

    sub.unsubscribe().await;
    assert_eq!(sub.state(), subscription::State::Unsubscribed);
    client.remove_subscription(sub).unwrap();
    assert!(client.get_subscription("news").is_none());
}

#[tokio::test]
async fn subscription_config_seeds_recovery_position() {
    let client = Client::new("ws://localhost:8000/connection/websocket", Config::new());
    let sub = client
        .new_subscription_with(
            "chat",
            SubscriptionConfig {
                recoverable: true,
                since: Some(StreamPosition {
                    offset: 42,
                    epoch: "e9".into(),
                }),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(sub.stream_position(), Some(("e9".to_string(), 42)));
}

#[test]
fn backoff_stays_within_bounds_and_jitters() {
    let strategy = BackoffReconnect {
        factor: 2.0,
        min_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
    };

    let mut samples = Vec::new();
    for _ in 0..100 {
        let delay = strategy.time_before_next_attempt(3);
        assert!(delay >= strategy.min_delay);
        assert!(delay <= strategy.max_delay);
        samples.push(delay);
    }

    // jitter must actually spread the samples
    samples.sort();
    assert!(samples.first() != samples.last());

    // degenerate configuration falls back to the maximum
    let inverted = BackoffReconnect {
        factor: 2.0,
        min_delay: Duration::from_secs(10),
        max_delay: Duration::from_millis(100),
    };
    assert_eq!(
        inverted.time_before_next_attempt(1),
        Duration::from_millis(100)
    );
}

#[tokio::test]
async fn ready_fails_fast_when_not_connecting() {
    let client = Client::new("ws://localhost:8000/connection/websocket", Config::new());
    assert!(matches!(
        client.ready().await,
        Err(ClientError::Connection(_))
    ));
}

#[tokio::test]
async fn closed_client_absorbs_everything() {
    let client = Client::new("ws://localhost:8000/connection/websocket", Config::new());
    let sub = client.new_subscription("news").unwrap();

    client.close().await;
    assert_eq!(client.state(), State::Closed);

    assert!(matches!(client.connect().await, Err(ClientError::Closed)));
    assert!(matches!(client.ready().await, Err(ClientError::Closed)));
    assert!(matches!(
        client.publish("news", b"{}".to_vec()).await,
        Err(ClientError::Closed)
    ));
    assert!(matches!(
        client.rpc("method", b"{}".to_vec()).await,
        Err(ClientError::Closed)
    ));
    assert!(matches!(
        client.send(b"{}".to_vec()).await,
        Err(ClientError::Closed)
    ));
    assert!(matches!(
        client.new_subscription("other"),
        Err(NewSubscriptionError::Closed)
    ));

    // the registry is gone and close is idempotent
    assert_eq!(sub.state(), subscription::State::Unsubscribed);
    client.close().await;
    assert_eq!(client.state(), State::Closed);
}
