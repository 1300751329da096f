//! End-to-end session behavior against the in-process mock server.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use centrifuge_client::client::{Client, HistoryOptions, State};
use centrifuge_client::config::{Config, Protocol, SubscriptionConfig};
use centrifuge_client::errors::ClientError;
use centrifuge_client::subscription;

use common::{spawn_server, wait_until, ServerBehavior};

#[tokio::test]
async fn connect_send_disconnect_close() {
    let (url, state) = spawn_server(Protocol::Protobuf, ServerBehavior::default()).await;
    let client = Client::new(&url, Config::new());

    client.connect().await.unwrap();
    assert_eq!(client.state(), State::Connected);
    assert_eq!(client.client_id(), Some("mock-client".to_string()));
    client.ready().await.unwrap();

    client.send(br#""Hello""#.to_vec()).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            state.commands().iter().any(|cmd| cmd.send.is_some())
        })
        .await
    );

    let metrics = client.metrics();
    assert_eq!(metrics.connects, 1);
    assert_eq!(metrics.disconnects, 0);
    assert!(metrics.bytes_sent > 0);
    assert!(metrics.bytes_received > 0);

    client.disconnect().await;
    assert_eq!(client.state(), State::Disconnected);
    assert_eq!(client.metrics().disconnects, 1);

    client.close().await;
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test]
async fn transient_disconnect_reconnects_with_overrides() {
    let behavior = ServerBehavior {
        handle_disconnect_rpc: true,
        ..Default::default()
    };
    let (url, state) = spawn_server(Protocol::Protobuf, behavior).await;
    let client = Client::new(&url, Config::new());

    let mut states = client.states();
    client.connect().await.unwrap();

    client
        .rpc("disconnect", br#""reconnect""#.to_vec())
        .await
        .unwrap();

    // walk the state machine: Connected -> Disconnected -> Connecting -> Connected
    loop {
        let event = states.recv().await.unwrap();
        if event.current == State::Disconnected {
            break;
        }
    }

    let metrics = client.metrics();
    assert_eq!(metrics.connects, 1);
    assert_eq!(metrics.disconnects, 1);
    assert_eq!(metrics.reconnect_url, Some(url.clone()));
    assert!(metrics.next_reconnect_at.is_some());

    let event = states.recv().await.unwrap();
    assert_eq!(event.current, State::Connecting);
    let event = states.recv().await.unwrap();
    assert_eq!(event.current, State::Connected);

    assert!(wait_until(Duration::from_secs(2), || state.connect_count() == 2).await);
    assert_eq!(client.metrics().connects, 2);

    // overrides are consumed by the successful reconnect
    let metrics = client.metrics();
    assert!(metrics.reconnect_url.is_none());
    assert!(metrics.next_reconnect_at.is_none());

    client.close().await;
}

#[tokio::test]
async fn permanent_disconnect_stays_down() {
    let behavior = ServerBehavior {
        handle_disconnect_rpc: true,
        ..Default::default()
    };
    let (url, state) = spawn_server(Protocol::Protobuf, behavior).await;
    let client = Client::new(&url, Config::new());

    client.connect().await.unwrap();
    client
        .rpc("disconnect", br#""permanent""#.to_vec())
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            client.state() == State::Disconnected
        })
        .await
    );

    let metrics = client.metrics();
    assert_eq!(metrics.connects, 1);
    assert_eq!(metrics.disconnects, 1);
    assert!(metrics.reconnect_url.is_none());
    assert!(metrics.next_reconnect_at.is_none());

    // no retry is scheduled
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(client.state(), State::Disconnected);
    assert_eq!(state.connect_count(), 1);
}

#[tokio::test]
async fn server_side_subscriptions_are_mirrored() {
    let behavior = ServerBehavior {
        server_subs: vec!["notification:index".to_string()],
        history_error: Some((108, "not available".to_string())),
        presence_stats_error: Some((108, "not available".to_string())),
        ..Default::default()
    };
    let (url, _state) = spawn_server(Protocol::Protobuf, behavior).await;
    let client = Client::new(&url, Config::new());

    client.connect().await.unwrap();

    let server_subs = client.server_subscriptions();
    let sub = server_subs.get("notification:index").unwrap();
    assert_eq!(sub.state, subscription::State::Subscribed);

    let err = client
        .history("notification:index", HistoryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Reply { code: 108, ref message, .. } if message == "not available"));

    let presence = client.presence("notification:index").await.unwrap();
    assert_eq!(presence.len(), 1);

    let err = client.presence_stats("notification:index").await.unwrap_err();
    assert!(matches!(err, ClientError::Reply { code: 108, .. }));

    // the mirror is dropped with the session
    client.disconnect().await;
    assert!(client.server_subscriptions().is_empty());
}

#[tokio::test]
async fn short_ttl_token_is_refreshed() {
    let behavior = ServerBehavior {
        expires: true,
        ttl: 1,
        ..Default::default()
    };
    let (url, state) = spawn_server(Protocol::Protobuf, behavior).await;
    let client = Client::new(&url, Config::new().with_token("short-lived"));

    client.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    // the session survived on refreshes alone
    assert_eq!(client.state(), State::Connected);
    assert_eq!(state.connect_count(), 1);
    assert!(state.refresh_count() >= 1);

    client.close().await;
}

#[tokio::test]
async fn queue_backpressure_rejects_and_recovers() {
    let (url, _state) = spawn_server(Protocol::Protobuf, ServerBehavior::default()).await;
    let client = Client::new(&url, Config::new().with_max_pending_commands(2));

    // buffered while disconnected
    let first = client.publish("news", br#"{"n":1}"#.to_vec());
    let second = client.publish("news", br#"{"n":2}"#.to_vec());

    let overflow = client.publish("news", br#"{"n":3}"#.to_vec()).await;
    assert!(matches!(overflow, Err(ClientError::Send(_))));

    client.connect().await.unwrap();
    first.await.unwrap();
    second.await.unwrap();

    // the drained queue accepts again
    client.publish("news", br#"{"n":4}"#.to_vec()).await.unwrap();
}

#[tokio::test]
async fn publications_flow_in_offset_order_and_replay_recovers() {
    let mut publications_on_subscribe = HashMap::new();
    publications_on_subscribe.insert(
        "chat".to_string(),
        vec![
            (1, br#"{"n":1}"#.to_vec()),
            (2, br#"{"n":2}"#.to_vec()),
            (3, br#"{"n":3}"#.to_vec()),
        ],
    );
    let behavior = ServerBehavior {
        publications_on_subscribe,
        subscribe_epoch: "e1".to_string(),
        handle_disconnect_rpc: true,
        ..Default::default()
    };
    let (url, state) = spawn_server(Protocol::Protobuf, behavior).await;
    let client = Client::new(&url, Config::new());

    client.connect().await.unwrap();

    let sub = client
        .new_subscription_with(
            "chat",
            SubscriptionConfig {
                recoverable: true,
                ..Default::default()
            },
        )
        .unwrap();

    let offsets: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = offsets.clone();
    sub.on_publication(move |publication| {
        sink.lock().unwrap().push(publication.offset);
    });

    sub.subscribe().await.unwrap();
    assert_eq!(sub.state(), subscription::State::Subscribed);

    assert!(wait_until(Duration::from_secs(2), || offsets.lock().unwrap().len() == 3).await);
    {
        let seen = offsets.lock().unwrap();
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    }
    assert_eq!(sub.stream_position(), Some(("e1".to_string(), 3)));

    // transient drop: the subscription returns to Subscribed on its own,
    // and the replayed subscribe asks for recovery from the held position
    client
        .rpc("disconnect", br#""reconnect""#.to_vec())
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            state.connect_count() == 2 && sub.state() == subscription::State::Subscribed
        })
        .await
    );

    let requests = state.subscribe_requests("chat");
    assert_eq!(requests.len(), 2);
    let initial = requests[0].subscribe.as_ref().unwrap();
    assert!(!initial.recover);
    let replayed = requests[1].subscribe.as_ref().unwrap();
    assert!(replayed.recover);
    assert_eq!(replayed.epoch, "e1");
    assert_eq!(replayed.offset, 3);

    // nothing past the held position existed, so nothing was replayed twice
    assert_eq!(offsets.lock().unwrap().len(), 3);

    client.close().await;
}

#[tokio::test]
async fn command_ids_are_strictly_increasing() {
    let (url, state) = spawn_server(Protocol::Protobuf, ServerBehavior::default()).await;
    let client = Client::new(&url, Config::new());

    client.connect().await.unwrap();
    for n in 0..5 {
        let payload = format!("{}", n).into_bytes();
        let echoed = client.rpc("echo", payload.clone()).await.unwrap();
        assert_eq!(echoed, payload);
    }

    let ids: Vec<u32> = state
        .commands()
        .iter()
        .map(|cmd| cmd.id)
        .filter(|&id| id != 0)
        .collect();
    assert!(ids.len() >= 6); // connect + five rpcs
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn metrics_count_frames_both_ways() {
    let (url, _state) = spawn_server(Protocol::Protobuf, ServerBehavior::default()).await;
    let client = Client::new(&url, Config::new());

    client.connect().await.unwrap();
    for _ in 0..3 {
        client.rpc("echo", br#""x""#.to_vec()).await.unwrap();
    }

    // connect plus three sequential rpc cycles, no pings in between
    let metrics = client.metrics();
    assert_eq!(metrics.messages_sent, 4);
    assert_eq!(metrics.messages_received, 4);
    assert_eq!(metrics.replies.get("rpc"), Some(&3));
    assert_eq!(metrics.replies.get("connect"), Some(&1));
}

#[tokio::test]
async fn json_encoding_round_trips() {
    let (url, _state) = spawn_server(Protocol::Json, ServerBehavior::default()).await;
    let client = Client::new(&url, Config::new().use_json());

    client.connect().await.unwrap();

    let echoed = client.rpc("echo", br#"{"a":1}"#.to_vec()).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&echoed).unwrap();
    assert_eq!(value, serde_json::json!({"a": 1}));

    client.publish("news", br#"{"b":2}"#.to_vec()).await.unwrap();

    let sub = client.new_subscription("news").unwrap();
    sub.subscribe().await.unwrap();
    sub.unsubscribe().await;
    assert_eq!(sub.state(), subscription::State::Unsubscribed);

    client.close().await;
}

#[tokio::test]
async fn rejected_token_surfaces_and_settles_disconnected() {
    let behavior = ServerBehavior {
        required_token: Some("valid".to_string()),
        ..Default::default()
    };
    let (url, state) = spawn_server(Protocol::Protobuf, behavior).await;

    let client = Client::new(&url, Config::new().with_token("wrong"));
    let mut errors = client.errors();

    assert!(client.connect().await.is_err());
    assert!(
        wait_until(Duration::from_secs(2), || {
            client.state() == State::Disconnected
        })
        .await
    );
    assert!(matches!(
        errors.recv().await,
        Ok(ClientError::Reply { code: 101, .. })
    ));
    assert_eq!(state.connect_count(), 0);

    // the right token connects against the same server
    let client = Client::new(&url, Config::new().with_token("valid"));
    client.connect().await.unwrap();
    assert_eq!(client.state(), State::Connected);
}
