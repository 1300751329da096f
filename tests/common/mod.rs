//! In-process mock server used by the integration tests.
//!
//! Speaks the real frame codec over an accepted WebSocket connection and
//! answers commands according to a scripted [`ServerBehavior`]. Every
//! received command is recorded so tests can assert on ids, recovery
//! flags and refresh traffic.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use centrifuge_client::config::Protocol;
use centrifuge_client::protocol::{
    ClientInfo, Command, ConnectResult, Disconnect, Error, HistoryResult, PresenceResult,
    PresenceStatsResult, Publication, PublishResult, RawCommand, RawPush, RawReply, RefreshResult,
    RpcResult, SubRefreshResult, SubscribeResult, UnsubscribeResult,
};
use centrifuge_client::utils::{decode_frames, encode_frames};

#[derive(Clone, Default)]
pub struct ServerBehavior {
    /// Reject connects that do not carry this token.
    pub required_token: Option<String>,
    /// Advertise an expiring connection token with this ttl.
    pub expires: bool,
    pub ttl: u32,
    /// Channels reported as server-side subscriptions in the greeting.
    pub server_subs: Vec<String>,
    /// Fail history requests with this error.
    pub history_error: Option<(u32, String)>,
    /// Fail presence-stats requests with this error.
    pub presence_stats_error: Option<(u32, String)>,
    /// Publications pushed right after a successful subscribe,
    /// `(offset, json payload)` per channel.
    pub publications_on_subscribe: HashMap<String, Vec<(u64, Vec<u8>)>>,
    /// Epoch reported in subscribe results.
    pub subscribe_epoch: String,
    /// Understand the `disconnect` rpc method: a payload containing
    /// `reconnect` answers with a transient disconnect push carrying a
    /// reconnect url and next attempt time, anything else with a
    /// permanent one.
    pub handle_disconnect_rpc: bool,
}

#[derive(Default)]
pub struct ServerState {
    pub commands: Mutex<Vec<RawCommand>>,
    pub connects: Mutex<u32>,
}

impl ServerState {
    pub fn commands(&self) -> Vec<RawCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> u32 {
        *self.connects.lock().unwrap()
    }

    pub fn subscribe_requests(&self, channel: &str) -> Vec<RawCommand> {
        self.commands()
            .into_iter()
            .filter(|cmd| {
                cmd.subscribe
                    .as_ref()
                    .map(|req| req.channel == channel)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn refresh_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|cmd| cmd.refresh.is_some())
            .count()
    }
}

pub async fn spawn_server(
    protocol: Protocol,
    behavior: ServerBehavior,
) -> (String, Arc<ServerState>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{}/connection/websocket", addr);
    let state = Arc::new(ServerState::default());

    let accept_url = url.clone();
    let accept_state = state.clone();
    tokio::spawn(async move {
        while let Ok((stream, _addr)) = listener.accept().await {
            let behavior = behavior.clone();
            let state = accept_state.clone();
            let url = accept_url.clone();
            tokio::spawn(async move {
                serve_session(stream, url, protocol, behavior, state).await;
            });
        }
    });

    (url, state)
}

fn error_reply(id: u32, code: u32, message: &str, temporary: bool) -> RawReply {
    RawReply {
        id,
        error: Some(Error {
            code,
            message: message.to_string(),
            temporary,
        }),
        ..Default::default()
    }
}

fn publication_push(channel: &str, offset: u64, epoch: &str, data: Vec<u8>) -> RawReply {
    RawReply {
        push: Some(RawPush {
            channel: channel.to_string(),
            publication: Some(Publication {
                data,
                offset,
                epoch: epoch.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn disconnect_push(disconnect: Disconnect) -> RawReply {
    RawReply {
        push: Some(RawPush {
            disconnect: Some(disconnect),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

async fn serve_session(
    stream: TcpStream,
    url: String,
    protocol: Protocol,
    behavior: ServerBehavior,
    state: Arc<ServerState>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut write, mut read) = ws.split();

    while let Some(Ok(message)) = read.next().await {
        let data = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bin) => bin,
            Message::Close(_) => break,
            _ => continue,
        };

        let mut commands = Vec::new();
        decode_frames::<RawCommand>(&data, protocol, |frame| {
            if let Ok(command) = frame {
                commands.push(command);
            }
        });

        let mut replies: Vec<RawReply> = Vec::new();
        let mut pushes: Vec<RawReply> = Vec::new();
        let mut close_after: Option<(u16, String)> = None;

        for raw in commands {
            state.commands.lock().unwrap().push(raw.clone());
            let id = raw.id;

            match Command::from(raw) {
                Command::Connect(request) => {
                    if let Some(required) = &behavior.required_token {
                        if &request.token != required {
                            replies.push(error_reply(id, 101, "unauthorized", false));
                            continue;
                        }
                    }
                    *state.connects.lock().unwrap() += 1;

                    let mut subs = HashMap::new();
                    for channel in &behavior.server_subs {
                        subs.insert(
                            channel.clone(),
                            SubscribeResult {
                                recoverable: true,
                                epoch: "srv".into(),
                                ..Default::default()
                            },
                        );
                    }
                    replies.push(RawReply {
                        id,
                        connect: Some(ConnectResult {
                            client: "mock-client".into(),
                            version: "0.0.0".into(),
                            expires: behavior.expires,
                            ttl: behavior.ttl,
                            subs,
                            ..Default::default()
                        }),
                        ..Default::default()
                    });
                }
                Command::Subscribe(request) => {
                    replies.push(RawReply {
                        id,
                        subscribe: Some(SubscribeResult {
                            recoverable: true,
                            epoch: behavior.subscribe_epoch.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    });
                    if let Some(items) = behavior.publications_on_subscribe.get(&request.channel) {
                        // recovering subscribers already hold a position,
                        // replay only what they have not seen
                        let floor = if request.recover { request.offset } else { 0 };
                        for (offset, payload) in items {
                            if *offset > floor {
                                pushes.push(publication_push(
                                    &request.channel,
                                    *offset,
                                    &behavior.subscribe_epoch,
                                    payload.clone(),
                                ));
                            }
                        }
                    }
                }
                Command::Unsubscribe(_) => {
                    replies.push(RawReply {
                        id,
                        unsubscribe: Some(UnsubscribeResult {}),
                        ..Default::default()
                    });
                }
                Command::Publish(_) => {
                    replies.push(RawReply {
                        id,
                        publish: Some(PublishResult {}),
                        ..Default::default()
                    });
                }
                Command::Presence(_) => {
                    let mut presence = HashMap::new();
                    presence.insert(
                        "session-1".to_string(),
                        ClientInfo {
                            user: "user-1".into(),
                            client: "client-1".into(),
                            ..Default::default()
                        },
                    );
                    replies.push(RawReply {
                        id,
                        presence: Some(PresenceResult { presence }),
                        ..Default::default()
                    });
                }
                Command::PresenceStats(_) => match &behavior.presence_stats_error {
                    Some((code, message)) => {
                        replies.push(error_reply(id, *code, message, false));
                    }
                    None => {
                        replies.push(RawReply {
                            id,
                            presence_stats: Some(PresenceStatsResult {
                                num_clients: 1,
                                num_users: 1,
                            }),
                            ..Default::default()
                        });
                    }
                },
                Command::History(_) => match &behavior.history_error {
                    Some((code, message)) => {
                        replies.push(error_reply(id, *code, message, false));
                    }
                    None => {
                        replies.push(RawReply {
                            id,
                            history: Some(HistoryResult::default()),
                            ..Default::default()
                        });
                    }
                },
                Command::Rpc(request) => {
                    if behavior.handle_disconnect_rpc && request.method == "disconnect" {
                        replies.push(RawReply {
                            id,
                            rpc: Some(RpcResult { data: Vec::new() }),
                            ..Default::default()
                        });

                        let mode = String::from_utf8_lossy(&request.data).to_string();
                        if mode.contains("reconnect") {
                            pushes.push(disconnect_push(Disconnect {
                                code: 3005,
                                reason: "reconnect requested".into(),
                                reconnect: true,
                                reconnect_url: url.clone(),
                                next_reconnect_at: unix_millis(
                                    SystemTime::now() + Duration::from_millis(100),
                                ),
                            }));
                            close_after = Some((3005, "reconnect requested".into()));
                        } else {
                            pushes.push(disconnect_push(Disconnect {
                                code: 3501,
                                reason: "permanent".into(),
                                reconnect: false,
                                ..Default::default()
                            }));
                            close_after = Some((3501, "permanent".into()));
                        }
                    } else {
                        // default rpc behavior: echo
                        replies.push(RawReply {
                            id,
                            rpc: Some(RpcResult { data: request.data }),
                            ..Default::default()
                        });
                    }
                }
                Command::Refresh(_) => {
                    replies.push(RawReply {
                        id,
                        refresh: Some(RefreshResult {
                            client: "mock-client".into(),
                            version: "0.0.0".into(),
                            expires: behavior.expires,
                            ttl: behavior.ttl,
                        }),
                        ..Default::default()
                    });
                }
                Command::SubRefresh(_) => {
                    replies.push(RawReply {
                        id,
                        sub_refresh: Some(SubRefreshResult::default()),
                        ..Default::default()
                    });
                }
                Command::Ping(_) => {
                    replies.push(RawReply {
                        id,
                        ..Default::default()
                    });
                }
                Command::Send(_) | Command::Empty => {}
            }
        }

        if !replies.is_empty() {
            if let Some(message) = encode_frames(&replies, protocol, |_| {}) {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        }
        for push in pushes {
            if let Some(message) = encode_frames(&[push], protocol, |_| {}) {
                if write.send(message).await.is_err() {
                    break;
                }
            }
        }
        if let Some((code, reason)) = close_after {
            let _ = write
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })))
                .await;
            break;
        }
    }
}

/// Polls `predicate` until it holds or the deadline passes.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
