//! Per-session subscription flows.
//!
//! While a session is up, one handler task receives subscription ids
//! whose desired and actual states diverge, and runs the matching wire
//! exchange: a subscribe (with recovery position and retry-on-temporary
//! backoff) or a best-effort unsubscribe. On reconnect the connection
//! cycle feeds every surviving subscription id back through this path,
//! which is what replays client-side subscriptions.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::client::inner::ClientInner;
use crate::client::refresh::RefreshScheduler;
use crate::client::types::{ChannelPublication, QueuedCommand, State};
use crate::config::{jittered_delay, TokenCallback};
use crate::errors::{ClientError, ReplyError};
use crate::protocol::{Command, Reply, SubscribeRequest, UnsubscribeRequest};
use crate::subscription::{self, SubscriptionId};

pub(crate) struct SubscriptionHandler;

enum Action {
    Subscribe,
    Unsubscribe,
}

struct PendingSubscribe {
    request: SubscribeRequest,
    timeout: Duration,
    token_callback: Option<TokenCallback>,
    channel: String,
    min_delay: Duration,
    max_delay: Duration,
}

impl SubscriptionHandler {
    pub(crate) async fn handle_subscriptions(
        client: Arc<Mutex<ClientInner>>,
        mut sub_ch_read: mpsc::UnboundedReceiver<SubscriptionId>,
        control_write: mpsc::Sender<QueuedCommand>,
    ) {
        let mut buf = Vec::new();
        loop {
            let count = sub_ch_read.recv_many(&mut buf, 32).await;
            if count == 0 {
                break;
            }

            for sub_id in buf.drain(..) {
                let (rt, action) = {
                    let mut inner = client.lock().unwrap();
                    let rt = inner.rt.clone();
                    let Some(sub) = inner.subscriptions.get_mut(sub_id) else {
                        continue;
                    };
                    let action = match sub.state {
                        subscription::State::Subscribing if !sub.inflight => {
                            sub.inflight = true;
                            Some(Action::Subscribe)
                        }
                        subscription::State::Unsubscribed => Some(Action::Unsubscribe),
                        _ => None,
                    };
                    (rt, action)
                };

                match action {
                    Some(Action::Subscribe) => {
                        rt.spawn(Self::subscribe_task(
                            client.clone(),
                            control_write.clone(),
                            sub_id,
                        ));
                    }
                    Some(Action::Unsubscribe) => {
                        rt.spawn(Self::unsubscribe_task(
                            client.clone(),
                            control_write.clone(),
                            sub_id,
                        ));
                    }
                    None => {}
                }
            }
        }
    }

    /// Snapshot of everything a subscribe exchange needs, taken under the
    /// lock. Returns `None` (clearing the inflight mark) when the session
    /// or the subscription no longer wants the exchange.
    fn build_request(
        client: &Arc<Mutex<ClientInner>>,
        sub_id: SubscriptionId,
    ) -> Option<PendingSubscribe> {
        let mut inner = client.lock().unwrap();
        let timeout = inner.timeout;
        let connected = inner.state == State::Connected;
        let sub = inner.subscriptions.get_mut(sub_id)?;
        if !connected || sub.state != subscription::State::Subscribing {
            sub.inflight = false;
            return None;
        }

        let recover = sub.recoverable && (!sub.epoch.is_empty() || sub.offset > 0);
        Some(PendingSubscribe {
            request: SubscribeRequest {
                channel: sub.channel.to_string(),
                token: sub.token.clone(),
                recover,
                epoch: if recover { sub.epoch.clone() } else { String::new() },
                offset: if recover { sub.offset } else { 0 },
                data: sub.data.clone(),
                positioned: sub.positioned,
                recoverable: sub.recoverable,
                join_leave: sub.join_leave,
            },
            timeout,
            token_callback: sub.token_callback.clone(),
            channel: sub.channel.to_string(),
            min_delay: sub.min_resubscribe_delay,
            max_delay: sub.max_resubscribe_delay,
        })
    }

    async fn subscribe_task(
        client: Arc<Mutex<ClientInner>>,
        control_write: mpsc::Sender<QueuedCommand>,
        sub_id: SubscriptionId,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let Some(pending) = Self::build_request(&client, sub_id) else {
                return;
            };
            let PendingSubscribe {
                mut request,
                timeout,
                token_callback,
                channel,
                min_delay,
                max_delay,
            } = pending;

            if let Some(callback) = token_callback {
                match callback().await {
                    Ok(token) => request.token = token,
                    Err(err) => {
                        // token provider failure is retried like a
                        // temporary server error
                        Self::record_error(&client, sub_id, &channel, err);
                        attempt += 1;
                        tokio::time::sleep(jittered_delay(attempt, min_delay, max_delay)).await;
                        continue;
                    }
                }
            }

            let (tx, rx) = oneshot::channel();
            let queued = QueuedCommand {
                command: Command::Subscribe(request),
                reply: tx,
                deadline: Instant::now() + timeout,
            };
            if control_write.send(queued).await.is_err() {
                Self::clear_inflight(&client, sub_id);
                return;
            }

            match rx.await {
                Ok(Ok(Reply::Subscribe(result))) => {
                    let schedule_refresh = {
                        let mut inner = client.lock().unwrap();
                        let publication_tx = inner.publication_tx.clone();
                        let Some(sub) = inner.subscriptions.get_mut(sub_id) else {
                            return;
                        };
                        sub.inflight = false;
                        if sub.state != subscription::State::Subscribing {
                            return;
                        }
                        sub.apply_subscribed(&result);
                        if let Some(tx) = publication_tx {
                            for publication in &result.publications {
                                let _ = tx.send(ChannelPublication {
                                    channel: channel.clone(),
                                    publication: publication.clone(),
                                });
                            }
                        }
                        result.expires && result.ttl > 0
                    };
                    if schedule_refresh {
                        RefreshScheduler::schedule_subscription(client.clone(), sub_id, result.ttl);
                    }
                    return;
                }
                Ok(Ok(Reply::Error(err))) => {
                    let error = ClientError::from(err.clone());
                    if err.temporary {
                        Self::record_error(&client, sub_id, &channel, error);
                        attempt += 1;
                        tokio::time::sleep(jittered_delay(attempt, min_delay, max_delay)).await;
                        continue;
                    }
                    Self::fail(&client, sub_id, &channel, error);
                    return;
                }
                Ok(Ok(reply)) => {
                    Self::fail(
                        &client,
                        sub_id,
                        &channel,
                        ClientError::Protocol(format!("unexpected reply: {:?}", reply)),
                    );
                    return;
                }
                Ok(Err(ReplyError::Timeout(_))) => {
                    attempt += 1;
                    tokio::time::sleep(jittered_delay(attempt, min_delay, max_delay)).await;
                    continue;
                }
                Ok(Err(_)) | Err(_) => {
                    // session ended; the reconnect replay picks this up
                    Self::clear_inflight(&client, sub_id);
                    return;
                }
            }
        }
    }

    async fn unsubscribe_task(
        client: Arc<Mutex<ClientInner>>,
        control_write: mpsc::Sender<QueuedCommand>,
        sub_id: SubscriptionId,
    ) {
        let pending = {
            let inner = client.lock().unwrap();
            inner
                .subscriptions
                .get(sub_id)
                .map(|sub| (sub.channel.to_string(), inner.timeout))
        };

        if let Some((channel, timeout)) = pending {
            let (tx, rx) = oneshot::channel();
            let queued = QueuedCommand {
                command: Command::Unsubscribe(UnsubscribeRequest { channel }),
                reply: tx,
                deadline: Instant::now() + timeout,
            };
            if control_write.send(queued).await.is_ok() {
                // best effort, the registry record already moved on
                let _ = rx.await;
            }
        }

        let mut inner = client.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
            for ch in sub.on_unsubscribed_ch.drain(..) {
                let _ = ch.send(());
            }
        }
    }

    fn clear_inflight(client: &Arc<Mutex<ClientInner>>, sub_id: SubscriptionId) {
        let mut inner = client.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
            sub.inflight = false;
        }
    }

    /// Records a retryable failure on the subscription and the client
    /// errors stream.
    fn record_error(
        client: &Arc<Mutex<ClientInner>>,
        sub_id: SubscriptionId,
        channel: &str,
        error: ClientError,
    ) {
        let wrapped = ClientError::subscription(channel, error);
        let mut inner = client.lock().unwrap();
        inner.emit_error(wrapped.clone());
        if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
            sub.notify_error(wrapped);
        }
    }

    /// Terminal subscribe failure: the record parks in `Unsubscribed`
    /// with the error preserved.
    fn fail(
        client: &Arc<Mutex<ClientInner>>,
        sub_id: SubscriptionId,
        channel: &str,
        error: ClientError,
    ) {
        let wrapped = ClientError::subscription(channel, error);
        let mut inner = client.lock().unwrap();
        inner.emit_error(wrapped.clone());
        if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
            sub.inflight = false;
            if sub.state == subscription::State::Subscribing {
                sub.move_to_unsubscribed(Some(wrapped));
            }
        }
    }
}
