//! Token refresh scheduling.
//!
//! Connection and subscription tokens that expire are renewed shortly
//! before their ttl runs out. Refresh commands travel on the control lane
//! of the command queue; failures retry under backoff until the expiry
//! deadline, after which the session is torn down with the token-expired
//! code (connections) or the channel falls back to a full resubscribe
//! (subscriptions).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::client::inner::ClientInner;
use crate::client::types::{Lane, State};
use crate::config::jittered_delay;
use crate::errors::{ClientError, ReplyError};
use crate::protocol::{Command, Disconnect, Refresh, RefreshRequest, Reply, SubRefreshRequest};
use crate::subscription::{self, SubscriptionId};

/// Tokens are refreshed 10% of their ttl early, but never more than this
/// ahead of the expiry.
const MAX_REFRESH_SKEW: Duration = Duration::from_secs(30);

pub(crate) struct RefreshScheduler;

impl RefreshScheduler {
    fn refresh_delay(ttl: Duration) -> Duration {
        ttl.saturating_sub((ttl / 10).min(MAX_REFRESH_SKEW))
    }

    /// (Re)schedules the connection token refresh for the current session.
    pub(crate) fn schedule_connection(client: Arc<Mutex<ClientInner>>, ttl_secs: u32) {
        let rt = { client.lock().unwrap().rt.clone() };
        let task = rt.spawn(Self::connection_loop(client.clone(), ttl_secs));

        let mut inner = client.lock().unwrap();
        if inner.state != State::Connected {
            task.abort();
            return;
        }
        if let Some(prev) = inner.refresh_task.replace(task.abort_handle()) {
            prev.abort();
        }
    }

    /// A server refresh push either reschedules the renewal or cancels it
    /// when the token no longer expires.
    pub(crate) fn handle_refresh_push(client: &Arc<Mutex<ClientInner>>, refresh: Refresh) {
        if refresh.expires && refresh.ttl > 0 {
            Self::schedule_connection(client.clone(), refresh.ttl);
        } else if let Some(task) = client.lock().unwrap().refresh_task.take() {
            task.abort();
        }
    }

    async fn connection_loop(client: Arc<Mutex<ClientInner>>, initial_ttl: u32) {
        let mut ttl_secs = initial_ttl;
        loop {
            let ttl = Duration::from_secs(ttl_secs as u64);
            let expiry = Instant::now() + ttl;
            tokio::time::sleep(Self::refresh_delay(ttl)).await;

            let mut attempt: u32 = 0;
            ttl_secs = loop {
                let (token_callback, strategy) = {
                    let inner = client.lock().unwrap();
                    if inner.state != State::Connected {
                        return;
                    }
                    (inner.token_callback.clone(), inner.reconnect_strategy.clone())
                };

                let token = match &token_callback {
                    Some(callback) => match callback().await {
                        Ok(token) => Some(token),
                        Err(err) => {
                            client.lock().unwrap().emit_error(err);
                            None
                        }
                    },
                    None => None,
                };

                let rx = {
                    let mut inner = client.lock().unwrap();
                    if inner.state != State::Connected {
                        return;
                    }
                    if let Some(token) = token {
                        inner.token = token;
                    }
                    let token = inner.token.clone();
                    match inner
                        .command_queue
                        .push(Lane::Control, Command::Refresh(RefreshRequest { token }))
                    {
                        Ok(rx) => rx,
                        Err(_) => return,
                    }
                };

                match rx.await {
                    Ok(Ok(Reply::Refresh(result))) => {
                        if result.expires && result.ttl > 0 {
                            break result.ttl;
                        }
                        // token no longer expires, nothing left to renew
                        return;
                    }
                    Ok(Ok(Reply::Error(err))) => {
                        client.lock().unwrap().emit_error(err.into());
                    }
                    Ok(Ok(reply)) => {
                        client.lock().unwrap().emit_error(ClientError::Protocol(format!(
                            "unexpected reply: {:?}",
                            reply
                        )));
                    }
                    Ok(Err(ReplyError::Timeout(_))) => {}
                    Ok(Err(_)) | Err(_) => return,
                }

                attempt += 1;
                let delay = strategy.time_before_next_attempt(attempt);
                if Instant::now() + delay >= expiry {
                    // refresh window exhausted, tear the session down
                    let inner = client.lock().unwrap();
                    if inner.state == State::Connected {
                        if let Some(closer) = &inner.closer_write {
                            let _ = closer.try_send(Disconnect::token_expired());
                        }
                    }
                    return;
                }
                tokio::time::sleep(delay).await;
            };
        }
    }

    /// (Re)schedules the channel token refresh of one subscription.
    pub(crate) fn schedule_subscription(
        client: Arc<Mutex<ClientInner>>,
        sub_id: SubscriptionId,
        ttl_secs: u32,
    ) {
        let rt = { client.lock().unwrap().rt.clone() };
        let task = rt.spawn(Self::subscription_loop(client.clone(), sub_id, ttl_secs));

        let mut inner = client.lock().unwrap();
        match inner.subscriptions.get_mut(sub_id) {
            Some(sub) if sub.state == subscription::State::Subscribed => {
                if let Some(prev) = sub.refresh_task.replace(task.abort_handle()) {
                    prev.abort();
                }
            }
            _ => task.abort(),
        }
    }

    async fn subscription_loop(
        client: Arc<Mutex<ClientInner>>,
        sub_id: SubscriptionId,
        initial_ttl: u32,
    ) {
        let mut ttl_secs = initial_ttl;
        loop {
            let ttl = Duration::from_secs(ttl_secs as u64);
            let expiry = Instant::now() + ttl;
            tokio::time::sleep(Self::refresh_delay(ttl)).await;

            let mut attempt: u32 = 0;
            ttl_secs = loop {
                let (channel, token_callback, static_token, min_delay, max_delay) = {
                    let inner = client.lock().unwrap();
                    if inner.state != State::Connected {
                        return;
                    }
                    let Some(sub) = inner.subscriptions.get(sub_id) else {
                        return;
                    };
                    if sub.state != subscription::State::Subscribed {
                        return;
                    }
                    (
                        sub.channel.to_string(),
                        sub.token_callback.clone(),
                        sub.token.clone(),
                        sub.min_resubscribe_delay,
                        sub.max_resubscribe_delay,
                    )
                };

                let token = match &token_callback {
                    Some(callback) => match callback().await {
                        Ok(token) => token,
                        Err(err) => {
                            client
                                .lock()
                                .unwrap()
                                .emit_error(ClientError::subscription(&channel, err));
                            static_token
                        }
                    },
                    None => static_token,
                };

                let rx = {
                    let mut inner = client.lock().unwrap();
                    if inner.state != State::Connected {
                        return;
                    }
                    let command = Command::SubRefresh(SubRefreshRequest {
                        channel: channel.clone(),
                        token,
                    });
                    match inner.command_queue.push(Lane::Control, command) {
                        Ok(rx) => rx,
                        Err(_) => return,
                    }
                };

                match rx.await {
                    Ok(Ok(Reply::SubRefresh(result))) => {
                        if result.expires && result.ttl > 0 {
                            break result.ttl;
                        }
                        return;
                    }
                    Ok(Ok(Reply::Error(err))) => {
                        client
                            .lock()
                            .unwrap()
                            .emit_error(ClientError::subscription(&channel, err.into()));
                    }
                    Ok(Ok(_)) | Ok(Err(ReplyError::Timeout(_))) => {}
                    Ok(Err(_)) | Err(_) => return,
                }

                attempt += 1;
                let delay = jittered_delay(attempt, min_delay, max_delay);
                if Instant::now() + delay >= expiry {
                    // channel token expired, fall back to a full resubscribe
                    let mut inner = client.lock().unwrap();
                    if let Some(sub) = inner.subscriptions.get_mut(sub_id) {
                        if sub.state == subscription::State::Subscribed {
                            sub.move_to_subscribing();
                        }
                    }
                    if let Some(ch) = inner.sub_ch_write.as_ref() {
                        let _ = ch.send(sub_id);
                    }
                    return;
                }
                tokio::time::sleep(delay).await;
            };
        }
    }
}
