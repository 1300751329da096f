//! Channel subscriptions.
//!
//! Client-side subscriptions are created through
//! [`Client::new_subscription`](crate::client::Client::new_subscription),
//! live in the client registry and are replayed automatically after a
//! reconnect. Server-side subscriptions are mirrored from server pushes
//! and exposed read-only as [`ServerSubscription`] values.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use slotmap::new_key_type;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::client::{await_reply, Client, FutureResult};
use crate::config::{SubscriptionConfig, TokenCallback};
use crate::errors::ClientError;
use crate::protocol::{ClientInfo, Command, Publication, PublishRequest, Reply, SubscribeResult};

new_key_type! { pub(crate) struct SubscriptionId; }

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// Registry record of a client-side subscription.
pub(crate) struct SubscriptionInner {
    pub(crate) channel: Arc<str>,
    pub(crate) state: State,
    pub(crate) token: String,
    pub(crate) token_callback: Option<TokenCallback>,
    pub(crate) data: Vec<u8>,
    pub(crate) positioned: bool,
    pub(crate) recoverable: bool,
    pub(crate) join_leave: bool,
    /// Stream lineage token last seen for this channel.
    pub(crate) epoch: String,
    /// Highest publication offset seen within the current epoch.
    pub(crate) offset: u64,
    pub(crate) min_resubscribe_delay: Duration,
    pub(crate) max_resubscribe_delay: Duration,
    /// Whether a subscribe exchange is currently running.
    pub(crate) inflight: bool,
    pub(crate) refresh_task: Option<AbortHandle>,
    pub(crate) last_error: Option<ClientError>,
    on_subscribing: Option<Box<dyn FnMut() + Send + 'static>>,
    on_subscribed: Option<Box<dyn FnMut() + Send + 'static>>,
    on_unsubscribed: Option<Box<dyn FnMut() + Send + 'static>>,
    on_publication: Option<Box<dyn FnMut(Publication) + Send + 'static>>,
    on_join: Option<Box<dyn FnMut(ClientInfo) + Send + 'static>>,
    on_leave: Option<Box<dyn FnMut(ClientInfo) + Send + 'static>>,
    on_error: Option<Box<dyn FnMut(ClientError) + Send + 'static>>,
    pub(crate) on_subscribed_ch: Vec<oneshot::Sender<Result<(), ClientError>>>,
    pub(crate) on_unsubscribed_ch: Vec<oneshot::Sender<()>>,
}

impl SubscriptionInner {
    pub(crate) fn new(channel: &str, config: SubscriptionConfig) -> Self {
        let (epoch, offset) = match config.since {
            Some(position) => (position.epoch, position.offset),
            None => (String::new(), 0),
        };

        SubscriptionInner {
            channel: channel.into(),
            state: State::Unsubscribed,
            token: config.token,
            token_callback: config.token_callback,
            data: config.data,
            positioned: config.positioned,
            recoverable: config.recoverable,
            join_leave: config.join_leave,
            epoch,
            offset,
            min_resubscribe_delay: config.min_resubscribe_delay,
            max_resubscribe_delay: config.max_resubscribe_delay,
            inflight: false,
            refresh_task: None,
            last_error: None,
            on_subscribing: None,
            on_subscribed: None,
            on_unsubscribed: None,
            on_publication: None,
            on_join: None,
            on_leave: None,
            on_error: None,
            on_subscribed_ch: Vec::new(),
            on_unsubscribed_ch: Vec::new(),
        }
    }

    pub(crate) fn move_to_subscribing(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.set_state(State::Subscribing);
    }

    /// Applies a successful subscribe result: stores the recovery
    /// position, goes `Subscribed` and replays recovered publications
    /// through the publication sink.
    pub(crate) fn apply_subscribed(&mut self, result: &SubscribeResult) {
        if result.recoverable {
            self.recoverable = true;
        }
        if !result.epoch.is_empty() {
            self.epoch = result.epoch.clone();
        }
        self.last_error = None;
        self.set_state(State::Subscribed);

        for publication in &result.publications {
            if publication.offset > 0 {
                self.offset = publication.offset;
            }
            self.notify_publication(publication.clone());
        }
        if result.offset > self.offset {
            self.offset = result.offset;
        }

        for ch in self.on_subscribed_ch.drain(..) {
            let _ = ch.send(Ok(()));
        }
    }

    pub(crate) fn move_to_unsubscribed(&mut self, error: Option<ClientError>) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        if let Some(err) = error {
            self.notify_error(err);
        }
        self.set_state(State::Unsubscribed);

        let failure = self
            .last_error
            .clone()
            .unwrap_or_else(|| ClientError::Send("unsubscribed".into()));
        for ch in self.on_subscribed_ch.drain(..) {
            let _ = ch.send(Err(failure.clone()));
        }
    }

    pub(crate) fn notify_publication(&mut self, publication: Publication) {
        if let Some(ref mut on_publication) = self.on_publication {
            on_publication(publication);
        }
    }

    pub(crate) fn notify_join(&mut self, info: ClientInfo) {
        if let Some(ref mut on_join) = self.on_join {
            on_join(info);
        }
    }

    pub(crate) fn notify_leave(&mut self, info: ClientInfo) {
        if let Some(ref mut on_leave) = self.on_leave {
            on_leave(info);
        }
    }

    pub(crate) fn notify_error(&mut self, err: ClientError) {
        self.last_error = Some(err.clone());
        if let Some(ref mut on_error) = self.on_error {
            on_error(err);
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        log::debug!("state: {:?} -> {:?}, channel={}", self.state, state, self.channel);
        self.state = state;

        match state {
            State::Unsubscribed => {
                if let Some(ref mut on_unsubscribed) = self.on_unsubscribed {
                    on_unsubscribed();
                }
            }
            State::Subscribing => {
                if let Some(ref mut on_subscribing) = self.on_subscribing {
                    on_subscribing();
                }
            }
            State::Subscribed => {
                if let Some(ref mut on_subscribed) = self.on_subscribed {
                    on_subscribed();
                }
            }
        }
    }
}

/// Mirror of a subscription maintained by the server.
///
/// The client cannot subscribe or unsubscribe these; they are populated
/// from the connect greeting and updated by server pushes.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSubscription {
    pub state: State,
    pub recoverable: bool,
    pub epoch: String,
    pub offset: u64,
}

/// Handle to a client-side subscription.
///
/// Cheap to clone; all clones refer to the same registry record.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) id: SubscriptionId,
    client: Client,
}

impl Subscription {
    pub(crate) fn new(client: &Client, key: SubscriptionId) -> Self {
        Subscription {
            id: key,
            client: client.clone(),
        }
    }

    /// Asks the engine to bring this subscription to `Subscribed`.
    ///
    /// The returned future resolves once the server acknowledged the
    /// subscription. While the client is disconnected the desire is
    /// remembered and replayed on the next connect.
    pub fn subscribe(&self) -> FutureResult<impl Future<Output = Result<(), ClientError>>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.client.0.lock().unwrap();
            if inner.state == crate::client::State::Closed {
                let _ = tx.send(Err(ClientError::Closed));
            } else {
                let mut notify = false;
                match inner.subscriptions.get_mut(self.id) {
                    Some(sub) => match sub.state {
                        State::Subscribed => {
                            let _ = tx.send(Ok(()));
                        }
                        State::Subscribing => {
                            sub.on_subscribed_ch.push(tx);
                        }
                        State::Unsubscribed => {
                            sub.on_subscribed_ch.push(tx);
                            sub.move_to_subscribing();
                            notify = true;
                        }
                    },
                    None => {
                        let _ = tx.send(Err(ClientError::Send("subscription removed".into())));
                    }
                }
                if notify {
                    if let Some(channel) = inner.sub_ch_write.as_ref() {
                        let _ = channel.send(self.id);
                    }
                }
            }
        }
        FutureResult(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Transport("connection lost".into())),
            }
        })
    }

    /// Moves the subscription to `Unsubscribed` immediately and issues the
    /// wire unsubscribe best-effort.
    pub fn unsubscribe(&self) -> FutureResult<impl Future<Output = ()>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.client.0.lock().unwrap();
            let mut park = None;
            match inner.subscriptions.get_mut(self.id) {
                Some(sub) if sub.state != State::Unsubscribed => {
                    sub.move_to_unsubscribed(None);
                    park = Some(tx);
                }
                _ => {
                    let _ = tx.send(());
                }
            }
            if let Some(tx) = park {
                match inner.sub_ch_write.clone() {
                    Some(channel) => {
                        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
                            sub.on_unsubscribed_ch.push(tx);
                        }
                        let _ = channel.send(self.id);
                    }
                    None => {
                        let _ = tx.send(());
                    }
                }
            }
        }
        FutureResult(async move {
            let _ = rx.await;
        })
    }

    /// Publishes into this subscription's channel.
    pub fn publish(&self, data: Vec<u8>) -> FutureResult<impl Future<Output = Result<(), ClientError>>> {
        let channel = {
            let inner = self.client.0.lock().unwrap();
            inner
                .subscriptions
                .get(self.id)
                .map(|sub| sub.channel.to_string())
        };
        let pending = match channel {
            Some(channel) => self
                .client
                .enqueue(Command::Publish(PublishRequest { channel, data })),
            None => Err(ClientError::Send("subscription removed".into())),
        };
        FutureResult(async move {
            match await_reply(pending).await? {
                Reply::Publish(_) => Ok(()),
                reply => Err(ClientError::Protocol(format!("unexpected reply: {:?}", reply))),
            }
        })
    }

    pub fn on_subscribing(&self, func: impl FnMut() + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_subscribing = Some(Box::new(func));
        }
    }

    pub fn on_subscribed(&self, func: impl FnMut() + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_subscribed = Some(Box::new(func));
        }
    }

    pub fn on_unsubscribed(&self, func: impl FnMut() + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_unsubscribed = Some(Box::new(func));
        }
    }

    /// Sink for publications delivered on this channel, including
    /// publications replayed by recovery.
    pub fn on_publication(&self, func: impl FnMut(Publication) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_publication = Some(Box::new(func));
        }
    }

    pub fn on_join(&self, func: impl FnMut(ClientInfo) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_join = Some(Box::new(func));
        }
    }

    pub fn on_leave(&self, func: impl FnMut(ClientInfo) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_leave = Some(Box::new(func));
        }
    }

    pub fn on_error(&self, func: impl FnMut(ClientError) + Send + 'static) {
        let mut inner = self.client.0.lock().unwrap();
        if let Some(sub) = inner.subscriptions.get_mut(self.id) {
            sub.on_error = Some(Box::new(func));
        }
    }

    pub fn state(&self) -> State {
        let inner = self.client.0.lock().unwrap();
        inner
            .subscriptions
            .get(self.id)
            .map(|sub| sub.state)
            .unwrap_or(State::Unsubscribed)
    }

    pub fn channel(&self) -> String {
        let inner = self.client.0.lock().unwrap();
        inner
            .subscriptions
            .get(self.id)
            .map(|sub| sub.channel.to_string())
            .unwrap_or_default()
    }

    /// Last error recorded for this subscription, if any.
    pub fn last_error(&self) -> Option<ClientError> {
        let inner = self.client.0.lock().unwrap();
        inner
            .subscriptions
            .get(self.id)
            .and_then(|sub| sub.last_error.clone())
    }

    /// Current recovery position `(epoch, offset)`.
    pub fn stream_position(&self) -> Option<(String, u64)> {
        let inner = self.client.0.lock().unwrap();
        inner
            .subscriptions
            .get(self.id)
            .map(|sub| (sub.epoch.clone(), sub.offset))
    }
}
