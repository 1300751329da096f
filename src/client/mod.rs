//! Client for Centrifugo-style real-time messaging servers.
//!
//! The [`Client`] owns one logical session to a server. It keeps the
//! session alive across network interruptions, replays client-side
//! subscriptions after a reconnect and exposes request/response
//! operations (publish, rpc, history, presence) on top of the shared
//! command pipeline.
//!
//! ```rust,no_run
//! use centrifuge_client::client::Client;
//! use centrifuge_client::config::Config;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new("ws://localhost:8000/connection/websocket", Config::new());
//! client.connect().await?;
//!
//! let sub = client.new_subscription("news")?;
//! sub.on_publication(|publication| {
//!     println!("news: {:?}", publication.data);
//! });
//! sub.subscribe().await?;
//!
//! client.publish("news", br#"{"text":"hello"}"#.to_vec()).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub(crate) mod connection;
pub(crate) mod correlator;
pub(crate) mod handshake;
pub(crate) mod inner;
pub(crate) mod push;
pub(crate) mod refresh;
pub(crate) mod subscription_handler;
pub(crate) mod transport;
pub mod types;

use std::collections::HashMap;
use std::future::Future;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use slotmap::SlotMap;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};

use crate::config::{Config, SubscriptionConfig};
use crate::errors::{ClientError, NewSubscriptionError, RemoveSubscriptionError, ReplyError};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::protocol::{
    ClientInfo, Command, Disconnect, HistoryRequest, HistoryResult, PresenceRequest,
    PresenceStatsRequest, PresenceStatsResult, PublishRequest, Reply, RpcRequest, SendRequest,
};
use crate::subscription::{self, ServerSubscription, Subscription, SubscriptionInner};

use inner::ClientInner;
use types::{CommandQueue, Lane};
pub use types::{ChannelPublication, HistoryOptions, State, StateEvent};

/// A regular future which you can poll to get the result, but which is
/// also fine to drop if the outcome does not matter to the caller.
pub struct FutureResult<T>(pub(crate) T);

impl<T, R> IntoFuture for FutureResult<T>
where
    T: Future<Output = R>,
{
    type Output = R;
    type IntoFuture = T;

    fn into_future(self) -> Self::IntoFuture {
        self.0
    }
}

pub(crate) struct PendingRequest {
    rx: oneshot::Receiver<Result<Reply, ReplyError>>,
    deadline: Instant,
    timeout: Duration,
    error_tx: Option<broadcast::Sender<ClientError>>,
}

pub(crate) type PendingReply = Result<PendingRequest, ClientError>;

/// Resolves an enqueued command into its reply, translating server
/// errors, transport loss and the deadline into [`ClientError`]. Every
/// failure is also copied onto the client errors stream.
pub(crate) async fn await_reply(pending: PendingReply) -> Result<Reply, ClientError> {
    let request = pending?;
    let result = match tokio::time::timeout_at(request.deadline.into(), request.rx).await {
        Ok(Ok(Ok(Reply::Error(err)))) => Err(err.into()),
        Ok(Ok(Ok(reply))) => Ok(reply),
        Ok(Ok(Err(err))) => Err(err.into()),
        Ok(Err(_)) => Err(ClientError::Transport("connection lost".into())),
        Err(_) => Err(ClientError::Timeout(request.timeout)),
    };
    if let (Err(err), Some(tx)) = (&result, &request.error_tx) {
        let _ = tx.send(err.clone());
    }
    result
}

/// Handle to one client session. Cheap to clone and safe to share
/// between tasks; all operations are serialized through the engine
/// mutex.
#[derive(Clone)]
pub struct Client(pub(crate) Arc<Mutex<ClientInner>>);

impl Client {
    /// Creates a client bound to `url`. Nothing is dialed until
    /// [`connect`](Self::connect) is called.
    pub fn new(url: &str, config: Config) -> Self {
        let rt = config.runtime.unwrap_or_else(Handle::current);

        let (state_tx, _) = broadcast::channel(64);
        let (publication_tx, _) = broadcast::channel(config.stream_buffer.max(1));
        let (error_tx, _) = broadcast::channel(64);
        let (message_tx, _) = broadcast::channel(config.stream_buffer.max(1));

        Self(Arc::new(Mutex::new(ClientInner {
            rt,
            url: url.into(),
            state: State::Disconnected,
            client_id: None,
            token: config.token,
            token_callback: config.token_callback,
            name: config.name,
            version: config.version,
            protocol: config.protocol,
            headers: config.headers,
            reconnect_strategy: config.reconnect_strategy,
            timeout: config.timeout,
            metrics: Arc::new(Metrics::default()),
            command_queue: CommandQueue::new(config.timeout, config.max_pending_commands),
            closer_write: None,
            on_connecting: None,
            on_connected: None,
            on_connected_ch: Vec::new(),
            on_disconnected: None,
            on_disconnected_ch: Vec::new(),
            on_error: None,
            subscriptions: SlotMap::with_key(),
            sub_name_to_id: HashMap::new(),
            sub_order: Vec::new(),
            server_subs: HashMap::new(),
            sub_ch_write: None,
            reconnect_url: None,
            next_reconnect_at: None,
            refresh_task: None,
            state_tx: Some(state_tx),
            publication_tx: Some(publication_tx),
            error_tx: Some(error_tx),
            message_tx: Some(message_tx),
            active_tasks: 0,
        })))
    }

    /// Starts connecting. The future resolves once the session is
    /// established, or with an error when the first attempt fails (the
    /// engine keeps retrying in the background either way).
    ///
    /// Concurrent callers attach to the same in-flight attempt.
    pub fn connect(&self) -> FutureResult<impl Future<Output = Result<(), ClientError>>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.0.lock().unwrap();
            match inner.state {
                State::Closed => {
                    let _ = tx.send(Err(ClientError::Closed));
                }
                State::Connected => {
                    let _ = tx.send(Ok(()));
                }
                State::Connecting => inner.on_connected_ch.push(tx),
                State::Disconnected => {
                    inner.on_connected_ch.push(tx);
                    inner.move_to_connecting(self.0.clone());
                }
            }
        }
        FutureResult(async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Connection("connect interrupted".into())),
            }
        })
    }

    /// Awaits `Connected`. Fails immediately on `Disconnected` or
    /// `Closed`; while `Connecting` the wait is bounded by the
    /// configured timeout.
    pub fn ready(&self) -> FutureResult<impl Future<Output = Result<(), ClientError>>> {
        let (tx, rx) = oneshot::channel();
        let timeout = {
            let mut inner = self.0.lock().unwrap();
            match inner.state {
                State::Connected => {
                    let _ = tx.send(Ok(()));
                }
                State::Closed => {
                    let _ = tx.send(Err(ClientError::Closed));
                }
                State::Disconnected => {
                    let _ = tx.send(Err(ClientError::Connection(
                        "client is disconnected".into(),
                    )));
                }
                State::Connecting => inner.on_connected_ch.push(tx),
            }
            inner.timeout
        };
        FutureResult(async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ClientError::Transport("connection lost".into())),
                Err(_) => Err(ClientError::Timeout(timeout)),
            }
        })
    }

    /// Disconnects. The session will not reconnect until `connect()` is
    /// called again; subscriptions keep their desired state and replay
    /// on the next connect.
    pub fn disconnect(&self) -> FutureResult<impl Future<Output = ()>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.0.lock().unwrap();
            match inner.state {
                State::Disconnected | State::Closed => {
                    let _ = tx.send(());
                }
                State::Connecting | State::Connected => {
                    inner.on_disconnected_ch.push(tx);
                    let closer = inner.closer_write.take();
                    inner.move_to_disconnected();
                    if let Some(closer) = closer {
                        let _ = closer.try_send(Disconnect::disconnect_called());
                    }
                }
            }
        }
        FutureResult(async move {
            let _ = rx.await;
        })
    }

    /// Closes the client for good: tears the session down, fails every
    /// queued call with the closed error, clears the registry and closes
    /// all streams. The future resolves once the session task has
    /// terminated.
    pub fn close(&self) -> FutureResult<impl Future<Output = ()>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.0.lock().unwrap();
            match inner.state {
                State::Closed => {
                    let _ = tx.send(());
                }
                State::Disconnected => {
                    inner.move_to_closed();
                    let _ = tx.send(());
                }
                State::Connecting | State::Connected => {
                    inner.on_disconnected_ch.push(tx);
                    let closer = inner.closer_write.take();
                    inner.move_to_closed();
                    if let Some(closer) = closer {
                        let _ = closer.try_send(Disconnect::disconnect_called());
                    }
                }
            }
        }
        FutureResult(async move {
            let _ = rx.await;
        })
    }

    /// Sends an asynchronous message to the server. No reply is
    /// expected; the future resolves once the frame is written.
    pub fn send(&self, data: Vec<u8>) -> FutureResult<impl Future<Output = Result<(), ClientError>>> {
        let pending = self.enqueue(Command::Send(SendRequest { data }));
        FutureResult(async move { await_reply(pending).await.map(|_| ()) })
    }

    /// Calls a server-side RPC method.
    pub fn rpc(
        &self,
        method: &str,
        data: Vec<u8>,
    ) -> FutureResult<impl Future<Output = Result<Vec<u8>, ClientError>>> {
        let pending = self.enqueue(Command::Rpc(RpcRequest {
            method: method.into(),
            data,
        }));
        FutureResult(async move {
            match await_reply(pending).await? {
                Reply::Rpc(result) => Ok(result.data),
                reply => Err(ClientError::Protocol(format!("unexpected reply: {:?}", reply))),
            }
        })
    }

    /// Publishes data into a channel.
    pub fn publish(
        &self,
        channel: &str,
        data: Vec<u8>,
    ) -> FutureResult<impl Future<Output = Result<(), ClientError>>> {
        let pending = self.enqueue(Command::Publish(PublishRequest {
            channel: channel.into(),
            data,
        }));
        FutureResult(async move {
            match await_reply(pending).await? {
                Reply::Publish(_) => Ok(()),
                reply => Err(ClientError::Protocol(format!("unexpected reply: {:?}", reply))),
            }
        })
    }

    /// Fetches channel history.
    pub fn history(
        &self,
        channel: &str,
        options: HistoryOptions,
    ) -> FutureResult<impl Future<Output = Result<HistoryResult, ClientError>>> {
        let pending = self.enqueue(Command::History(HistoryRequest {
            channel: channel.into(),
            limit: options.limit,
            since: options.since,
            reverse: options.reverse,
        }));
        FutureResult(async move {
            match await_reply(pending).await? {
                Reply::History(result) => Ok(result),
                reply => Err(ClientError::Protocol(format!("unexpected reply: {:?}", reply))),
            }
        })
    }

    /// Fetches the presence map of a channel.
    pub fn presence(
        &self,
        channel: &str,
    ) -> FutureResult<impl Future<Output = Result<HashMap<String, ClientInfo>, ClientError>>> {
        let pending = self.enqueue(Command::Presence(PresenceRequest {
            channel: channel.into(),
        }));
        FutureResult(async move {
            match await_reply(pending).await? {
                Reply::Presence(result) => Ok(result.presence),
                reply => Err(ClientError::Protocol(format!("unexpected reply: {:?}", reply))),
            }
        })
    }

    /// Fetches presence counters of a channel.
    pub fn presence_stats(
        &self,
        channel: &str,
    ) -> FutureResult<impl Future<Output = Result<PresenceStatsResult, ClientError>>> {
        let pending = self.enqueue(Command::PresenceStats(PresenceStatsRequest {
            channel: channel.into(),
        }));
        FutureResult(async move {
            match await_reply(pending).await? {
                Reply::PresenceStats(result) => Ok(result),
                reply => Err(ClientError::Protocol(format!("unexpected reply: {:?}", reply))),
            }
        })
    }

    /// Creates a client-side subscription with default options.
    pub fn new_subscription(&self, channel: &str) -> Result<Subscription, NewSubscriptionError> {
        self.new_subscription_with(channel, SubscriptionConfig::default())
    }

    /// Creates a client-side subscription. Fails when one already exists
    /// for this channel.
    pub fn new_subscription_with(
        &self,
        channel: &str,
        config: SubscriptionConfig,
    ) -> Result<Subscription, NewSubscriptionError> {
        let mut inner = self.0.lock().unwrap();
        if inner.state == State::Closed {
            return Err(NewSubscriptionError::Closed);
        }
        if channel.is_empty() {
            return Err(NewSubscriptionError::EmptyChannel);
        }
        if inner.sub_name_to_id.contains_key(channel) {
            return Err(NewSubscriptionError::Duplicate);
        }

        let key = inner
            .subscriptions
            .insert(SubscriptionInner::new(channel, config));
        inner.sub_name_to_id.insert(channel.to_string(), key);
        inner.sub_order.push(key);
        Ok(Subscription::new(self, key))
    }

    /// Looks up an existing client-side subscription.
    pub fn get_subscription(&self, channel: &str) -> Option<Subscription> {
        let inner = self.0.lock().unwrap();
        inner
            .sub_name_to_id
            .get(channel)
            .map(|id| Subscription::new(self, *id))
    }

    /// Removes a subscription. It must be unsubscribed first.
    pub fn remove_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<(), RemoveSubscriptionError> {
        let mut inner = self.0.lock().unwrap();
        match inner.subscriptions.get(subscription.id) {
            Some(sub) if sub.state != subscription::State::Unsubscribed => {
                Err(RemoveSubscriptionError::NotUnsubscribed)
            }
            Some(_) => {
                if let Some(sub) = inner.subscriptions.remove(subscription.id) {
                    inner.sub_name_to_id.remove(&*sub.channel);
                    inner.sub_order.retain(|&id| id != subscription.id);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Subscriptions maintained by the server for this session.
    pub fn server_subscriptions(&self) -> HashMap<String, ServerSubscription> {
        self.0.lock().unwrap().server_subs.clone()
    }

    pub fn on_connecting(&self, func: impl FnMut() + Send + 'static) {
        self.0.lock().unwrap().on_connecting = Some(Box::new(func));
    }

    pub fn on_connected(&self, func: impl FnMut() + Send + 'static) {
        self.0.lock().unwrap().on_connected = Some(Box::new(func));
    }

    pub fn on_disconnected(&self, func: impl FnMut() + Send + 'static) {
        self.0.lock().unwrap().on_disconnected = Some(Box::new(func));
    }

    pub fn on_error(&self, func: impl FnMut(ClientError) + Send + 'static) {
        self.0.lock().unwrap().on_error = Some(Box::new(func));
    }

    /// Current connection state.
    pub fn state(&self) -> State {
        self.0.lock().unwrap().state
    }

    /// Server-assigned id of the current session, while connected.
    pub fn client_id(&self) -> Option<String> {
        self.0.lock().unwrap().client_id.clone()
    }

    /// Stream of connection state transitions.
    pub fn states(&self) -> broadcast::Receiver<StateEvent> {
        let inner = self.0.lock().unwrap();
        match &inner.state_tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stream of publications across all subscriptions.
    pub fn publications(&self) -> broadcast::Receiver<ChannelPublication> {
        let inner = self.0.lock().unwrap();
        match &inner.publication_tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stream of engine errors.
    pub fn errors(&self) -> broadcast::Receiver<ClientError> {
        let inner = self.0.lock().unwrap();
        match &inner.error_tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stream of asynchronous server messages (`send` from the server).
    pub fn messages(&self) -> broadcast::Receiver<Vec<u8>> {
        let inner = self.0.lock().unwrap();
        match &inner.message_tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Point-in-time metrics of this client.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.0.lock().unwrap().metrics.snapshot()
    }

    /// Replaces the authentication token used for future connects and
    /// refreshes.
    pub fn set_token(&self, token: impl Into<String>) {
        self.0.lock().unwrap().token = token.into();
    }

    /// Enqueues a command on the normal lane, observing the closed
    /// precondition and the queue high-water mark.
    pub(crate) fn enqueue(&self, command: Command) -> PendingReply {
        let mut inner = self.0.lock().unwrap();
        if inner.state == State::Closed {
            return Err(ClientError::Closed);
        }
        let timeout = inner.timeout;
        let deadline = Instant::now() + timeout;
        let error_tx = inner.error_tx.clone();
        let rx = inner
            .command_queue
            .push(Lane::Normal, command)
            .map_err(|_| ClientError::Send("command queue is full".into()))?;
        Ok(PendingRequest {
            rx,
            deadline,
            timeout,
            error_tx,
        })
    }
}
