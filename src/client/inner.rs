//! Engine state and the connection lifecycle.
//!
//! `ClientInner` is the single mutex-guarded owner of the connection
//! state, the subscription registry, the command queue and the reconnect
//! context. Critical sections stay short; all I/O happens in the tasks
//! spawned by the connection cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use slotmap::SlotMap;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::client::connection::ConnectionManager;
use crate::client::handshake::{HandshakeManager, HandshakeOutcome};
use crate::client::refresh::RefreshScheduler;
use crate::client::subscription_handler::SubscriptionHandler;
use crate::client::types::{ChannelPublication, CommandQueue, QueuedCommand, State, StateEvent};
use crate::config::TokenCallback;
use crate::config::{Protocol, ReconnectStrategy};
use crate::errors::ClientError;
use crate::events::ClientEvent;
use crate::metrics::Metrics;
use crate::protocol::{ConnectResult, Disconnect};
use crate::subscription::{self, ServerSubscription, SubscriptionId, SubscriptionInner};

pub(crate) struct ClientInner {
    pub(crate) rt: Handle,
    pub(crate) url: Arc<str>,
    pub(crate) state: State,
    /// Id assigned by the server for the current session.
    pub(crate) client_id: Option<String>,
    pub(crate) token: String,
    pub(crate) token_callback: Option<TokenCallback>,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) protocol: Protocol,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) reconnect_strategy: Arc<dyn ReconnectStrategy>,
    pub(crate) timeout: Duration,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) command_queue: CommandQueue,
    /// Tells the current session to wind down, carrying the disconnect
    /// context it should report.
    pub(crate) closer_write: Option<mpsc::Sender<Disconnect>>,
    pub(crate) on_connecting: Option<Box<dyn FnMut() + Send + 'static>>,
    pub(crate) on_connected: Option<Box<dyn FnMut() + Send + 'static>>,
    pub(crate) on_connected_ch: Vec<oneshot::Sender<Result<(), ClientError>>>,
    pub(crate) on_disconnected: Option<Box<dyn FnMut() + Send + 'static>>,
    pub(crate) on_disconnected_ch: Vec<oneshot::Sender<()>>,
    pub(crate) on_error: Option<Box<dyn FnMut(ClientError) + Send + 'static>>,
    pub(crate) subscriptions: SlotMap<SubscriptionId, SubscriptionInner>,
    pub(crate) sub_name_to_id: HashMap<String, SubscriptionId>,
    /// Insertion order, which is also the replay order after reconnect.
    pub(crate) sub_order: Vec<SubscriptionId>,
    pub(crate) server_subs: HashMap<String, ServerSubscription>,
    /// Feeds subscription ids into the current session's flow handler.
    pub(crate) sub_ch_write: Option<mpsc::UnboundedSender<SubscriptionId>>,
    pub(crate) reconnect_url: Option<String>,
    pub(crate) next_reconnect_at: Option<SystemTime>,
    pub(crate) refresh_task: Option<AbortHandle>,
    pub(crate) state_tx: Option<broadcast::Sender<StateEvent>>,
    pub(crate) publication_tx: Option<broadcast::Sender<ChannelPublication>>,
    pub(crate) error_tx: Option<broadcast::Sender<ClientError>>,
    pub(crate) message_tx: Option<broadcast::Sender<Vec<u8>>>,
    pub(crate) active_tasks: usize,
}

impl ClientInner {
    // Disconnected, Connected -> Connecting
    //  - from Disconnected: `.connect()` called
    //  - from Connected: transient connection loss with reconnect allowed
    pub(crate) fn move_to_connecting(&mut self, outer: Arc<Mutex<Self>>) {
        debug_assert_ne!(self.state, State::Connecting);
        self.set_state(State::Connecting);
        self.start_connecting(outer);
    }

    // Connecting -> Connected, driven solely by the connect reply
    pub(crate) fn move_to_connected(&mut self, connect: &ConnectResult) {
        assert_eq!(self.state, State::Connecting);
        self.client_id = Some(connect.client.clone());
        self.reconnect_url = None;
        self.next_reconnect_at = None;
        self.metrics.set_reconnect_url(None);
        self.metrics.set_next_reconnect_at(None);
        self.metrics.incr_connects();

        // server-side subscriptions exist only as mirrors of the greeting
        self.server_subs.clear();
        for (channel, result) in &connect.subs {
            self.server_subs.insert(
                channel.clone(),
                ServerSubscription {
                    state: subscription::State::Subscribed,
                    recoverable: result.recoverable,
                    epoch: result.epoch.clone(),
                    offset: result.offset,
                },
            );
        }

        self.set_state(State::Connected);
    }

    // Connecting, Connected -> Disconnected
    pub(crate) fn move_to_disconnected(&mut self) {
        assert!(matches!(self.state, State::Connecting | State::Connected));
        if self.state == State::Connected {
            self.metrics.incr_disconnects();
        }
        self.closer_write = None;
        self.sub_ch_write = None;
        self.client_id = None;
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.teardown_subscriptions();
        self.server_subs.clear();
        for ch in self.on_connected_ch.drain(..) {
            let _ = ch.send(Err(ClientError::Connection("disconnected".into())));
        }
        self.set_state(State::Disconnected);
    }

    // * -> Closed, terminal
    pub(crate) fn move_to_closed(&mut self) {
        if self.state == State::Closed {
            return;
        }
        log::debug!("closing client, active_tasks={}", self.active_tasks);
        if self.state == State::Connected {
            self.metrics.incr_disconnects();
        }
        self.closer_write = None;
        self.sub_ch_write = None;
        self.client_id = None;
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
        self.reconnect_url = None;
        self.next_reconnect_at = None;
        self.metrics.set_reconnect_url(None);
        self.metrics.set_next_reconnect_at(None);

        // every queued call completes with the closed error
        self.command_queue.fail_all();
        for ch in self.on_connected_ch.drain(..) {
            let _ = ch.send(Err(ClientError::Closed));
        }

        for (_, sub) in self.subscriptions.iter_mut() {
            if sub.state != subscription::State::Unsubscribed {
                sub.move_to_unsubscribed(None);
            }
            for ch in sub.on_unsubscribed_ch.drain(..) {
                let _ = ch.send(());
            }
        }

        self.set_state(State::Closed);

        // drop the stream senders, closing each stream exactly once
        self.state_tx = None;
        self.publication_tx = None;
        self.error_tx = None;
        self.message_tx = None;

        // the registry does not survive close
        self.subscriptions.clear();
        self.sub_name_to_id.clear();
        self.sub_order.clear();
        self.server_subs.clear();
    }

    /// Registry teardown on connection loss: client-side records that
    /// want to be subscribed park in `Subscribing` until the replay,
    /// pending wire exchanges are forgotten.
    fn teardown_subscriptions(&mut self) {
        for (_, sub) in self.subscriptions.iter_mut() {
            sub.inflight = false;
            if let Some(task) = sub.refresh_task.take() {
                task.abort();
            }
            if sub.state == subscription::State::Subscribed {
                sub.move_to_subscribing();
            }
        }
    }

    /// Stores the reconnect overrides carried by a disconnect, mirroring
    /// them into the metrics gauges.
    pub(crate) fn apply_disconnect(&mut self, disconnect: &Disconnect) {
        if !disconnect.reconnect {
            return;
        }
        if !disconnect.reconnect_url.is_empty() {
            self.reconnect_url = Some(disconnect.reconnect_url.clone());
            self.metrics.set_reconnect_url(self.reconnect_url.clone());
        }
        if disconnect.next_reconnect_at != 0 {
            let at = SystemTime::UNIX_EPOCH + Duration::from_millis(disconnect.next_reconnect_at);
            self.next_reconnect_at = Some(at);
            self.metrics.set_next_reconnect_at(self.next_reconnect_at);
        }
    }

    pub(crate) fn emit_error(&mut self, err: ClientError) {
        log::debug!("client error: {}", err);
        if let Some(tx) = &self.error_tx {
            let _ = tx.send(err.clone());
        }
        if let Some(ref mut on_error) = self.on_error {
            on_error(err);
        }
    }

    // this function does the following
    //  - connects to the server, retrying with backoff (Connecting state)
    //  - runs the established session until it terminates (Connected state)
    //  - decides reconnect vs stop from the disconnect context
    async fn do_connection_cycle(client: Arc<Mutex<Self>>) {
        let client1 = client.clone();
        let disconnect: Option<Disconnect> = async move {
            let mut reconnect_attempt: u32 = 0;
            let outcome = loop {
                let (closer_write, mut closer_read) = {
                    let mut inner = client.lock().unwrap();
                    let (closer_write, closer_read) = mpsc::channel::<Disconnect>(1);
                    inner.closer_write = Some(closer_write.clone());
                    (closer_write, closer_read)
                };

                let result: Result<HandshakeOutcome, bool> = async {
                    reconnect_attempt += 1;
                    ConnectionManager::ensure_state(&client, State::Connecting)?;
                    ConnectionManager::wait_before_attempt(
                        &client,
                        &mut closer_read,
                        reconnect_attempt - 1,
                    )
                    .await?;

                    ConnectionManager::ensure_state(&client, State::Connecting)?;
                    let stream = ConnectionManager::dial(&client, &mut closer_read).await?;

                    ConnectionManager::ensure_state(&client, State::Connecting)?;
                    HandshakeManager::do_handshake(&client, closer_write, closer_read, stream).await
                }
                .await;

                match result {
                    Ok(outcome) => break outcome,
                    Err(retry) => {
                        let mut inner = client.lock().unwrap();
                        if inner.state != State::Connecting {
                            return None;
                        }
                        for ch in inner.on_connected_ch.drain(..) {
                            let _ = ch.send(Err(ClientError::Connection(
                                "connection attempt failed".into(),
                            )));
                        }
                        if retry {
                            continue;
                        }
                        // terminal failure: no retry is scheduled, only an
                        // explicit connect() revives the session
                        inner.move_to_disconnected();
                        return None;
                    }
                }
            };

            let HandshakeOutcome {
                handler,
                control_write,
                connect,
            } = outcome;

            let (sub_ch_write, sub_ch_read) = mpsc::unbounded_channel();
            let rt = {
                let mut inner = client.lock().unwrap();
                if inner.state != State::Connecting {
                    // user disconnected or closed during the handshake; the
                    // closer already told the handler to wind down
                    None
                } else {
                    inner.move_to_connected(&connect);
                    for ch in inner.on_connected_ch.drain(..) {
                        let _ = ch.send(Ok(()));
                    }

                    // replay client-side subscriptions in insertion order,
                    // each carrying its stored recovery position
                    let order = inner.sub_order.clone();
                    for sub_id in order {
                        if let Some(sub) = inner.subscriptions.get(sub_id) {
                            if sub.state != subscription::State::Unsubscribed {
                                let _ = sub_ch_write.send(sub_id);
                            }
                        }
                    }
                    inner.sub_ch_write = Some(sub_ch_write);
                    Some(inner.rt.clone())
                }
            };
            let Some(rt) = rt else {
                return Some(handler.await);
            };

            if connect.expires && connect.ttl > 0 {
                RefreshScheduler::schedule_connection(client.clone(), connect.ttl);
            }

            let pump = rt.spawn(Self::pump_commands(client.clone(), control_write.clone()));
            let subs = rt.spawn(SubscriptionHandler::handle_subscriptions(
                client.clone(),
                sub_ch_read,
                control_write,
            ));

            let disconnect = handler.await;
            pump.abort();
            subs.abort();
            Some(disconnect)
        }
        .await;

        {
            let mut inner = client1.lock().unwrap();
            match disconnect {
                Some(disconnect) => {
                    inner.apply_disconnect(&disconnect);
                    if inner.state == State::Connected {
                        inner.move_to_disconnected();
                        if disconnect.reconnect {
                            inner.move_to_connecting(client1.clone());
                        } else {
                            for ch in inner.on_disconnected_ch.drain(..) {
                                let _ = ch.send(());
                            }
                        }
                    } else {
                        for ch in inner.on_disconnected_ch.drain(..) {
                            let _ = ch.send(());
                        }
                    }
                }
                None => {
                    for ch in inner.on_disconnected_ch.drain(..) {
                        let _ = ch.send(());
                    }
                }
            }
        }
    }

    /// Moves queued commands into the session writer, draining the
    /// control lane first. Runs for the lifetime of one session.
    async fn pump_commands(client: Arc<Mutex<Self>>, control_write: mpsc::Sender<QueuedCommand>) {
        let mut activity = {
            let mut inner = client.lock().unwrap();
            inner.command_queue.reset_channel()
        };

        const MAX_BATCH: usize = 32;
        let mut buffer = Vec::new();
        loop {
            {
                let mut inner = client.lock().unwrap();
                if inner.state == State::Closed {
                    break;
                }
                let now = Instant::now();
                for _ in 0..MAX_BATCH {
                    if let Some(item) = inner.command_queue.get_next(now) {
                        buffer.push(item);
                    } else {
                        break;
                    }
                }
            }
            if buffer.is_empty() {
                let Some(()) = activity.recv().await else {
                    break;
                };
            } else {
                for item in buffer.drain(..) {
                    // a send failure means the writer is gone; the parked
                    // caller then resolves with the disconnected error
                    let _ = control_write.send(item).await;
                }
            }
        }
    }

    fn start_connecting(&mut self, client: Arc<Mutex<Self>>) {
        self.active_tasks += 1;

        self.rt.spawn(async move {
            Self::do_connection_cycle(client.clone()).await;
            let mut inner = client.lock().unwrap();
            inner.active_tasks -= 1;
        });
    }

    fn set_state(&mut self, state: State) {
        let previous = self.state;
        log::debug!("state: {:?} -> {:?}", previous, state);
        ClientEvent::StateChanged {
            from: previous,
            to: state,
        }
        .emit();
        self.state = state;

        if let Some(tx) = &self.state_tx {
            let _ = tx.send(StateEvent {
                previous,
                current: state,
                at: SystemTime::now(),
            });
        }

        match state {
            State::Disconnected => {
                if let Some(ref mut on_disconnected) = self.on_disconnected {
                    on_disconnected();
                }
            }
            State::Connecting => {
                if let Some(ref mut on_connecting) = self.on_connecting {
                    on_connecting();
                }
            }
            State::Connected => {
                if let Some(ref mut on_connected) = self.on_connected {
                    on_connected();
                }
            }
            State::Closed => {}
        }
    }
}
