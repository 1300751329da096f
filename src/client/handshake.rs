//! Session handshake.
//!
//! Spawns the transport handler over a freshly dialed stream and drives
//! the connect exchange. The connect command is the first and only entry
//! in the new control pipe, so it takes id 1 and exactly one connect is
//! ever outstanding.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::client::correlator::Correlator;
use crate::client::inner::ClientInner;
use crate::client::push::PushRouter;
use crate::client::transport::websocket_handler;
use crate::client::types::QueuedCommand;
use crate::protocol::{Command, ConnectRequest, ConnectResult, Disconnect, Reply};

pub(crate) struct HandshakeOutcome {
    /// Runs the session transport; resolves with the disconnect context
    /// once the session is over.
    pub(crate) handler: Pin<Box<dyn Future<Output = Disconnect> + Send>>,
    /// Feeds commands into the session writer.
    pub(crate) control_write: mpsc::Sender<QueuedCommand>,
    /// The server greeting.
    pub(crate) connect: ConnectResult,
}

pub(crate) struct HandshakeManager;

impl HandshakeManager {
    /// Performs the connect exchange over an established stream.
    ///
    /// On failure returns whether the connection cycle should retry.
    pub(crate) async fn do_handshake(
        client: &Arc<Mutex<ClientInner>>,
        closer_write: mpsc::Sender<Disconnect>,
        closer_read: mpsc::Receiver<Disconnect>,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<HandshakeOutcome, bool> {
        // resolve the connection token outside the lock
        let token_callback = { client.lock().unwrap().token_callback.clone() };
        let token = match &token_callback {
            Some(callback) => match callback().await {
                Ok(token) => {
                    client.lock().unwrap().token = token.clone();
                    token
                }
                Err(err) => {
                    client.lock().unwrap().emit_error(err);
                    return Err(true);
                }
            },
            None => client.lock().unwrap().token.clone(),
        };

        let (control_write, control_read) = mpsc::channel::<QueuedCommand>(32);
        let correlator = Arc::new(Correlator::new());

        let (rt, metrics, protocol, connect_rx) = {
            let inner = client.lock().unwrap();

            let (connect_tx, connect_rx) = oneshot::channel();
            let command = Command::Connect(ConnectRequest {
                token,
                data: Vec::new(),
                subs: HashMap::new(),
                name: inner.name.clone(),
                version: inner.version.clone(),
            });
            control_write
                .try_send(QueuedCommand {
                    command,
                    reply: connect_tx,
                    deadline: Instant::now() + inner.timeout,
                })
                .expect("fresh control channel has capacity");

            (
                inner.rt.clone(),
                inner.metrics.clone(),
                inner.protocol,
                connect_rx,
            )
        };

        let push_client = client.clone();
        let push_closer = closer_write.clone();
        let error_client = client.clone();
        let mut handler: Pin<Box<dyn Future<Output = Disconnect> + Send>> =
            Box::pin(websocket_handler(
                rt,
                stream,
                correlator,
                metrics,
                control_read,
                closer_read,
                protocol,
                move |push| PushRouter::route(&push_client, push, &push_closer),
                move |err| error_client.lock().unwrap().emit_error(err),
            ));

        tokio::select! {
            biased;

            disconnect = &mut handler => {
                client.lock().unwrap().apply_disconnect(&disconnect);
                Err(disconnect.reconnect)
            }

            result = connect_rx => {
                match result {
                    Ok(Ok(Reply::Connect(connect))) => {
                        log::debug!(
                            "connection established, client_id={}, version={}",
                            connect.client, connect.version
                        );
                        Ok(HandshakeOutcome { handler, control_write, connect })
                    }
                    Ok(Ok(Reply::Error(err))) => {
                        log::debug!("handshake refused: {} {}", err.code, err.message);
                        let disconnect = Disconnect {
                            code: err.code,
                            reason: err.message.clone(),
                            reconnect: err.temporary,
                            ..Default::default()
                        };
                        client.lock().unwrap().emit_error(err.into());
                        let _ = closer_write.try_send(disconnect);
                        let disconnect = handler.await;
                        Err(disconnect.reconnect)
                    }
                    Ok(Ok(reply)) => {
                        log::debug!("unexpected handshake reply: {:?}", reply);
                        let _ = closer_write.try_send(Disconnect {
                            reason: "unexpected handshake reply".into(),
                            reconnect: false,
                            ..Default::default()
                        });
                        let disconnect = handler.await;
                        Err(disconnect.reconnect)
                    }
                    Ok(Err(err)) => {
                        // connection dropped or the exchange timed out;
                        // close this transport and let the cycle retry
                        log::debug!("handshake failed: {:?}", err);
                        let _ = closer_write.try_send(Disconnect::transport_closed());
                        let disconnect = handler.await;
                        Err(disconnect.reconnect)
                    }
                    Err(err) => {
                        log::debug!("handshake failed: {:?}", err);
                        let _ = closer_write.try_send(Disconnect::transport_closed());
                        let disconnect = handler.await;
                        Err(disconnect.reconnect)
                    }
                }
            }
        }
    }
}
