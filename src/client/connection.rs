//! Dialing and reconnect pacing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::client::inner::ClientInner;
use crate::client::types::State;
use crate::config::Protocol;
use crate::errors::ClientError;
use crate::protocol::Disconnect;

pub(crate) struct ConnectionManager;

impl ConnectionManager {
    /// Waits out the pacing before the given attempt. A server-provided
    /// `next_reconnect_at` takes precedence over the configured backoff
    /// and is consumed by this attempt.
    ///
    /// Resolves `Err(false)` when the session closer fires first.
    pub(crate) async fn wait_before_attempt(
        client: &Arc<Mutex<ClientInner>>,
        closer_read: &mut mpsc::Receiver<Disconnect>,
        attempt: u32,
    ) -> Result<(), bool> {
        let delay = {
            let mut inner = client.lock().unwrap();
            if let Some(at) = inner.next_reconnect_at.take() {
                at.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO)
            } else if attempt > 0 {
                inner.reconnect_strategy.time_before_next_attempt(attempt)
            } else {
                Duration::ZERO
            }
        };

        if attempt > 0 {
            log::debug!("reconnect attempt {} in {:?}", attempt, delay);
        }

        // the closer doubles as the cancellation signal for the wait
        match tokio::time::timeout(delay, closer_read.recv()).await {
            Err(_) => Ok(()),
            Ok(_) => {
                log::debug!("backoff wait aborted by session closer");
                Err(false)
            }
        }
    }

    /// Dials the WebSocket endpoint. A server-provided `reconnect_url`
    /// replaces the configured URL for this attempt only.
    pub(crate) async fn dial(
        client: &Arc<Mutex<ClientInner>>,
        closer_read: &mut mpsc::Receiver<Disconnect>,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, bool> {
        let (url, headers, protocol) = {
            let mut inner = client.lock().unwrap();
            let url = inner
                .reconnect_url
                .take()
                .unwrap_or_else(|| inner.url.to_string());
            (url, inner.headers.clone(), inner.protocol)
        };

        tokio::select! {
            biased;
            _ = closer_read.recv() => {
                log::debug!("dial aborted by session closer");
                Err(false)
            }
            result = Self::dial_once(client.clone(), url, headers, protocol) => result,
        }
    }

    async fn dial_once(
        client: Arc<Mutex<ClientInner>>,
        url: String,
        headers: Vec<(String, String)>,
        protocol: Protocol,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, bool> {
        log::debug!("dialing {}", &url);

        let request = match build_request(&url, &headers, protocol) {
            Ok(request) => request,
            Err(err) => {
                log::debug!("{err}");
                let mut inner = client.lock().unwrap();
                if inner.state != State::Connecting {
                    return Err(false);
                }
                inner.emit_error(ClientError::Connection(err.to_string()));
                // a malformed url or header cannot be retried away
                return Err(false);
            }
        };

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => Ok(stream),
            Err(err) => {
                log::debug!("{err}");
                let mut inner = client.lock().unwrap();
                if inner.state != State::Connecting {
                    return Err(false);
                }

                let retry = !matches!(err, tungstenite::Error::Url(_));
                inner.emit_error(ClientError::Connection(err.to_string()));
                Err(retry)
            }
        }
    }

    pub(crate) fn ensure_state(
        client: &Arc<Mutex<ClientInner>>,
        expected: State,
    ) -> Result<(), bool> {
        if client.lock().unwrap().state == expected {
            Ok(())
        } else {
            Err(false)
        }
    }
}

fn build_request(
    url: &str,
    headers: &[(String, String)],
    protocol: Protocol,
) -> Result<tungstenite::handshake::client::Request, tungstenite::Error> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        http::header::SEC_WEBSOCKET_PROTOCOL,
        http::HeaderValue::from_static(protocol.subprotocol()),
    );
    for (name, value) in headers {
        let name =
            http::header::HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?;
        let value = http::HeaderValue::from_str(value).map_err(http::Error::from)?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}
