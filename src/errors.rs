//! Error types surfaced by the client.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by any client operation.
///
/// Errors produced while a request is in flight are delivered both to the
/// caller of the originating operation and to the client `errors` stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Dialing or handshaking with the server failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The established transport failed mid-session.
    #[error("transport failed: {0}")]
    Transport(String),

    /// A command or readiness wait exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered a command with an error reply.
    #[error("server error: {code} {message}")]
    Reply {
        code: u32,
        message: String,
        temporary: bool,
    },

    /// A subscription operation failed.
    #[error("subscription to {channel} failed: {source}")]
    Subscription {
        channel: String,
        #[source]
        source: Box<ClientError>,
    },

    /// A command could not be queued for sending.
    #[error("send failed: {0}")]
    Send(String),

    /// The client was closed; no further operations are possible.
    #[error("client is closed")]
    Closed,

    /// The server violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ClientError {
    pub(crate) fn subscription(channel: &str, source: ClientError) -> Self {
        ClientError::Subscription {
            channel: channel.to_string(),
            source: Box::new(source),
        }
    }
}

impl From<crate::protocol::Error> for ClientError {
    fn from(err: crate::protocol::Error) -> Self {
        ClientError::Reply {
            code: err.code,
            message: err.message,
            temporary: err.temporary,
        }
    }
}

/// Internal resolution of a parked request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection lost")]
    Disconnected,
    #[error("client is closed")]
    Shutdown,
}

impl From<ReplyError> for ClientError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::Timeout(after) => ClientError::Timeout(after),
            ReplyError::Disconnected => ClientError::Transport("connection lost".into()),
            ReplyError::Shutdown => ClientError::Closed,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewSubscriptionError {
    #[error("duplicate subscription")]
    Duplicate,
    #[error("channel name must not be empty")]
    EmptyChannel,
    #[error("client is closed")]
    Closed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveSubscriptionError {
    #[error("subscription must be unsubscribed to be removed")]
    NotUnsubscribed,
}

/// Disconnect codes used by the engine itself (as opposed to codes
/// received from the server or derived from transport close frames).
pub mod disconnect_code {
    /// Clean disconnect requested through the client API.
    pub const DISCONNECT_CALLED: u32 = 0;
    /// The transport terminated without a usable close code.
    pub const TRANSPORT_CLOSED: u32 = 1;
    /// The transport rejected a frame for exceeding its size limit.
    pub const MESSAGE_SIZE_LIMIT: u32 = 3;
    /// The connection token expired and could not be refreshed in time.
    pub const TOKEN_EXPIRED: u32 = 109;
}
