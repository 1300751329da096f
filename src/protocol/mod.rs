//! Protocol types for communication with a Centrifugo-style server.
//!
//! The engine works with the [`Command`], [`Reply`] and [`Push`] enums;
//! their flattened wire counterparts (`RawCommand`, `RawReply`, `RawPush`)
//! carry the actual Protobuf/JSON field layout and are converted at the
//! codec boundary.

mod raw;

pub use raw::*;

use crate::errors::disconnect_code;

/// Client-to-server commands.
#[derive(Debug, Clone)]
pub enum Command {
    Connect(ConnectRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
    Presence(PresenceRequest),
    PresenceStats(PresenceStatsRequest),
    History(HistoryRequest),
    Ping(PingRequest),
    Send(SendRequest),
    Rpc(RpcRequest),
    Refresh(RefreshRequest),
    SubRefresh(SubRefreshRequest),
    Empty,
}

impl Command {
    /// Whether the server is expected to answer this command with a reply
    /// carrying the same id. `Send` is fire-and-forget and travels without
    /// an id; an empty command is the application-level pong.
    pub(crate) fn expects_reply(&self) -> bool {
        !matches!(self, Command::Send(_) | Command::Empty)
    }
}

/// Server-to-client replies.
#[derive(Debug, Clone)]
pub enum Reply {
    Push(Push),
    Error(Error),
    Connect(ConnectResult),
    Subscribe(SubscribeResult),
    Unsubscribe(UnsubscribeResult),
    Publish(PublishResult),
    Presence(PresenceResult),
    PresenceStats(PresenceStatsResult),
    History(HistoryResult),
    Ping(PingResult),
    Rpc(RpcResult),
    Refresh(RefreshResult),
    SubRefresh(SubRefreshResult),
    Empty,
}

impl Reply {
    /// Stable label used for per-kind reply counters.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Reply::Push(_) => "push",
            Reply::Error(_) => "error",
            Reply::Connect(_) => "connect",
            Reply::Subscribe(_) => "subscribe",
            Reply::Unsubscribe(_) => "unsubscribe",
            Reply::Publish(_) => "publish",
            Reply::Presence(_) => "presence",
            Reply::PresenceStats(_) => "presence_stats",
            Reply::History(_) => "history",
            Reply::Ping(_) => "ping",
            Reply::Rpc(_) => "rpc",
            Reply::Refresh(_) => "refresh",
            Reply::SubRefresh(_) => "sub_refresh",
            Reply::Empty => "empty",
        }
    }
}

/// Server-initiated message (a reply with id zero).
#[derive(Debug, Clone)]
pub struct Push {
    pub channel: String,
    pub data: PushData,
}

/// Payload variants of a server push.
#[derive(Debug, Clone)]
pub enum PushData {
    Publication(Publication),
    Join(Join),
    Leave(Leave),
    Unsubscribe(Unsubscribe),
    Message(Message),
    Subscribe(Subscribe),
    Connect(Connect),
    Disconnect(Disconnect),
    Refresh(Refresh),
    Empty,
}

impl Disconnect {
    /// Termination of the transport without a close frame or with an
    /// unusable one.
    pub(crate) fn transport_closed() -> Self {
        Disconnect {
            code: disconnect_code::TRANSPORT_CLOSED,
            reason: "transport closed".into(),
            reconnect: true,
            ..Default::default()
        }
    }

    /// Clean disconnect requested through the client API.
    pub(crate) fn disconnect_called() -> Self {
        Disconnect {
            code: disconnect_code::DISCONNECT_CALLED,
            reason: "disconnect called".into(),
            reconnect: false,
            ..Default::default()
        }
    }

    /// The connection token expired before a refresh went through.
    pub(crate) fn token_expired() -> Self {
        Disconnect {
            code: disconnect_code::TOKEN_EXPIRED,
            reason: "token expired".into(),
            reconnect: true,
            ..Default::default()
        }
    }
}

/// Declares the two-way mapping between a protocol enum and the flat
/// wire struct that carries one optional field per variant. Decoding
/// picks the first populated field in declaration order; a frame with
/// none of them becomes the empty variant, which doubles as the
/// application-level ping.
macro_rules! wire_mapping {
    ($enum_name:ident <=> $raw_name:ident { $($variant:ident: $field:ident),+ $(,)? }) => {
        impl From<$enum_name> for $raw_name {
            fn from(value: $enum_name) -> Self {
                let mut raw = $raw_name::default();
                match value {
                    $($enum_name::$variant(v) => raw.$field = Some(v.into()),)+
                    $enum_name::Empty => {}
                }
                raw
            }
        }

        impl From<$raw_name> for $enum_name {
            fn from(mut raw: $raw_name) -> Self {
                $(if let Some(v) = raw.$field.take() {
                    return $enum_name::$variant(v.into());
                })+
                $enum_name::Empty
            }
        }
    };
}

wire_mapping!(Command <=> RawCommand {
    Connect: connect,
    Subscribe: subscribe,
    Unsubscribe: unsubscribe,
    Publish: publish,
    Presence: presence,
    PresenceStats: presence_stats,
    History: history,
    Ping: ping,
    Send: send,
    Rpc: rpc,
    Refresh: refresh,
    SubRefresh: sub_refresh,
});

wire_mapping!(Reply <=> RawReply {
    Error: error,
    Push: push,
    Connect: connect,
    Subscribe: subscribe,
    Unsubscribe: unsubscribe,
    Publish: publish,
    Presence: presence,
    PresenceStats: presence_stats,
    History: history,
    Ping: ping,
    Rpc: rpc,
    Refresh: refresh,
    SubRefresh: sub_refresh,
});

wire_mapping!(PushData <=> RawPush {
    Publication: publication,
    Join: join,
    Leave: leave,
    Unsubscribe: unsubscribe,
    Message: message,
    Subscribe: subscribe,
    Connect: connect,
    Disconnect: disconnect,
    Refresh: refresh,
});

// `RawPush` additionally carries the channel, which lives on the `Push`
// wrapper rather than inside the payload enum.
impl From<Push> for RawPush {
    fn from(value: Push) -> Self {
        let mut raw: RawPush = value.data.into();
        raw.channel = value.channel;
        raw
    }
}

impl From<RawPush> for Push {
    fn from(mut value: RawPush) -> Self {
        let channel = std::mem::take(&mut value.channel);
        Push {
            channel,
            data: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_mapping_round_trips_every_command_kind() {
        let commands = [
            Command::Connect(ConnectRequest::default()),
            Command::Subscribe(SubscribeRequest::default()),
            Command::Unsubscribe(UnsubscribeRequest::default()),
            Command::Publish(PublishRequest::default()),
            Command::Presence(PresenceRequest::default()),
            Command::PresenceStats(PresenceStatsRequest::default()),
            Command::History(HistoryRequest::default()),
            Command::Ping(PingRequest::default()),
            Command::Send(SendRequest::default()),
            Command::Rpc(RpcRequest::default()),
            Command::Refresh(RefreshRequest::default()),
            Command::SubRefresh(SubRefreshRequest::default()),
        ];

        for command in commands {
            let name = format!("{:?}", command);
            let raw = RawCommand::from(command);
            assert_eq!(raw.id, 0);
            let back = Command::from(raw);
            assert_eq!(format!("{:?}", back), name);
        }

        assert!(matches!(
            Command::from(RawCommand::default()),
            Command::Empty
        ));
    }

    #[test]
    fn push_conversion_keeps_the_channel() {
        let push = Push {
            channel: "news".into(),
            data: PushData::Message(Message {
                data: b"{}".to_vec(),
            }),
        };

        let raw = RawPush::from(push);
        assert_eq!(raw.channel, "news");
        assert!(raw.message.is_some());

        let back = Push::from(raw);
        assert_eq!(back.channel, "news");
        assert!(matches!(back.data, PushData::Message(_)));
    }

    #[test]
    fn error_field_wins_reply_decoding() {
        let raw = RawReply {
            id: 7,
            error: Some(Error {
                code: 100,
                message: "boom".into(),
                temporary: false,
            }),
            publish: Some(PublishResult {}),
            ..Default::default()
        };
        assert!(matches!(Reply::from(raw), Reply::Error(_)));
    }
}
