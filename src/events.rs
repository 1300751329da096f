//! Structured observable events.
//!
//! Every significant engine action is describable as one of these typed
//! events; emission goes through the `log` facade with a stable `event=`
//! tag so sinks can filter without parsing free-form text.

use crate::client::State;
use crate::config::Protocol;

pub(crate) enum ClientEvent<'a> {
    TransportSend {
        protocol: Protocol,
        bytes: usize,
        frames: usize,
    },
    TransportOnReply {
        protocol: Protocol,
        bytes: usize,
    },
    TransportDisconnect {
        code: u32,
        reason: &'a str,
        reconnect: bool,
    },
    StateChanged {
        from: State,
        to: State,
    },
}

impl ClientEvent<'_> {
    pub(crate) fn emit(&self) {
        match self {
            ClientEvent::TransportSend {
                protocol,
                bytes,
                frames,
            } => log::debug!(
                "event=transport_send transport=websocket protocol={:?} bytes={} frames={}",
                protocol,
                bytes,
                frames
            ),
            ClientEvent::TransportOnReply { protocol, bytes } => log::debug!(
                "event=transport_on_reply transport=websocket protocol={:?} bytes={}",
                protocol,
                bytes
            ),
            ClientEvent::TransportDisconnect {
                code,
                reason,
                reconnect,
            } => log::debug!(
                "event=transport_disconnect code={} reason={:?} reconnect={}",
                code,
                reason,
                reconnect
            ),
            ClientEvent::StateChanged { from, to } => {
                log::debug!("event=state_changed from={:?} to={:?}", from, to)
            }
        }
    }
}
