//! WebSocket transport tasks.
//!
//! One handler invocation owns one established WebSocket connection and
//! runs its two halves as dedicated tasks: the reader routes inbound
//! replies (correlated replies to the correlator, pushes onward, server
//! pings to the writer), the writer drains the per-connection command
//! channel, stamping ids as commands hit the wire.
//!
//! The reader is the single place where transport termination (close
//! frame, read error, or stream end) is translated into a normalized
//! [`Disconnect`], so the state machine sees one code path for every way
//! a session can end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::client::correlator::Correlator;
use crate::client::types::QueuedCommand;
use crate::config::Protocol;
use crate::errors::{disconnect_code, ClientError, ReplyError};
use crate::events::ClientEvent;
use crate::metrics::Metrics;
use crate::protocol::{Command, Disconnect, Push, RawCommand, RawReply, Reply};
use crate::utils::{decode_frames, encode_frames};

/// Maps a WebSocket close code to the engine disconnect it stands for.
pub(crate) fn normalize_close(code: u16, reason: &str) -> Disconnect {
    let (code, reconnect) = match code {
        1009 => (disconnect_code::MESSAGE_SIZE_LIMIT, true),
        1..=2999 => (disconnect_code::TRANSPORT_CLOSED, true),
        3000..=3499 => (code as u32, true),
        3500..=3999 => (code as u32, false),
        4000..=4499 => (code as u32, true),
        4500..=4999 => (code as u32, false),
        5000.. => (code as u32, true),
        _ => (code as u32, false),
    };
    Disconnect {
        code,
        reason: reason.to_string(),
        reconnect,
        ..Default::default()
    }
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn websocket_handler(
    rt: Handle,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    correlator: Arc<Correlator>,
    metrics: Arc<Metrics>,
    mut control_ch: mpsc::Receiver<QueuedCommand>,
    mut closer_ch: mpsc::Receiver<Disconnect>,
    protocol: Protocol,
    on_push: impl Fn(Push) + Send + Sync + 'static,
    on_error: impl Fn(ClientError) + Send + Sync + 'static,
) -> Disconnect {
    let (mut write_ws, mut read_ws) = stream.split();
    let (ping_write, mut ping_read) = mpsc::channel::<()>(1);
    let on_error_arc = Arc::new(on_error);

    let on_error = on_error_arc.clone();
    let reader_correlator = correlator.clone();
    let reader_metrics = metrics.clone();
    let reader_task = rt.spawn(async move {
        let disconnect = 'outer: loop {
            tokio::select! {
                biased;

                disconnect = closer_ch.recv() => {
                    break 'outer disconnect.unwrap_or_else(Disconnect::disconnect_called);
                }

                remote_msg = read_ws.next() => {
                    let message = match remote_msg {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            log::debug!("failed to read message: {}", err);
                            on_error(ClientError::Transport(err.to_string()));
                            break 'outer Disconnect::transport_closed();
                        }
                        None => break 'outer Disconnect::transport_closed(),
                    };

                    let data = match message {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(bin) => bin,
                        Message::Close(close_frame) => {
                            break 'outer match close_frame {
                                Some(frame) => {
                                    log::debug!(
                                        "connection closed by remote, code={}, reason={}",
                                        frame.code, frame.reason
                                    );
                                    normalize_close(u16::from(frame.code), &frame.reason)
                                }
                                None => Disconnect::transport_closed(),
                            };
                        }
                        _ => continue 'outer,
                    };

                    reader_metrics.add_received(data.len());
                    ClientEvent::TransportOnReply { protocol, bytes: data.len() }.emit();

                    decode_frames::<RawReply>(&data, protocol, |result| {
                        let raw = match result {
                            Ok(raw) => raw,
                            Err(err) => {
                                on_error(err);
                                return;
                            }
                        };

                        let id = raw.id;
                        let reply: Reply = raw.into();

                        if id == 0 {
                            match reply {
                                // server ping, answered with an empty command
                                Reply::Empty => {
                                    let _ = ping_write.try_send(());
                                }
                                Reply::Push(push) => on_push(push),
                                other => {
                                    log::debug!("non-push reply without id: {:?}", other);
                                    on_error(ClientError::Protocol(
                                        "reply carries no id and no push".into(),
                                    ));
                                }
                            }
                        } else {
                            reader_metrics.count_reply(reply.kind());
                            if !reader_correlator.complete(id, Ok(reply)) {
                                log::debug!("dropping reply for unknown id={}", id);
                            }
                        }
                    });
                }
            }
        };

        drop(ping_write);
        (read_ws, disconnect)
    });

    let on_error = on_error_arc;
    let writer_correlator = correlator.clone();
    let writer_metrics = metrics.clone();
    let writer_rt = rt.clone();
    let writer_task = rt.spawn(async move {
        let mut batch: Vec<QueuedCommand> = Vec::new();
        let mut commands: Vec<RawCommand> = Vec::new();

        'outer: loop {
            tokio::select! {
                biased;

                ping = ping_read.recv() => {
                    if ping.is_none() {
                        break 'outer;
                    }
                    let frames = [RawCommand::from(Command::Empty)];
                    if let Some(message) = encode_frames(&frames, protocol, |_| {}) {
                        let bytes = message_len(&message);
                        match write_ws.send(message).await {
                            Ok(()) => {
                                writer_metrics.add_sent(bytes);
                                ClientEvent::TransportSend { protocol, bytes, frames: 1 }.emit();
                            }
                            Err(err) => {
                                on_error(ClientError::Transport(err.to_string()));
                                break 'outer;
                            }
                        }
                    }
                }

                count = control_ch.recv_many(&mut batch, 32) => {
                    if count == 0 {
                        break 'outer;
                    }

                    let mut acks = Vec::new();
                    for entry in batch.drain(..) {
                        let timeout = entry.deadline.saturating_duration_since(Instant::now());
                        if timeout.is_zero() {
                            let _ = entry.reply.send(Err(ReplyError::Timeout(Duration::ZERO)));
                            continue;
                        }

                        let expects_reply = entry.command.expects_reply();
                        let mut command = RawCommand::from(entry.command);
                        if expects_reply {
                            command.id = writer_correlator.register(&writer_rt, entry.reply, timeout);
                        } else {
                            // fire-and-forget, acknowledged once written
                            acks.push(entry.reply);
                        }
                        commands.push(command);
                    }

                    if commands.is_empty() {
                        continue 'outer;
                    }

                    let frames = commands.len();
                    let message = encode_frames(&commands, protocol, |idx| {
                        log::debug!("dropping unencodable command at index {}", idx);
                    });
                    commands.clear();
                    let Some(message) = message else {
                        continue 'outer;
                    };

                    let bytes = message_len(&message);
                    match write_ws.send(message).await {
                        Ok(()) => {
                            writer_metrics.add_sent(bytes);
                            ClientEvent::TransportSend { protocol, bytes, frames }.emit();
                            for ack in acks {
                                let _ = ack.send(Ok(Reply::Empty));
                            }
                        }
                        Err(err) => {
                            on_error(ClientError::Transport(err.to_string()));
                            break 'outer;
                        }
                    }
                }
            }
        }

        write_ws
    });

    let (read_result, write_result) = tokio::join!(reader_task, writer_task);

    // evict every in-flight request before reporting the termination
    correlator.fail_all();

    let disconnect = match (read_result, write_result) {
        (Ok((read_ws, disconnect)), Ok(write_ws)) => {
            if let Ok(mut stream) = read_ws.reunite(write_ws) {
                let _ = stream.close(None).await;
            }
            disconnect
        }
        _ => {
            log::debug!("websocket task aborted");
            Disconnect::transport_closed()
        }
    };

    ClientEvent::TransportDisconnect {
        code: disconnect.code,
        reason: &disconnect.reason,
        reconnect: disconnect.reconnect,
    }
    .emit();
    disconnect
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_normalize_per_table() {
        let cases: &[(u16, u32, bool)] = &[
            (1000, disconnect_code::TRANSPORT_CLOSED, true),
            (1009, disconnect_code::MESSAGE_SIZE_LIMIT, true),
            (2999, disconnect_code::TRANSPORT_CLOSED, true),
            (3000, 3000, true),
            (3499, 3499, true),
            (3500, 3500, false),
            (3999, 3999, false),
            (4000, 4000, true),
            (4499, 4499, true),
            (4500, 4500, false),
            (4999, 4999, false),
            (5000, 5000, true),
            (65535, 65535, true),
            (0, 0, false),
        ];

        for &(input, code, reconnect) in cases {
            let disconnect = normalize_close(input, "bye");
            assert_eq!(disconnect.code, code, "close code {}", input);
            assert_eq!(disconnect.reconnect, reconnect, "close code {}", input);
            assert_eq!(disconnect.reason, "bye");
        }
    }
}
