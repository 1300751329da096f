//! Frame codec helpers shared by the engine and by test harnesses.
//!
//! A WebSocket message carries one or more protocol frames: newline-joined
//! JSON objects or varint length-delimited Protobuf messages, depending on
//! the configured [`Protocol`].

use std::io::BufRead;

use prost::Message as ProstMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Protocol;
use crate::errors::ClientError;

/// Same as `serde_json::from_slice`, but treats empty input as `null` so
/// that an absent payload and an explicit `null` decode identically.
pub fn decode_json<T: DeserializeOwned>(mut data: &[u8]) -> Result<T, ClientError> {
    if data.is_empty() {
        data = b"null";
    }

    serde_json::from_slice(data).map_err(|err| ClientError::Protocol(err.to_string()))
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(value).map_err(|err| ClientError::Protocol(err.to_string()))
}

/// Decodes every frame contained in one WebSocket message, invoking
/// `handle_frame` per frame with either the decoded value or the decode
/// failure. Trailing garbage that does not form a complete frame is
/// dropped.
pub fn decode_frames<T: DeserializeOwned + ProstMessage + Default>(
    data: &[u8],
    protocol: Protocol,
    handle_frame: impl FnMut(Result<T, ClientError>),
) {
    match protocol {
        Protocol::Json => decode_frames_json(data, handle_frame),
        Protocol::Protobuf => decode_frames_protobuf(data, handle_frame),
    }
}

fn decode_frames_json<T: DeserializeOwned>(
    data: &[u8],
    mut handle_frame: impl FnMut(Result<T, ClientError>),
) {
    for line in data.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::debug!("failed to read line: {}", err);
                handle_frame(Err(ClientError::Protocol(err.to_string())));
                continue;
            }
        };

        if line.is_empty() {
            continue;
        }

        log::trace!("<-- {}", line);

        handle_frame(match serde_json::from_str(&line) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                log::debug!("failed to parse frame: {}", err);
                Err(ClientError::Protocol(err.to_string()))
            }
        });
    }
}

fn decode_frames_protobuf<T: ProstMessage + Default>(
    mut data: &[u8],
    mut handle_frame: impl FnMut(Result<T, ClientError>),
) {
    while !data.is_empty() {
        let Ok(len) = prost::decode_length_delimiter(data) else {
            break;
        };
        let header = prost::length_delimiter_len(len);
        if header + len > data.len() {
            // need bounds check because the length delimiter is remote input
            log::trace!("<-- truncated frame, want {} of {} bytes", header + len, data.len());
            break;
        }

        let frame = &data[header..header + len];
        log::trace!("<-- frame len={} {}", len, hex_dump(frame));

        handle_frame(T::decode(frame).map_err(|err| ClientError::Protocol(err.to_string())));
        data = &data[header + len..];
    }
}

/// Encodes a batch of frames into a single WebSocket message. Returns
/// `None` when nothing could be encoded; `on_encode_error` receives the
/// index of every frame that failed to encode (JSON only, since Protobuf
/// encoding of an in-memory message cannot fail).
pub fn encode_frames<T: Serialize + ProstMessage>(
    frames: &[T],
    protocol: Protocol,
    mut on_encode_error: impl FnMut(usize),
) -> Option<Message> {
    match protocol {
        Protocol::Json => {
            let mut lines = Vec::with_capacity(frames.len());
            for (idx, frame) in frames.iter().enumerate() {
                match serde_json::to_string(frame) {
                    Ok(line) => {
                        log::trace!("--> {}", &line);
                        lines.push(line);
                    }
                    Err(err) => {
                        on_encode_error(idx);
                        log::debug!("failed to encode frame: {:?}", err);
                    }
                }
            }

            if lines.is_empty() {
                None
            } else {
                Some(Message::Text(lines.join("\n")))
            }
        }
        Protocol::Protobuf => {
            let mut buf = Vec::new();
            for frame in frames.iter() {
                let start = buf.len();
                frame
                    .encode_length_delimited(&mut buf)
                    .expect("vec write cannot fail");
                log::trace!("--> frame len={} {}", buf.len() - start, hex_dump(&buf[start..]));
            }
            Some(Message::Binary(buf))
        }
    }
}

/// Wire dumps are capped so a large frame does not flood the trace log.
const TRACE_DUMP_LIMIT: usize = 256;

fn hex_dump(frame: &[u8]) -> String {
    use std::fmt::Write;

    let shown = &frame[..frame.len().min(TRACE_DUMP_LIMIT)];
    let mut out = String::with_capacity(shown.len() * 2 + 2);
    for byte in shown {
        let _ = write!(out, "{:02x}", byte);
    }
    if frame.len() > TRACE_DUMP_LIMIT {
        out.push_str("..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, PublishRequest, RawCommand, RpcRequest};

    fn batch() -> Vec<RawCommand> {
        let mut publish = RawCommand::from(Command::Publish(PublishRequest {
            channel: "news".into(),
            data: br#"{"text":"hi"}"#.to_vec(),
        }));
        publish.id = 3;
        let mut rpc = RawCommand::from(Command::Rpc(RpcRequest {
            method: "sum".into(),
            data: b"[1,2]".to_vec(),
        }));
        rpc.id = 4;
        vec![publish, rpc]
    }

    #[test]
    fn protobuf_frames_survive_batching() {
        let message = encode_frames(&batch(), Protocol::Protobuf, |_| panic!()).unwrap();
        let Message::Binary(data) = message else {
            panic!("expected a binary message");
        };

        let mut decoded = Vec::new();
        decode_frames::<RawCommand>(&data, Protocol::Protobuf, |frame| {
            decoded.push(frame.unwrap());
        });
        assert_eq!(decoded, batch());
    }

    #[test]
    fn json_frames_survive_batching() {
        let message = encode_frames(&batch(), Protocol::Json, |_| panic!()).unwrap();
        let Message::Text(text) = message else {
            panic!("expected a text message");
        };
        assert_eq!(text.lines().count(), 2);

        let mut decoded = Vec::new();
        decode_frames::<RawCommand>(text.as_bytes(), Protocol::Json, |frame| {
            decoded.push(frame.unwrap());
        });
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].id, 3);
        assert_eq!(decoded[1].id, 4);
    }

    #[test]
    fn truncated_protobuf_frame_is_dropped() {
        let message = encode_frames(&batch(), Protocol::Protobuf, |_| panic!()).unwrap();
        let Message::Binary(data) = message else {
            panic!("expected a binary message");
        };

        let mut decoded = 0;
        decode_frames::<RawCommand>(&data[..data.len() - 1], Protocol::Protobuf, |frame| {
            frame.unwrap();
            decoded += 1;
        });
        assert_eq!(decoded, 1);
    }
}
