//! Session counters and gauges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Shared counters updated by the transport tasks and the state machine.
/// All counters are monotonic; the two gauges mirror the most recent
/// reconnect overrides received from the server.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    reconnect_url: Mutex<Option<String>>,
    next_reconnect_at: Mutex<Option<SystemTime>>,
    replies: Mutex<HashMap<&'static str, u64>>,
}

impl Metrics {
    pub(crate) fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_connects(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_disconnects(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_reply(&self, kind: &'static str) {
        *self.replies.lock().unwrap().entry(kind).or_insert(0) += 1;
    }

    pub(crate) fn set_reconnect_url(&self, url: Option<String>) {
        *self.reconnect_url.lock().unwrap() = url;
    }

    pub(crate) fn set_next_reconnect_at(&self, at: Option<SystemTime>) {
        *self.next_reconnect_at.lock().unwrap() = at;
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnect_url: self.reconnect_url.lock().unwrap().clone(),
            next_reconnect_at: *self.next_reconnect_at.lock().unwrap(),
            replies: self
                .replies
                .lock()
                .unwrap()
                .iter()
                .map(|(kind, count)| (kind.to_string(), *count))
                .collect(),
        }
    }
}

/// Point-in-time copy of the client metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connects: u64,
    pub disconnects: u64,
    /// URL override for the next reconnect attempt, when the server
    /// provided one with its last disconnect.
    pub reconnect_url: Option<String>,
    /// Wall-clock time of the next reconnect attempt, when the server
    /// provided one with its last disconnect.
    pub next_reconnect_at: Option<SystemTime>,
    /// Reply counts by kind (`connect`, `publish`, `error`, ...).
    pub replies: HashMap<String, u64>,
}
