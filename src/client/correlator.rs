//! Command id allocation and reply correlation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::errors::ReplyError;
use crate::protocol::Reply;

struct PendingReply {
    reply: oneshot::Sender<Result<Reply, ReplyError>>,
    timer: Option<AbortHandle>,
}

/// Session-scoped table of in-flight requests.
///
/// Ids are allocated with a fetch-add counter starting at one, so within a
/// session they are unique and strictly increasing; zero is reserved for
/// pushes and never enters the table. Each entry couples the parked
/// caller with an optional timeout timer; whichever of reply, timeout or
/// teardown fires first consumes the entry, the rest find it gone.
pub(crate) struct Correlator {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingReply>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Correlator {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates the next id and parks `reply` under it. A timer task is
    /// spawned unless the timeout is `Duration::MAX`.
    pub(crate) fn register(
        self: &Arc<Self>,
        rt: &Handle,
        reply: oneshot::Sender<Result<Reply, ReplyError>>,
        timeout: Duration,
    ) -> u32 {
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                break id;
            }
        };

        let timer = if timeout == Duration::MAX {
            None
        } else {
            let correlator = self.clone();
            Some(
                rt.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let mut pending = correlator.pending.lock().unwrap();
                    if let Some(entry) = pending.remove(&id) {
                        let _ = entry.reply.send(Err(ReplyError::Timeout(timeout)));
                    }
                })
                .abort_handle(),
            )
        };

        self.pending
            .lock()
            .unwrap()
            .insert(id, PendingReply { reply, timer });
        id
    }

    /// Resumes the caller parked under `id`. Returns false for an unknown
    /// (already evicted) id; the reply is then dropped.
    pub(crate) fn complete(&self, id: u32, result: Result<Reply, ReplyError>) -> bool {
        match self.pending.lock().unwrap().remove(&id) {
            Some(entry) => {
                let _ = entry.reply.send(result);
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Evicts every pending entry, resolving each with the disconnected
    /// error. Called once when the session terminates.
    pub(crate) fn fail_all(&self) {
        for (_, entry) in self.pending.lock().unwrap().drain() {
            let _ = entry.reply.send(Err(ReplyError::Disconnected));
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PublishResult, Reply};

    #[tokio::test]
    async fn ids_are_strictly_increasing() {
        let correlator = Arc::new(Correlator::new());
        let rt = Handle::current();

        let mut last = 0;
        for _ in 0..100 {
            let (tx, _rx) = oneshot::channel();
            let id = correlator.register(&rt, tx, Duration::MAX);
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn reply_resumes_exactly_one_caller() {
        let correlator = Arc::new(Correlator::new());
        let rt = Handle::current();

        let (tx, rx) = oneshot::channel();
        let id = correlator.register(&rt, tx, Duration::MAX);

        assert!(correlator.complete(id, Ok(Reply::Publish(PublishResult {}))));
        assert!(matches!(rx.await, Ok(Ok(Reply::Publish(_)))));
        // a second reply for the same id finds the entry gone
        assert!(!correlator.complete(id, Ok(Reply::Publish(PublishResult {}))));
    }

    #[tokio::test]
    async fn deadline_evicts_the_entry() {
        let correlator = Arc::new(Correlator::new());
        let rt = Handle::current();

        let (tx, rx) = oneshot::channel();
        let id = correlator.register(&rt, tx, Duration::from_millis(10));

        assert!(matches!(rx.await, Ok(Err(ReplyError::Timeout(_)))));
        assert!(!correlator.complete(id, Ok(Reply::Empty)));
    }

    #[tokio::test]
    async fn teardown_fails_all_pending() {
        let correlator = Arc::new(Correlator::new());
        let rt = Handle::current();

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        correlator.register(&rt, tx1, Duration::MAX);
        correlator.register(&rt, tx2, Duration::MAX);

        correlator.fail_all();
        assert!(matches!(rx1.await, Ok(Err(ReplyError::Disconnected))));
        assert!(matches!(rx2.await, Ok(Err(ReplyError::Disconnected))));
    }
}
