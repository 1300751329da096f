//! Client state types and the outgoing command queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, oneshot};

use crate::errors::ReplyError;
use crate::protocol::{Command, Publication, Reply, StreamPosition};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No session and no attempt in progress.
    Disconnected,
    /// A session is being established (including between retry attempts).
    Connecting,
    /// The session is established and commands flow.
    Connected,
    /// Terminal. Entered by `close()`; nothing leaves this state.
    Closed,
}

/// One connection state transition, as delivered on the states stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateEvent {
    pub previous: State,
    pub current: State,
    pub at: SystemTime,
}

/// A publication delivered on the client-wide publications stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPublication {
    pub channel: String,
    pub publication: Publication,
}

/// Options for a history request.
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// Maximum number of publications to return; zero asks only for the
    /// current stream position.
    pub limit: i32,
    /// Return publications after this position.
    pub since: Option<StreamPosition>,
    /// Iterate from the stream end backwards.
    pub reverse: bool,
}

/// Priority lane of a queued command. Control commands (ping, refresh)
/// jump ahead of user traffic and are never rejected for backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Control,
    Normal,
}

/// A command waiting to be written to the transport, together with the
/// caller parked on its reply.
pub(crate) struct QueuedCommand {
    pub(crate) command: Command,
    pub(crate) reply: oneshot::Sender<Result<Reply, ReplyError>>,
    pub(crate) deadline: Instant,
}

impl QueuedCommand {
    /// Returns the entry back unless it expired, in which case the parked
    /// caller is resolved with a timeout.
    fn check_expiration(self, now: Instant, timeout: Duration) -> Option<Self> {
        if self.deadline > now {
            Some(self)
        } else {
            let _ = self.reply.send(Err(ReplyError::Timeout(timeout)));
            None
        }
    }
}

/// Returned by [`CommandQueue::push`] when the normal lane is at its
/// high-water mark.
pub(crate) struct QueueFull;

/// Bounded two-lane FIFO between user tasks and the transport writer.
///
/// The queue outlives individual connections: entries buffered while the
/// session is re-established are flushed by the next pump, and entries
/// that waited too long expire lazily against their deadline.
pub(crate) struct CommandQueue {
    timeout: Duration,
    high_water: usize,
    activity: mpsc::Sender<()>,
    control: VecDeque<QueuedCommand>,
    normal: VecDeque<QueuedCommand>,
}

impl CommandQueue {
    pub(crate) fn new(timeout: Duration, high_water: usize) -> Self {
        // the receiver half is created by the first pump via reset_channel
        let (activity, _) = mpsc::channel(1);
        CommandQueue {
            timeout,
            high_water,
            activity,
            control: VecDeque::new(),
            normal: VecDeque::new(),
        }
    }

    /// Enqueues a command and returns the receiver its reply will arrive
    /// on. Normal-lane pushes fail once the lane is at the high-water
    /// mark; the control lane is unbounded.
    pub(crate) fn push(
        &mut self,
        lane: Lane,
        command: Command,
    ) -> Result<oneshot::Receiver<Result<Reply, ReplyError>>, QueueFull> {
        let now = Instant::now();
        self.expire(now);

        if lane == Lane::Normal && self.normal.len() >= self.high_water {
            return Err(QueueFull);
        }

        let (tx, rx) = oneshot::channel();
        let entry = QueuedCommand {
            command,
            reply: tx,
            deadline: now + self.timeout,
        };
        match lane {
            Lane::Control => self.control.push_back(entry),
            Lane::Normal => self.normal.push_back(entry),
        }
        let _ = self.activity.try_send(());
        Ok(rx)
    }

    /// Next entry in priority order, skipping expired ones.
    pub(crate) fn get_next(&mut self, now: Instant) -> Option<QueuedCommand> {
        loop {
            let item = if let Some(item) = self.control.pop_front() {
                item
            } else {
                self.normal.pop_front()?
            };
            if let Some(item) = item.check_expiration(now, self.timeout) {
                return Some(item);
            }
        }
    }

    /// Replaces the activity channel, waking a fresh pump. Called once per
    /// established connection.
    pub(crate) fn reset_channel(&mut self) -> mpsc::Receiver<()> {
        let (activity_tx, activity_rx) = mpsc::channel(1);
        self.activity = activity_tx;
        activity_rx
    }

    /// Drains both lanes, resolving every parked caller with the closed
    /// error. Called by `close()`.
    pub(crate) fn fail_all(&mut self) {
        for item in self.control.drain(..).chain(self.normal.drain(..)) {
            let _ = item.reply.send(Err(ReplyError::Shutdown));
        }
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        for lane in [&mut self.control, &mut self.normal] {
            while let Some(item) = lane.pop_front() {
                if let Some(item) = item.check_expiration(now, timeout) {
                    lane.push_front(item);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PingRequest, PublishRequest};

    fn publish(channel: &str) -> Command {
        Command::Publish(PublishRequest {
            channel: channel.into(),
            data: Vec::new(),
        })
    }

    #[tokio::test]
    async fn normal_lane_rejects_past_high_water() {
        let mut queue = CommandQueue::new(Duration::from_secs(5), 2);
        assert!(queue.push(Lane::Normal, publish("a")).is_ok());
        assert!(queue.push(Lane::Normal, publish("b")).is_ok());
        assert!(queue.push(Lane::Normal, publish("c")).is_err());
        // control traffic is exempt from the high-water mark
        assert!(queue.push(Lane::Control, Command::Ping(PingRequest {})).is_ok());

        // draining frees a slot
        assert!(queue.get_next(Instant::now()).is_some());
        assert!(queue.get_next(Instant::now()).is_some());
        assert!(queue.push(Lane::Normal, publish("c")).is_ok());
    }

    #[tokio::test]
    async fn control_lane_drains_first() {
        let mut queue = CommandQueue::new(Duration::from_secs(5), 8);
        let _rx1 = queue.push(Lane::Normal, publish("a")).ok().unwrap();
        let _rx2 = queue.push(Lane::Control, Command::Ping(PingRequest {})).ok().unwrap();

        let first = queue.get_next(Instant::now()).unwrap();
        assert!(matches!(first.command, Command::Ping(_)));
        let second = queue.get_next(Instant::now()).unwrap();
        assert!(matches!(second.command, Command::Publish(_)));
        assert!(queue.get_next(Instant::now()).is_none());
    }

    #[tokio::test]
    async fn expired_entries_resolve_with_timeout() {
        let mut queue = CommandQueue::new(Duration::from_millis(1), 8);
        let mut rx = queue.push(Lane::Normal, publish("a")).ok().unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.get_next(Instant::now()).is_none());
        assert!(matches!(rx.try_recv(), Ok(Err(ReplyError::Timeout(_)))));
    }

    #[tokio::test]
    async fn fail_all_resolves_with_shutdown() {
        let mut queue = CommandQueue::new(Duration::from_secs(5), 8);
        let mut rx = queue.push(Lane::Normal, publish("a")).ok().unwrap();
        queue.fail_all();
        assert!(matches!(rx.try_recv(), Ok(Err(ReplyError::Shutdown))));
    }
}
