//! Per-connection bounded outbound buffer.
//!
//! The dispatch engine enqueues serialized frames here without ever blocking;
//! the connection's writer task drains the queue onto the socket. When the
//! buffer is full the overflow policy decides which side loses: `DropOldest`
//! discards the front of the queue and admits the new frame, `DropNewest`
//! refuses the new frame. Closing the queue is what the dispatch engine
//! observes as a closed transport, so a disconnect aborts in-flight delivery
//! at the enqueue boundary.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// What to drop when a connection's outbound buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OverflowPolicy {
    /// Discard the oldest queued frame and admit the new one.
    DropOldest,
    /// Refuse the new frame and keep the queue as is.
    DropNewest,
}

/// Why the queue was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection closed or errored.
    Closed,
    /// A bounded network write did not complete in time.
    TimedOut,
}

/// Outcome of a successful enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The frame was appended.
    Queued,
    /// The frame was appended after discarding the oldest queued frame.
    DroppedOldest,
}

/// Why an enqueue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The buffer is full and the policy is [`OverflowPolicy::DropNewest`].
    Full,
    /// The queue was closed with the given reason.
    Closed(CloseReason),
}

#[derive(Debug)]
struct Inner {
    buf: VecDeque<Arc<str>>,
    closed: Option<CloseReason>,
}

/// Bounded single-consumer frame queue between dispatch and one writer task.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl OutboundQueue {
    /// Creates a queue holding at most `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity.min(64)),
                closed: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues a frame, applying the overflow policy when full.
    ///
    /// Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Closed`] after [`close`](Self::close) was
    /// called, or [`EnqueueError::Full`] under `DropNewest` when at capacity.
    pub fn push(&self, frame: Arc<str>, policy: OverflowPolicy) -> Result<Enqueued, EnqueueError> {
        let outcome = {
            let mut inner = self.inner.lock();
            if let Some(reason) = inner.closed {
                return Err(EnqueueError::Closed(reason));
            }
            if inner.buf.len() >= self.capacity {
                match policy {
                    OverflowPolicy::DropNewest => return Err(EnqueueError::Full),
                    OverflowPolicy::DropOldest => {
                        let _ = inner.buf.pop_front();
                        inner.buf.push_back(frame);
                        Enqueued::DroppedOldest
                    }
                }
            } else {
                inner.buf.push_back(frame);
                Enqueued::Queued
            }
        };
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Waits for the next frame.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Arc<str>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.buf.pop_front() {
                    return Some(frame);
                }
                if inner.closed.is_some() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Closes the queue; the first close reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason);
            }
        }
        self.notify.notify_one();
    }

    /// The close reason, if the queue has been closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().closed
    }

    /// Number of frames currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// Returns `true` if no frames are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
