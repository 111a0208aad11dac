//! Bounded per-session frame queue.
//!
//! The hub writes into an [`Outbox`] without ever waiting; the session drains
//! the paired [`OutboxReceiver`] from its own task. When the queue is full the
//! configured [`OverflowPolicy`] decides which frame is lost, so a stalled
//! reader costs memory bounded by the capacity and nothing else.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A serialized notification, shared between every outbox it is queued in.
pub type Frame = Arc<str>;

/// What to discard when a session's outbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room for the new one.
    #[default]
    DropOldest,
    /// Keep the queue as is and discard the incoming frame.
    DropNewest,
}

/// Registration state of a subscriber session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Created, Register not yet processed by the hub.
    Pending = 0,
    /// In the hub registry, receiving publishes.
    Active = 1,
    /// Removed from the registry; no further frames will arrive.
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Pending,
            1 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

/// Result of pushing a frame into an outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame was queued.
    Queued,
    /// The frame was queued after evicting the oldest one.
    DroppedOldest,
    /// The queue was full and the frame was discarded.
    DroppedNewest,
    /// The receiver is gone; the session should be removed.
    Closed,
}

struct Shared {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    state: AtomicU8,
    receiver_alive: AtomicBool,
    capacity: usize,
    policy: OverflowPolicy,
}

/// Write side of a session's queue, held by the hub registry.
pub struct Outbox {
    shared: Arc<Shared>,
}

/// Read side of a session's queue, held by the session.
pub struct OutboxReceiver {
    shared: Arc<Shared>,
}

/// Create a connected outbox pair.
pub fn outbox(capacity: usize, policy: OverflowPolicy) -> (Outbox, OutboxReceiver) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        state: AtomicU8::new(SessionState::Pending as u8),
        receiver_alive: AtomicBool::new(true),
        capacity,
        policy,
    });

    (
        Outbox {
            shared: shared.clone(),
        },
        OutboxReceiver { shared },
    )
}

impl Outbox {
    /// Queue a frame without waiting.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        if !self.shared.receiver_alive.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut queue = self.shared.queue.lock();
            if queue.len() < self.shared.capacity {
                queue.push_back(frame);
                PushOutcome::Queued
            } else {
                match self.shared.policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(frame);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                }
            }
        };

        self.shared.notify.notify_one();
        outcome
    }

    /// Mark the session as registered.
    pub fn activate(&self) {
        let _ = self.shared.state.compare_exchange(
            SessionState::Pending as u8,
            SessionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Close the outbox. Frames already queued can still be drained.
    pub fn close(&self) {
        self.shared
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
        self.shared.notify.notify_one();
    }

    /// Number of frames waiting to be drained.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Whether no frames are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutboxReceiver {
    /// Wait for the next frame. Returns `None` once the outbox is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.try_recv() {
                return Some(frame);
            }
            if self.state() == SessionState::Closed {
                return None;
            }
            // A push or close that raced the checks above left a permit, so
            // this returns immediately in that case.
            self.shared.notify.notified().await;
        }
    }

    /// Take the next frame if one is queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.shared.queue.lock().pop_front()
    }

    /// Current registration state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Number of frames waiting to be drained.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Whether no frames are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for OutboxReceiver {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Release);
        self.shared.queue.lock().clear();
    }
}
