//! Broadcast hub.
//!
//! The hub is a single control loop that owns the subscriber registry. All
//! interaction goes through [`HubHandle`], which turns calls into one of
//! three messages:
//!
//! - Register: a new [`Session`] joins the registry.
//! - Unregister: a session leaves; its outbox is closed. Idempotent.
//! - Publish: a [`Notification`] is serialized once and pushed to every
//!   registered outbox.
//!
//! Because only the loop touches the registry, it needs no locking, and the
//! recipients of a publish are exactly the sessions registered when that
//! publish is dequeued. Pushing into an outbox never waits, so a slow
//! subscriber cannot stall the loop or the sources feeding it.

mod outbox;
mod session;

pub use outbox::{outbox, Frame, Outbox, OutboxReceiver, OverflowPolicy, PushOutcome, SessionState};
pub use session::{Session, SessionId};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use syncdb_proto::{Notification, Source};

use crate::error::{Error, Result};
use crate::source::NotificationReceiver;

/// Default number of frames buffered per session.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Default number of notifications buffered ahead of the control loop.
pub const DEFAULT_PUBLISH_QUEUE: usize = 1024;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per session before the overflow policy applies.
    pub outbox_capacity: usize,
    /// What a full outbox discards.
    pub overflow_policy: OverflowPolicy,
    /// Capacity of the publish queue feeding the control loop.
    pub publish_queue: usize,
}

impl HubConfig {
    /// Set the per-session outbox capacity.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }

    /// Set the overflow policy.
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Set the publish queue capacity.
    pub fn with_publish_queue(mut self, capacity: usize) -> Self {
        self.publish_queue = capacity.max(1);
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            publish_queue: DEFAULT_PUBLISH_QUEUE,
        }
    }
}

/// Hub counters for monitoring.
#[derive(Debug, Default)]
pub struct HubStats {
    /// Sessions currently registered.
    subscribers: AtomicUsize,
    /// Notifications processed by the control loop.
    published: AtomicU64,
    /// Frames queued into outboxes.
    delivered: AtomicU64,
    /// Frames lost to outbox overflow.
    dropped: AtomicU64,
    /// Sessions removed because their receiver was gone.
    evicted: AtomicU64,
}

/// Point-in-time copy of [`HubStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStatsSnapshot {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

impl HubStats {
    /// Get the number of registered sessions.
    pub fn subscribers(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    /// Get the number of notifications published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Get the number of frames queued for sessions.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Get the number of frames lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Get the number of sessions evicted after failed delivery.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            subscribers: self.subscribers(),
            published: self.published(),
            delivered: self.delivered(),
            dropped: self.dropped(),
            evicted: self.evicted(),
        }
    }
}

/// Registry messages.
pub(crate) enum Control {
    Register { id: SessionId, outbox: Outbox },
    Unregister(SessionId),
}

/// The hub control loop and the registry it owns.
pub struct Hub {
    registry: HashMap<SessionId, Outbox>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    publish_rx: mpsc::Receiver<Notification>,
    stats: Arc<HubStats>,
}

impl Hub {
    /// Spawn the control loop and return a handle to it.
    ///
    /// The loop runs until every [`HubHandle`] and [`Session`] is dropped.
    pub fn start(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_queue.max(1));
        let stats = Arc::new(HubStats::default());

        let hub = Hub {
            registry: HashMap::new(),
            control_rx,
            publish_rx,
            stats: stats.clone(),
        };
        let task = tokio::spawn(hub.run());

        let handle = HubHandle {
            control_tx,
            publish_tx,
            stats,
            next_session_id: Arc::new(AtomicU64::new(1)),
            config,
        };

        (handle, task)
    }

    async fn run(mut self) {
        info!("hub started");

        let mut control_open = true;
        let mut publish_open = true;

        loop {
            tokio::select! {
                biased;

                msg = self.control_rx.recv(), if control_open => match msg {
                    Some(control) => self.handle_control(control),
                    None => control_open = false,
                },
                msg = self.publish_rx.recv(), if publish_open => match msg {
                    Some(notification) => self.publish(&notification),
                    None => {
                        debug!("publish queue closed");
                        publish_open = false;
                    }
                },
                else => break,
            }
        }

        for (_, outbox) in self.registry.drain() {
            outbox.close();
        }
        self.stats.subscribers.store(0, Ordering::Relaxed);

        info!(
            published = self.stats.published(),
            delivered = self.stats.delivered(),
            dropped = self.stats.dropped(),
            "hub stopped"
        );
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Register { id, outbox } => {
                outbox.activate();
                self.registry.insert(id, outbox);
                self.stats
                    .subscribers
                    .store(self.registry.len(), Ordering::Relaxed);
                info!(
                    session_id = id,
                    subscribers = self.registry.len(),
                    "session registered"
                );
            }
            Control::Unregister(id) => match self.registry.remove(&id) {
                Some(outbox) => {
                    outbox.close();
                    self.stats
                        .subscribers
                        .store(self.registry.len(), Ordering::Relaxed);
                    info!(
                        session_id = id,
                        subscribers = self.registry.len(),
                        "session unregistered"
                    );
                }
                None => debug!(session_id = id, "unregister for unknown session ignored"),
            },
        }
    }

    fn publish(&mut self, notification: &Notification) {
        let frame: Frame = match notification.to_frame() {
            Ok(frame) => Arc::from(frame),
            Err(e) => {
                warn!(
                    error = %e,
                    collection = %notification.collection,
                    "failed to encode notification"
                );
                return;
            }
        };

        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let mut gone = Vec::new();
        for (&id, outbox) in &self.registry {
            match outbox.push(frame.clone()) {
                PushOutcome::Queued => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                PushOutcome::DroppedOldest => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(session_id = id, "outbox full, dropped oldest frame");
                }
                PushOutcome::DroppedNewest => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(session_id = id, "outbox full, dropped new frame");
                }
                PushOutcome::Closed => gone.push(id),
            }
        }

        for id in gone {
            if let Some(outbox) = self.registry.remove(&id) {
                outbox.close();
                self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = id, "session evicted after failed delivery");
            }
        }
        self.stats
            .subscribers
            .store(self.registry.len(), Ordering::Relaxed);

        trace!(
            source = %notification.source,
            collection = %notification.collection,
            operation = %notification.operation,
            recipients = self.registry.len(),
            "notification published"
        );
    }
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    publish_tx: mpsc::Sender<Notification>,
    stats: Arc<HubStats>,
    next_session_id: Arc<AtomicU64>,
    config: HubConfig,
}

impl HubHandle {
    /// Create a session and register it with the hub.
    pub fn subscribe(&self) -> Result<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, receiver) = outbox(self.config.outbox_capacity, self.config.overflow_policy);

        self.control_tx
            .send(Control::Register { id, outbox })
            .map_err(|_| Error::HubClosed)?;

        Ok(Session::new(id, receiver, self.control_tx.clone()))
    }

    /// Remove a session from the registry. Removing an absent session is a
    /// no-op.
    pub fn unregister(&self, id: SessionId) -> Result<()> {
        self.control_tx
            .send(Control::Unregister(id))
            .map_err(|_| Error::HubClosed)
    }

    /// Queue a notification for delivery to every registered session.
    ///
    /// Waits only when the publish queue is full.
    pub async fn publish(&self, notification: Notification) -> Result<()> {
        self.publish_tx
            .send(notification)
            .await
            .map_err(|_| Error::HubClosed)
    }

    /// Forward everything a change source emits into the publish queue.
    ///
    /// The returned task ends when the source closes its conduit; other
    /// attached sources are unaffected.
    pub fn attach(&self, source: Source, mut rx: NotificationReceiver) -> JoinHandle<()> {
        let publish_tx = self.publish_tx.clone();

        tokio::spawn(async move {
            info!(%source, "source attached to hub");
            let mut forwarded: u64 = 0;

            while let Some(notification) = rx.recv().await {
                if publish_tx.send(notification).await.is_err() {
                    warn!(%source, forwarded, "hub closed, detaching source");
                    return;
                }
                forwarded += 1;
            }

            info!(%source, forwarded, "source conduit closed, detached from hub");
        })
    }

    /// Hub counters.
    pub fn stats(&self) -> &HubStats {
        &self.stats
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }
}
