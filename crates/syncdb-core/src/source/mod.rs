//! Change sources.
//!
//! A change source owns a connection to one backing store, turns the store's
//! native change notifications into [`Notification`]s and emits them on its
//! own bounded conduit. Each source runs as an independent background task:
//!
//! - [`relational`] - PostgreSQL via triggers, a sink table and LISTEN/NOTIFY
//! - [`document`] - MongoDB via a deployment-wide change stream

pub mod document;
pub mod relational;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use syncdb_proto::{Notification, Source};

use crate::error::Result;

/// Default capacity of a source's output conduit.
pub const DEFAULT_CONDUIT_CAPACITY: usize = 1024;

/// Sending half of a source's output conduit.
pub type NotificationSender = mpsc::Sender<Notification>;

/// Receiving half of a source's output conduit.
pub type NotificationReceiver = mpsc::Receiver<Notification>;

/// Create a source output conduit with the given buffer size.
pub fn conduit(capacity: usize) -> (NotificationSender, NotificationReceiver) {
    mpsc::channel(capacity.max(1))
}

/// A store adapter that can be started into a running listener.
#[async_trait]
pub trait ChangeSource: Send {
    /// Which store this adapter reads from.
    fn kind(&self) -> Source;

    /// Connect, prepare the store and spawn the listening loop.
    ///
    /// Errors returned here are fatal for this source; failures after
    /// startup are handled inside the loop.
    async fn start(self: Box<Self>) -> Result<(SourceHandle, NotificationReceiver)>;
}

/// Handle to a running change source.
///
/// Stopping the source terminates its listening loop, which drops the
/// conduit sender and so closes the output conduit.
pub struct SourceHandle {
    kind: Source,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SourceHandle {
    pub(crate) fn new(kind: Source, shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            kind,
            shutdown,
            task,
        }
    }

    /// Which store this source reads from.
    pub fn kind(&self) -> Source {
        self.kind
    }

    /// Whether the listening loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the listening loop to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(source = %self.kind, error = %e, "source task ended abnormally");
        }
        tracing::info!(source = %self.kind, "source stopped");
    }
}

/// Shutdown signal observed by a listening loop.
#[derive(Clone)]
pub(crate) struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub(crate) fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown(rx))
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown is requested or the handle is dropped.
    pub(crate) async fn triggered(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `delay`, returning `false` if shutdown interrupted it.
    pub(crate) async fn sleep(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.triggered() => false,
        }
    }
}
