//! Subscriber sessions.

use futures::Stream;
use tokio::sync::mpsc;

use super::outbox::{Frame, OutboxReceiver, SessionState};
use super::Control;

/// Identity of a subscriber session, unique for the lifetime of a hub.
pub type SessionId = u64;

/// One connected subscriber.
///
/// Created by [`HubHandle::subscribe`](super::HubHandle::subscribe), which
/// also sends the Register message. Dropping the session sends Unregister, so
/// the transport only has to drop it when the client goes away.
pub struct Session {
    id: SessionId,
    outbox: OutboxReceiver,
    control: mpsc::UnboundedSender<Control>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        outbox: OutboxReceiver,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            id,
            outbox,
            control,
        }
    }

    /// Session identity.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current registration state.
    pub fn state(&self) -> SessionState {
        self.outbox.state()
    }

    /// Wait for the next frame. Returns `None` once the hub has closed the
    /// session.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbox.recv().await
    }

    /// Take the next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbox.try_recv()
    }

    /// Number of frames queued and not yet read.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Consume the session as a stream of frames.
    ///
    /// Dropping the stream drops the session and unregisters it.
    pub fn into_stream(self) -> impl Stream<Item = Frame> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            session.recv().await.map(|frame| (frame, session))
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.outbox.state() != SessionState::Closed {
            // Fails only when the hub is already gone, which closes every
            // outbox anyway.
            let _ = self.control.send(Control::Unregister(self.id));
        }
        tracing::debug!(session_id = self.id, "session dropped");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
