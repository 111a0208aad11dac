//! syncdb core - change sources and the broadcast hub.
//!
//! Change sources listen to a backing store and emit canonical
//! [`Notification`](syncdb_proto::Notification)s on a bounded conduit. The
//! [`Hub`] merges every conduit and fans each notification out to all
//! connected subscriber [`Session`]s.

pub mod error;
pub mod hub;
pub mod retry;
pub mod source;

pub use error::{Error, Result};
pub use hub::{
    Frame, Hub, HubConfig, HubHandle, HubStats, HubStatsSnapshot, OverflowPolicy, Session,
    SessionId, SessionState,
};
pub use retry::{Backoff, RetryConfig, RetryPolicy};
pub use source::document::{
    DocumentConfig, DocumentSource, FileTokenStore, HistoryLostPolicy, MemoryTokenStore,
    ResumeTokenStore,
};
pub use source::relational::{BootstrapReport, RelationalConfig, RelationalSource};
pub use source::{conduit, ChangeSource, NotificationReceiver, NotificationSender, SourceHandle};

/// Re-export protocol types.
pub use syncdb_proto as proto;
