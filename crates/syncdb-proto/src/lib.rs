//! syncdb protocol types.
//!
//! This crate defines the canonical change envelope that both change sources
//! produce and the broadcast hub delivers to subscribers.
//!
//! # Modules
//!
//! - [`notification`] - The [`Notification`] envelope and its enums
//! - [`error`] - Protocol error types
//!
//! # Wire format
//!
//! Subscribers receive each notification as one JSON object:
//!
//! ```ignore
//! use syncdb_proto::{Notification, Operation, Source};
//!
//! let n = Notification::new(Source::Relational, "orders", Operation::Insert, payload);
//! let frame = n.to_frame()?;
//! // {"source":"relational","collection":"orders","operation":"insert",...}
//! ```

pub mod error;
pub mod notification;

pub use error::Error;

pub use notification::{
    payload_from_value, Notification, Operation, Payload, Source, DOCUMENT_KEY_FIELD,
};
