//! Core error types.

use thiserror::Error;

/// Errors raised by change sources and the hub.
#[derive(Debug, Error)]
pub enum Error {
    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// MongoDB error.
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] syncdb_proto::Error),

    /// A required step of the relational bootstrap failed.
    #[error("bootstrap error: {step}: {source}")]
    Bootstrap {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// A native change event could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Resume token could not be loaded or stored.
    #[error("resume token error: {0}")]
    ResumeToken(String),

    /// The hub control loop has stopped.
    #[error("hub closed")]
    HubClosed,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
