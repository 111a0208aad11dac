//! MongoDB change source.
//!
//! Opens one deployment-wide change stream and keeps the latest resume
//! token, so a reopened stream continues where the previous one stopped.
//! When the resume point has fallen out of the oplog the configured
//! [`HistoryLostPolicy`] decides between stopping and starting over.

pub mod decode;
pub mod resume;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::change_stream::event::ResumeToken;
use mongodb::change_stream::ChangeStream;
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::Client;
use tracing::{debug, error, info, warn};

use syncdb_proto::Source;

use super::{conduit, ChangeSource, NotificationReceiver, NotificationSender, Shutdown, SourceHandle};
use crate::error::Result;
use crate::retry::{Backoff, RetryConfig, RetryPolicy};

pub use decode::{decode_event, ChangeEvent, Decoded};
pub use resume::{FileTokenStore, MemoryTokenStore, ResumeTokenStore};

/// Server error codes meaning the resume point is no longer available
/// (`ChangeStreamHistoryLost` and `ChangeStreamFatalError`).
const HISTORY_LOST_CODES: [i32; 2] = [286, 280];

/// What to do when the stored resume point is no longer in the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryLostPolicy {
    /// Stop the source; changes are never silently skipped.
    #[default]
    Fail,
    /// Drop the token and reopen from the current point in time.
    RestartFromNow,
}

impl std::str::FromStr for HistoryLostPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "restart-from-now" | "restart" => Ok(Self::RestartFromNow),
            other => Err(format!("unknown history-lost policy: {}", other)),
        }
    }
}

/// Configuration for the MongoDB source.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    /// Connection string.
    pub url: String,
    /// Application name reported to the server.
    pub app_name: String,
    /// Reconnect policy for the change stream.
    pub reconnect: RetryConfig,
    /// Behaviour when the resume point is lost.
    pub history_lost: HistoryLostPolicy,
    /// Output conduit capacity.
    pub conduit_capacity: usize,
    /// Server selection and connect timeout.
    pub connect_timeout: Duration,
}

impl DocumentConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            app_name: "syncdb".to_string(),
            reconnect: RetryConfig::default(),
            history_lost: HistoryLostPolicy::default(),
            conduit_capacity: super::DEFAULT_CONDUIT_CAPACITY,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_history_lost(mut self, policy: HistoryLostPolicy) -> Self {
        self.history_lost = policy;
        self
    }

    pub fn with_conduit_capacity(mut self, capacity: usize) -> Self {
        self.conduit_capacity = capacity;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// MongoDB change source.
pub struct DocumentSource {
    config: DocumentConfig,
    tokens: Arc<dyn ResumeTokenStore>,
}

impl DocumentSource {
    /// Create a source that keeps its resume token in memory.
    pub fn new(config: DocumentConfig) -> Self {
        Self {
            config,
            tokens: Arc::new(MemoryTokenStore::new()),
        }
    }

    /// Use `store` for the resume token.
    pub fn with_token_store(mut self, store: Arc<dyn ResumeTokenStore>) -> Self {
        self.tokens = store;
        self
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.config
    }

    /// Connect, open the change stream and spawn the watch loop.
    pub async fn open(self) -> Result<(SourceHandle, NotificationReceiver)> {
        let mut options = ClientOptions::parse(&self.config.url).await?;
        options.app_name = Some(self.config.app_name.clone());
        options.connect_timeout = Some(self.config.connect_timeout);
        options.server_selection_timeout = Some(self.config.connect_timeout);

        let client = Client::with_options(options)?;
        client.database("admin").run_command(doc! { "ping": 1 }).await?;
        info!("connected to mongodb");

        let (tx, rx) = conduit(self.config.conduit_capacity);
        let (shutdown_tx, shutdown) = Shutdown::channel();
        let backoff = Backoff::new(RetryPolicy::new(self.config.reconnect.clone()));

        let mut watcher = Watcher {
            client,
            tokens: self.tokens,
            last_token: None,
            tx,
            shutdown,
            backoff,
            history_lost: self.config.history_lost,
        };
        watcher.last_token = watcher.tokens.load().await?;
        let stream = watcher.open_initial().await?;

        let task = tokio::spawn(watcher.run(stream));
        Ok((SourceHandle::new(Source::Document, shutdown_tx, task), rx))
    }
}

#[async_trait]
impl ChangeSource for DocumentSource {
    fn kind(&self) -> Source {
        Source::Document
    }

    async fn start(self: Box<Self>) -> Result<(SourceHandle, NotificationReceiver)> {
        (*self).open().await
    }
}

/// Whether `err` means the resume point has fallen out of the oplog.
pub fn is_history_lost(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Command(command) if HISTORY_LOST_CODES.contains(&command.code)
    )
}

struct Watcher {
    client: Client,
    tokens: Arc<dyn ResumeTokenStore>,
    last_token: Option<ResumeToken>,
    tx: NotificationSender,
    shutdown: Shutdown,
    backoff: Backoff,
    history_lost: HistoryLostPolicy,
}

impl Watcher {
    async fn open_stream(&self) -> mongodb::error::Result<ChangeStream<Document>> {
        let watch = self.client.watch();
        let stream = match self.last_token.clone() {
            Some(token) => watch.resume_after(token).await?,
            None => watch.await?,
        };
        Ok(stream.with_type::<Document>())
    }

    /// Open the first stream. A lost resume point is handled here as well,
    /// any other failure fails the start.
    async fn open_initial(&mut self) -> Result<ChangeStream<Document>> {
        let err = match self.open_stream().await {
            Ok(stream) => {
                info!(resumed = self.last_token.is_some(), "change stream opened");
                return Ok(stream);
            }
            Err(e) => e,
        };

        if is_history_lost(&err) && self.restart_from_now(&err).await {
            return Ok(self.open_stream().await?);
        }
        Err(err.into())
    }

    async fn run(mut self, mut stream: ChangeStream<Document>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.triggered() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(raw)) => {
                    self.backoff.reset();
                    let delivered = self.forward(raw).await;
                    if let Some(token) = stream.resume_token() {
                        self.remember(token).await;
                    }
                    if !delivered {
                        break;
                    }
                }
                Some(Err(e)) => {
                    if is_history_lost(&e) && !self.restart_from_now(&e).await {
                        break;
                    }
                    warn!(error = %e, "change stream failed");
                    match self.reopen().await {
                        Some(reopened) => stream = reopened,
                        None => break,
                    }
                }
                None => {
                    warn!("change stream ended");
                    match self.reopen().await {
                        Some(reopened) => stream = reopened,
                        None => break,
                    }
                }
            }
        }

        info!("document watcher stopped");
    }

    /// Decode and forward one event. Returns `false` once the conduit has no
    /// receiver.
    async fn forward(&mut self, raw: Document) -> bool {
        match decode_event(raw) {
            Ok(Decoded::Change(notification)) => {
                debug!(
                    collection = %notification.collection,
                    operation = %notification.operation,
                    "document change captured"
                );
                self.tx.send(notification).await.is_ok()
            }
            Ok(Decoded::Skipped(operation)) => {
                debug!(operation = %operation, "skipping non-data change event");
                true
            }
            Err(e) => {
                warn!(error = %e, "skipping undecodable change event");
                true
            }
        }
    }

    async fn remember(&mut self, token: ResumeToken) {
        if let Err(e) = self.tokens.save(&token).await {
            warn!(error = %e, "failed to persist resume token");
        }
        self.last_token = Some(token);
    }

    /// Apply the history-lost policy. Returns `true` when the watcher should
    /// continue from the current point in time.
    async fn restart_from_now(&mut self, err: &mongodb::error::Error) -> bool {
        match self.history_lost {
            HistoryLostPolicy::Fail => {
                error!(error = %err, "resume point is no longer in the oplog, stopping");
                false
            }
            HistoryLostPolicy::RestartFromNow => {
                warn!(
                    error = %err,
                    "resume point is no longer in the oplog, restarting from now; \
                     changes since the last token are skipped"
                );
                self.last_token = None;
                if let Err(e) = self.tokens.clear().await {
                    warn!(error = %e, "failed to clear resume token");
                }
                true
            }
        }
    }

    /// Reopen the stream after the current one failed or ended, resuming
    /// from the last token. The retry budget starts over once a stream is
    /// open again. Returns `None` when retries are exhausted, the
    /// history was lost under [`HistoryLostPolicy::Fail`], or shutdown was
    /// requested.
    async fn reopen(&mut self) -> Option<ChangeStream<Document>> {
        loop {
            let Some(delay) = self.backoff.next() else {
                error!(
                    attempts = self.backoff.attempts(),
                    "document watcher giving up after repeated failures"
                );
                return None;
            };
            if !self.shutdown.sleep(delay).await {
                return None;
            }

            match self.open_stream().await {
                Ok(stream) => {
                    info!(
                        resumed = self.last_token.is_some(),
                        attempt = self.backoff.attempts(),
                        "change stream reopened"
                    );
                    self.backoff.reset();
                    return Some(stream);
                }
                Err(e) if is_history_lost(&e) => {
                    if !self.restart_from_now(&e).await {
                        return None;
                    }
                }
                Err(e) => warn!(
                    error = %e,
                    attempt = self.backoff.attempts(),
                    "failed to reopen change stream"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_lost_policy_parsing() {
        assert_eq!("fail".parse::<HistoryLostPolicy>().unwrap(), HistoryLostPolicy::Fail);
        assert_eq!(
            "Restart-From-Now".parse::<HistoryLostPolicy>().unwrap(),
            HistoryLostPolicy::RestartFromNow
        );
        assert!("ignore".parse::<HistoryLostPolicy>().is_err());
        assert_eq!(HistoryLostPolicy::default(), HistoryLostPolicy::Fail);
    }

    #[test]
    fn test_config_defaults() {
        let config = DocumentConfig::new("mongodb://localhost:27017");
        assert_eq!(config.history_lost, HistoryLostPolicy::Fail);
        assert_eq!(config.app_name, "syncdb");
        assert_eq!(config.reconnect.max_retries, 10);
        assert_eq!(config.conduit_capacity, crate::source::DEFAULT_CONDUIT_CAPACITY);
    }

    #[test]
    fn test_io_errors_are_not_history_loss() {
        let err = mongodb::error::Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(!is_history_lost(&err));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_start() {
        let source: Box<dyn ChangeSource> =
            Box::new(DocumentSource::new(DocumentConfig::new("not-a-mongo-url")));
        assert_eq!(source.kind(), Source::Document);
        assert!(source.start().await.is_err());
    }
}
