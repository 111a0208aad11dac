//! Startup and bookkeeping of the configured change sources.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use syncdb_core::{
    ChangeSource, DocumentSource, FileTokenStore, HubHandle, RelationalSource, SourceHandle,
};
use syncdb_proto::Source;

use crate::config::ServerConfig;

/// Health view of one configured source.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceStatus {
    pub source: Source,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct SourceEntry {
    kind: Source,
    handle: Option<SourceHandle>,
    error: Option<String>,
}

/// Every source the process tried to start.
#[derive(Default)]
pub struct SourceRegistry {
    entries: Mutex<Vec<SourceEntry>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `source` and attach its conduit to the hub.
    ///
    /// A failure is logged and recorded; it never affects other sources.
    pub async fn start(&self, source: Box<dyn ChangeSource>, hub: &HubHandle) -> bool {
        let kind = source.kind();

        match source.start().await {
            Ok((handle, rx)) => {
                hub.attach(kind, rx);
                info!(source = %kind, "change source started");
                self.entries.lock().push(SourceEntry {
                    kind,
                    handle: Some(handle),
                    error: None,
                });
                true
            }
            Err(e) => {
                error!(source = %kind, error = %e, "change source failed to start");
                self.entries.lock().push(SourceEntry {
                    kind,
                    handle: None,
                    error: Some(e.to_string()),
                });
                false
            }
        }
    }

    /// Number of sources whose loop is still running.
    pub fn running(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .count()
    }

    pub fn statuses(&self) -> Vec<SourceStatus> {
        self.entries
            .lock()
            .iter()
            .map(|entry| SourceStatus {
                source: entry.kind,
                running: entry.handle.as_ref().is_some_and(|h| !h.is_finished()),
                error: entry.error.clone(),
            })
            .collect()
    }

    /// Stop every running source and wait for their loops to exit.
    pub async fn stop_all(&self) {
        let handles: Vec<SourceHandle> = self
            .entries
            .lock()
            .iter_mut()
            .filter_map(|entry| entry.handle.take())
            .collect();

        for handle in handles {
            handle.stop().await;
        }
    }
}

/// Build the sources enabled in `config`.
pub fn configured_sources(config: &ServerConfig) -> Vec<Box<dyn ChangeSource>> {
    let mut sources: Vec<Box<dyn ChangeSource>> = Vec::new();

    if let Some(relational) = &config.relational {
        sources.push(Box::new(RelationalSource::new(relational.clone())));
    }

    if let Some(document) = &config.document {
        let mut source = DocumentSource::new(document.clone());
        if let Some(path) = &config.resume_token_path {
            info!(path = %path.display(), "persisting resume tokens to file");
            source = source.with_token_store(Arc::new(FileTokenStore::new(path)));
        }
        sources.push(Box::new(source));
    }

    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncdb_core::{DocumentConfig, Hub, HubConfig, RelationalConfig};

    #[test]
    fn test_configured_sources() {
        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        assert!(configured_sources(&config).is_empty());

        config.relational = Some(RelationalConfig::new("postgres://localhost/app"));
        config.document = Some(DocumentConfig::new("mongodb://localhost"));
        let kinds: Vec<Source> = configured_sources(&config).iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec![Source::Relational, Source::Document]);
    }

    #[tokio::test]
    async fn test_failed_start_is_recorded() {
        let (hub, _task) = Hub::start(HubConfig::default());
        let registry = SourceRegistry::new();

        let source = Box::new(DocumentSource::new(DocumentConfig::new("not-a-mongo-url")));
        assert!(!registry.start(source, &hub).await);

        assert_eq!(registry.running(), 0);
        let statuses = registry.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].source, Source::Document);
        assert!(!statuses[0].running);
        assert!(statuses[0].error.is_some());

        registry.stop_all().await;
    }
}
