use std::path::PathBuf;
use std::sync::Arc;

use syncdb_core::HubHandle;

use crate::config::{Credentials, ServerConfig};
use crate::sources::SourceRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub sources: Arc<SourceRegistry>,
    pub credentials: Arc<Credentials>,
    pub index_file: PathBuf,
}

impl AppState {
    pub fn new(hub: HubHandle, sources: Arc<SourceRegistry>, config: &ServerConfig) -> Self {
        Self {
            hub,
            sources,
            credentials: Arc::new(config.credentials.clone()),
            index_file: config.index_file.clone(),
        }
    }
}
