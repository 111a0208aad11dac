//! Resume token persistence for the change stream.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mongodb::bson::{self, Bson};
use mongodb::change_stream::event::ResumeToken;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Where the last observed resume token is kept between stream reopens.
#[async_trait]
pub trait ResumeTokenStore: Send + Sync {
    /// Load the stored token, if any.
    async fn load(&self) -> Result<Option<ResumeToken>>;

    /// Replace the stored token.
    async fn save(&self, token: &ResumeToken) -> Result<()>;

    /// Forget the stored token.
    async fn clear(&self) -> Result<()>;
}

/// Keeps the token in memory. Survives stream reopens but not restarts.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<ResumeToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumeTokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<ResumeToken>> {
        Ok(self.token.lock().clone())
    }

    async fn save(&self, token: &ResumeToken) -> Result<()> {
        *self.token.lock() = Some(token.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.token.lock() = None;
        Ok(())
    }
}

/// Keeps the token in a JSON file (relaxed extended JSON), so a restarted
/// process resumes where the previous one stopped.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ResumeTokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<ResumeToken>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let json: serde_json::Value = serde_json::from_slice(&contents)
            .map_err(|e| Error::ResumeToken(format!("{}: {}", self.path.display(), e)))?;
        let value = Bson::try_from(json)
            .map_err(|e| Error::ResumeToken(format!("{}: {}", self.path.display(), e)))?;
        let token = bson::from_bson(value)
            .map_err(|e| Error::ResumeToken(format!("{}: {}", self.path.display(), e)))?;

        Ok(Some(token))
    }

    async fn save(&self, token: &ResumeToken) -> Result<()> {
        let value = bson::to_bson(token).map_err(|e| Error::ResumeToken(e.to_string()))?;
        let contents = serde_json::to_vec_pretty(&value.into_relaxed_extjson())
            .map_err(|e| Error::ResumeToken(e.to_string()))?;

        // Write then rename so a crash never leaves a torn token behind.
        let temp = self.temp_path();
        tokio::fs::write(&temp, contents).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;
    use tempfile::TempDir;

    fn token(data: &str) -> ResumeToken {
        bson::from_document(doc! { "_data": data }).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryTokenStore::new();
        assert!(store.load().await.unwrap().is_none());

        store.save(&token("8263A1")).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(bson::to_bson(&loaded).unwrap(), bson::to_bson(&token("8263A1")).unwrap());

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume-token.json");

        let store = FileTokenStore::new(&path);
        assert!(store.load().await.unwrap().is_none());
        store.save(&token("8263A1B2C3")).await.unwrap();
        store.save(&token("8263A1B2C4")).await.unwrap();

        let reopened = FileTokenStore::new(&path);
        let loaded = reopened.load().await.unwrap().unwrap();
        assert_eq!(
            bson::to_bson(&loaded).unwrap(),
            bson::to_bson(&token("8263A1B2C4")).unwrap()
        );
        assert!(!store.temp_path().exists());

        reopened.clear().await.unwrap();
        assert!(!path.exists());
        reopened.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume-token.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = FileTokenStore::new(&path);
        assert!(matches!(store.load().await, Err(Error::ResumeToken(_))));
    }
}
