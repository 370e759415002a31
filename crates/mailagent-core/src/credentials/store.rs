//! Persistent token pair storage
//!
//! Token pairs survive restarts as JSON files under
//! `<data_dir>/tokens/<session>.json`. An in-memory cache avoids rereading
//! the file on every lookup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::bootstrap::sanitize_session_id;
use super::TokenPair;
use crate::config::Config;
use crate::error::{Error, Result};

/// Trait for token pair storage backends
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// session tasks.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Get the token pair of a session
    async fn get_tokens(&self, session_id: &str) -> Result<Option<TokenPair>>;

    /// Store the token pair of a session
    async fn store_tokens(&self, session_id: &str, tokens: &TokenPair) -> Result<()>;

    /// Delete the token pair of a session
    async fn delete_tokens(&self, session_id: &str) -> Result<()>;

    /// List sessions with stored token pairs
    async fn list_sessions(&self) -> Result<Vec<String>>;
}

/// Create the token store for a configuration
pub fn create_token_store(config: &Config) -> Arc<dyn TokenStore> {
    Arc::new(FileTokenStore::new(config.tokens_dir()))
}

/// File-based token store
pub struct FileTokenStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, TokenPair>>,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_session_id(session_id)))
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get_tokens(&self, session_id: &str) -> Result<Option<TokenPair>> {
        if let Some(tokens) = self.cache.read().get(session_id) {
            debug!("Retrieved token pair for {} from cache", session_id);
            return Ok(Some(tokens.clone()));
        }

        let path = self.path_for(session_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No token pair stored for {}", session_id);
                return Ok(None);
            }
            Err(e) => return Err(Error::Token(format!("Failed to read {:?}: {}", path, e))),
        };

        let tokens: TokenPair = serde_json::from_str(&json)?;
        self.cache
            .write()
            .insert(session_id.to_string(), tokens.clone());
        debug!("Retrieved token pair for {} from {:?}", session_id, path);
        Ok(Some(tokens))
    }

    async fn store_tokens(&self, session_id: &str, tokens: &TokenPair) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(tokens)?;

        // Write then rename so a crash never leaves a truncated file
        tokio::fs::write(&tmp, data).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &path).await?;

        self.cache
            .write()
            .insert(session_id.to_string(), tokens.clone());
        debug!("Stored token pair for {}", session_id);
        Ok(())
    }

    async fn delete_tokens(&self, session_id: &str) -> Result<()> {
        self.cache.write().remove(session_id);
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            debug!("Tokens directory does not exist: {:?}", self.dir);
            return Ok(vec![]);
        }

        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    sessions.push(stem.to_string_lossy().to_string());
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

/// Volatile token store, used when nothing should touch disk
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, TokenPair>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get_tokens(&self, session_id: &str) -> Result<Option<TokenPair>> {
        Ok(self.tokens.read().get(session_id).cloned())
    }

    async fn store_tokens(&self, session_id: &str, tokens: &TokenPair) -> Result<()> {
        self.tokens
            .write()
            .insert(session_id.to_string(), tokens.clone());
        Ok(())
    }

    async fn delete_tokens(&self, session_id: &str) -> Result<()> {
        self.tokens.write().remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions: Vec<String> = self.tokens.read().keys().cloned().collect();
        sessions.sort();
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(access: &str) -> TokenPair {
        TokenPair {
            access_token: access.to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: 1_700_000_000,
            scopes: vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
        }
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileTokenStore::new(dir.path());
        store.store_tokens("session-1", &pair("a1")).await.unwrap();

        let reopened = FileTokenStore::new(dir.path());
        let loaded = reopened.get_tokens("session-1").await.unwrap().unwrap();
        assert_eq!(loaded, pair("a1"));
        assert_eq!(reopened.list_sessions().await.unwrap(), vec!["session-1"]);

        reopened.delete_tokens("session-1").await.unwrap();
        assert!(reopened.get_tokens("session-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_list_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("missing"));
        assert!(store.list_sessions().await.unwrap().is_empty());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", pair("very-secret"));
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
