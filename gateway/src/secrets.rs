//! Environment variable source backed by the secret store.
//!
//! The gateway only reads named containers of key/value pairs from it; storage and
//! encryption belong to the store itself.

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// Container consulted by `setEnv` when the request carries no overrides.
pub const ENV_CONTAINER: &str = "env";

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error("failed to read secret store {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse secret store {path}: {message}")]
    Parse { path: String, message: String },
}

#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Key/value pairs stored under `name`, if the container exists.
    async fn container(
        &self,
        name: &str,
    ) -> Result<Option<HashMap<String, String>>, SecretStoreError>;
}

/// Secret source with no containers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecrets;

#[async_trait]
impl SecretSource for NoSecrets {
    async fn container(
        &self,
        _name: &str,
    ) -> Result<Option<HashMap<String, String>>, SecretStoreError> {
        Ok(None)
    }
}

/// TOML file with one table per container, re-read on every lookup:
///
/// ```toml
/// [env]
/// API_KEY = "..."
/// MAX_ROWS = 500
/// ```
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretSource for FileSecretStore {
    async fn container(
        &self,
        name: &str,
    ) -> Result<Option<HashMap<String, String>>, SecretStoreError> {
        let path = self.path.display().to_string();
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SecretStoreError::Io {
                path: path.clone(),
                source,
            })?;
        let mut tables: HashMap<String, toml::Table> =
            toml::from_str(&raw).map_err(|e| SecretStoreError::Parse {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let Some(table) = tables.remove(name) else {
            debug!(container = name, %path, "secret container not present");
            return Ok(None);
        };

        let values = table
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();
        Ok(Some(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_reads_named_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.toml");
        std::fs::write(
            &path,
            "[env]\nAPI_KEY = \"abc\"\nMAX_ROWS = 500\n\n[other]\nX = \"y\"\n",
        )
        .unwrap();

        let store = FileSecretStore::new(&path);
        let env = store.container(ENV_CONTAINER).await.unwrap().unwrap();
        assert_eq!(env.get("API_KEY").map(String::as_str), Some("abc"));
        assert_eq!(env.get("MAX_ROWS").map(String::as_str), Some("500"));
        assert!(!env.contains_key("X"));

        assert!(store.container("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.toml");
        std::fs::write(&path, "env = [not toml").unwrap();

        let err = FileSecretStore::new(&path)
            .container(ENV_CONTAINER)
            .await
            .unwrap_err();
        assert!(matches!(err, SecretStoreError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_no_secrets_has_no_containers() {
        assert!(NoSecrets.container(ENV_CONTAINER).await.unwrap().is_none());
    }
}
