use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::keys::ApiKeyPool;

/// Durable home of the API key pool and its active pointer.
///
/// Read once at startup, rewritten after every pool or pointer mutation.
/// Unparsable stored data is treated as empty state — the corrupted record
/// is cleared and never treated as fatal.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> ApiKeyPool {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return ApiKeyPool::new();
        };
        match serde_json::from_str(&raw) {
            Ok(pool) => pool,
            Err(_) => {
                let _ = std::fs::remove_file(&self.path);
                ApiKeyPool::new()
            }
        }
    }

    pub fn save(&self, pool: &ApiKeyPool) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(pool)?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("failed writing {}", self.path.display()))
    }
}
