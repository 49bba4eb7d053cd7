use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use vipd_core::ServiceEntry;
use vipd_core::fs::write_atomic;

/// Everything the registry needs to come back after a restart.
///
/// `block` and `resolution_file` record the configuration the snapshot was
/// built under, so a changed configuration can be detected on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub entries: BTreeMap<String, ServiceEntry>,
    pub cursor: Ipv4Addr,
    #[serde(default)]
    pub free_list: Vec<Ipv4Addr>,
    pub block: Ipv4Net,
    pub resolution_file: PathBuf,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read state file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("state file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write state file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// Persists [`RegistryState`] as JSON, replacing the file atomically on save.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
}

impl StateStore {
    pub fn new(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Loads the snapshot, or `None` when there is nothing to restore.
    pub async fn load(&self) -> Result<Option<RegistryState>, StoreError> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.state_path.clone(),
                    source,
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        let mut state: RegistryState =
            serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                path: self.state_path.clone(),
                source,
            })?;

        // The map key is authoritative.
        for (name, entry) in &mut state.entries {
            if entry.name != *name {
                entry.name.clone_from(name);
            }
        }

        debug!(
            "Loaded {} entries from {}",
            state.entries.len(),
            self.state_path.display()
        );
        Ok(Some(state))
    }

    pub async fn save(&self, state: &RegistryState) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(state).map_err(StoreError::Serialize)?;
        write_atomic(&self.state_path, content.as_bytes())
            .await
            .map_err(|source| StoreError::Write {
                path: self.state_path.clone(),
                source,
            })
    }
}
