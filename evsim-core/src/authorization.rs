//! Authorization tag list
//!
//! Stations check remote start requests against a local list of id tags
//! loaded from a JSON file (an array of strings). The list is shared across
//! tasks and reloaded in the background when the file changes on disk. A
//! missing or malformed file degrades to an empty list rather than failing
//! the station.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shared, reloadable list of authorized id tags
#[derive(Debug, Clone, Default)]
pub struct AuthorizationList {
    tags: Arc<RwLock<Vec<String>>>,
}

impl AuthorizationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the list from a file. Read or parse failures leave the list
    /// empty and are logged.
    pub async fn load(path: &Path) -> Self {
        let list = Self::new();
        list.reload(path).await;
        list
    }

    /// Re-read the file, replacing the whole list on success. On failure
    /// the previous list stays in place.
    async fn reload(&self, path: &Path) {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read authorization file {}: {}", path.display(), e);
                return;
            }
        };
        match serde_json::from_str::<Vec<String>>(&content) {
            Ok(tags) => {
                debug!("Loaded {} authorization tags from {}", tags.len(), path.display());
                *self.tags.write().await = tags;
            }
            Err(e) => {
                warn!("Malformed authorization file {}: {}", path.display(), e);
            }
        }
    }

    /// Spawn a task that polls the file's modification time once a second
    /// and reloads the list when it changes.
    pub fn watch(&self, path: PathBuf) -> JoinHandle<()> {
        let list = self.clone();
        let mut last_modified = modified_at(&path);
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(Duration::from_secs(1));
            loop {
                poll.tick().await;
                let modified = modified_at(&path);
                if modified != last_modified {
                    last_modified = modified;
                    list.reload(&path).await;
                }
            }
        })
    }

    pub async fn contains(&self, tag: &str) -> bool {
        self.tags.read().await.iter().any(|t| t == tag)
    }

    /// Pick a random tag, if any are loaded.
    pub async fn random_tag(&self) -> Option<String> {
        use rand::seq::SliceRandom;

        self.tags.read().await.choose(&mut rand::thread_rng()).cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.tags.read().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.tags.read().await.len()
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
