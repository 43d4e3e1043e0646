//! File-backed local identity.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use callcore::{IdentityProvider, ParticipantId};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const ID_PREFIX: &str = "user";

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    #[serde(rename = "userId")]
    user_id: ParticipantId,
}

/// Persists the local participant id as `{"userId": "..."}` at `path`.
///
/// The first lookup generates and stores a `user_<hex>` id. If the file
/// cannot be read or written, a temporary id is used for the rest of the
/// process instead of failing.
pub struct FileIdentityStore {
    path: PathBuf,
    cached: Mutex<Option<ParticipantId>>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh `user_` id with six random hex characters.
    pub fn generate_id() -> ParticipantId {
        let suffix: [u8; 3] = rand::random();
        ParticipantId::new(format!("{ID_PREFIX}_{}", hex::encode(suffix)))
    }

    /// Forgets the stored id. The next lookup generates a new one.
    pub async fn reset(&self) -> Result<(), anyhow::Error> {
        *self.cached.lock().await = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(target: "Identity", "Identity reset");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self) -> Result<Option<ParticipantId>, anyhow::Error> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredIdentity = serde_json::from_slice(&data)?;
        if stored.user_id.as_str().is_empty() {
            return Ok(None);
        }
        Ok(Some(stored.user_id))
    }

    async fn store(&self, id: &ParticipantId) -> Result<(), anyhow::Error> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(&StoredIdentity {
            user_id: id.clone(),
        })?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    async fn load_or_create(&self) -> ParticipantId {
        match self.load().await {
            Ok(Some(id)) => {
                debug!(target: "Identity", "Loaded identity {id} from {}", self.path.display());
                return id;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    target: "Identity",
                    "Could not read identity from {}: {e}; using a temporary id",
                    self.path.display()
                );
                return Self::generate_id();
            }
        }

        let id = Self::generate_id();
        match self.store(&id).await {
            Ok(()) => info!(target: "Identity", "Generated and saved identity {id}"),
            Err(e) => warn!(
                target: "Identity",
                "Could not save identity to {}: {e}; {id} is temporary",
                self.path.display()
            ),
        }
        id
    }
}

#[async_trait]
impl IdentityProvider for FileIdentityStore {
    async fn local_id(&self) -> Result<ParticipantId, anyhow::Error> {
        let mut cached = self.cached.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }
        let id = self.load_or_create().await;
        *cached = Some(id.clone());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_generated(id: &ParticipantId) -> bool {
        let Some(suffix) = id.as_str().strip_prefix("user_") else {
            return false;
        };
        suffix.len() == 6 && suffix.chars().all(|c| c.is_ascii_hexdigit())
    }

    #[tokio::test]
    async fn test_generates_then_reuses_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = FileIdentityStore::new(&path).local_id().await.unwrap();
        assert!(is_generated(&first), "unexpected id {first}");

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, format!(r#"{{"userId":"{first}"}}"#));

        let second = FileIdentityStore::new(&path).local_id().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_reads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, r#"{"userId":"alice"}"#).unwrap();

        let id = FileIdentityStore::new(&path).local_id().await.unwrap();
        assert_eq!(id.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_temporary_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, b"{oops").unwrap();

        let store = FileIdentityStore::new(&path);
        let id = store.local_id().await.unwrap();
        assert!(is_generated(&id));
        // Stable for the life of the store even though nothing was saved.
        assert_eq!(store.local_id().await.unwrap(), id);
        assert_eq!(std::fs::read(&path).unwrap(), b"{oops");
    }

    #[tokio::test]
    async fn test_unwritable_location_still_yields_an_id() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let store = FileIdentityStore::new(blocker.join("identity.json"));
        let id = store.local_id().await.unwrap();
        assert!(is_generated(&id));
    }

    #[tokio::test]
    async fn test_reset_forgets_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let store = FileIdentityStore::new(&path);

        store.local_id().await.unwrap();
        store.reset().await.unwrap();
        assert!(!path.exists());

        let second = store.local_id().await.unwrap();
        assert!(is_generated(&second));
        assert!(path.exists());

        // Resetting twice is harmless.
        store.reset().await.unwrap();
        store.reset().await.unwrap();
    }
}
