//! Durable storage for custom profiles and audit events.
//!
//! Layout under the policy directory:
//!
//! ```text
//! profiles/<id>.json
//! events/<id>.json
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ConfigError, SandboxError};
use crate::security::{SecurityEvent, SecurityProfile};

/// JSON-file store rooted at a policy directory.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    root: PathBuf,
}

impl PolicyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    fn record_path(dir: &Path, id: &str) -> Result<PathBuf, SandboxError> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(ConfigError::InvalidPath {
                path: id.to_string(),
                reason: "record id cannot be used as a file name".to_string(),
            }
            .into());
        }
        Ok(dir.join(format!("{}.json", id)))
    }

    async fn write_record<T: Serialize>(dir: &Path, id: &str, value: &T) -> Result<(), SandboxError> {
        let path = Self::record_path(dir, id)?;
        tokio::fs::create_dir_all(dir).await?;

        // readers never see a partial record
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, SandboxError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    pub async fn save_profile(&self, profile: &SecurityProfile) -> Result<(), SandboxError> {
        Self::write_record(&self.profiles_dir(), &profile.id, profile).await
    }

    /// Every stored profile, sorted by id. A missing directory is empty.
    pub async fn load_profiles(&self) -> Result<Vec<SecurityProfile>, SandboxError> {
        let mut profiles: Vec<SecurityProfile> = Self::read_all(&self.profiles_dir()).await?;
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(profiles)
    }

    /// Returns whether a record was removed.
    pub async fn delete_profile(&self, id: &str) -> Result<bool, SandboxError> {
        let path = Self::record_path(&self.profiles_dir(), id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_event(&self, event: &SecurityEvent) -> Result<(), SandboxError> {
        Self::write_record(&self.events_dir(), &event.id, event).await
    }

    /// Stored events, oldest first, optionally for one sandbox.
    pub async fn load_events(&self, sandbox_id: Option<&str>) -> Result<Vec<SecurityEvent>, SandboxError> {
        let mut events: Vec<SecurityEvent> = Self::read_all(&self.events_dir()).await?;
        if let Some(id) = sandbox_id {
            events.retain(|e| e.sandbox_id == id);
        }
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::audit::{EventAction, EventDraft, EventType, Severity};
    use crate::security::profile::builtin_profiles;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_directories_are_empty() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::new(dir.path().join("nope"));
        assert!(store.load_profiles().await.unwrap().is_empty());
        assert!(store.load_events(None).await.unwrap().is_empty());
        assert!(!store.delete_profile("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_profile_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::new(dir.path());
        let mut profile = builtin_profiles().remove(0);
        profile.id = "custom-1".to_string();

        store.save_profile(&profile).await.unwrap();
        assert!(dir.path().join("profiles/custom-1.json").exists());
        assert_eq!(store.load_profiles().await.unwrap(), vec![profile]);

        assert!(store.delete_profile("custom-1").await.unwrap());
        assert!(store.load_profiles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_filtered_by_sandbox() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::new(dir.path());
        for sandbox in ["a", "b", "a"] {
            let event = EventDraft::new(EventType::Audit, Severity::Low, "capability", sandbox, "ok", EventAction::Logged)
                .stamp();
            store.save_event(&event).await.unwrap();
        }

        assert_eq!(store.load_events(None).await.unwrap().len(), 3);
        assert_eq!(store.load_events(Some("a")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = PolicyStore::new(dir.path());
        assert!(store.delete_profile("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_skips_corrupt_records() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("profiles")).unwrap();
        std::fs::write(dir.path().join("profiles/bad.json"), b"{not json").unwrap();
        let store = PolicyStore::new(dir.path());
        assert!(store.load_profiles().await.unwrap().is_empty());
    }
}
