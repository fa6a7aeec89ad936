// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0

// Revocation Store
//
// Durable set of revoked session ids (`jti -> expires_at`). The map is the
// only mutable authorization state in the relay:
// - `revoke` prunes, inserts and persists under the write lock; a failed
//   write rolls the in-memory change back.
// - `is_revoked` deletes entries whose expiry already passed.
// - `load` refuses to start from a file it cannot parse.
//
// On-disk format: `{"version":1,"revoked_sessions":{"<jti>":<unix secs>}}`,
// written to `<path>.tmp` then renamed over `<path>`, mode 0600.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RevocationStoreError {
    #[error("session id is required")]
    MissingSessionId,

    #[error("failed to read revocation store {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("revocation store {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist revocation store {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    revoked_sessions: BTreeMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct RevocationStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, i64>>,
}

impl RevocationStore {
    /// In-memory store; revocations do not survive a restart.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the store at `path`, keeping only entries still live at `now`.
    /// A missing file is an empty store; an unreadable or corrupt one is an error.
    pub fn load(path: impl Into<PathBuf>, now: i64) -> Result<Self, RevocationStoreError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(raw) => {
                let file: StoreFile =
                    serde_json::from_slice(&raw).map_err(|source| RevocationStoreError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                file.revoked_sessions
                    .into_iter()
                    .filter(|(id, exp)| !id.trim().is_empty() && *exp > now)
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(RevocationStoreError::Read { path, source }),
        };
        debug!(path = %path.display(), entries = entries.len(), "Loaded revocation store");
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record `session_id` as revoked until `expires_at`. Returns whether it
    /// was already revoked; re-revoking overwrites the expiry.
    pub fn revoke(&self, session_id: &str, expires_at: i64, now: i64) -> Result<bool, RevocationStoreError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(RevocationStoreError::MissingSessionId);
        }

        let mut entries = self.entries.write();
        entries.retain(|_, exp| *exp > now);
        let previous = entries.insert(session_id.to_string(), expires_at);

        if let Some(path) = &self.path {
            if let Err(source) = persist(path, &entries) {
                match previous {
                    Some(exp) => entries.insert(session_id.to_string(), exp),
                    None => entries.remove(session_id),
                };
                return Err(RevocationStoreError::Persist {
                    path: path.clone(),
                    source,
                });
            }
        }
        Ok(previous.is_some())
    }

    pub fn is_revoked(&self, session_id: &str, now: i64) -> bool {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return false;
        }
        let expiry = self.entries.read().get(session_id).copied();
        match expiry {
            None => false,
            Some(exp) if exp > now => true,
            Some(_) => {
                let mut entries = self.entries.write();
                if entries.get(session_id).is_some_and(|exp| *exp <= now) {
                    entries.remove(session_id);
                }
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn persist(path: &Path, entries: &BTreeMap<String, i64>) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let snapshot = StoreFile {
        version: STORE_VERSION,
        revoked_sessions: entries.clone(),
    };
    let payload = serde_json::to_vec(&snapshot).map_err(std::io::Error::other)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let written = write_private(&tmp, &payload).and_then(|_| std::fs::rename(&tmp, path));
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}

fn write_private(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(payload)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_reports_prior_state() {
        let store = RevocationStore::in_memory();
        assert!(!store.revoke("sid", 200, 100).unwrap());
        assert!(store.revoke("sid", 300, 100).unwrap());
        assert!(store.is_revoked("sid", 150));
        assert!(matches!(store.revoke("  ", 200, 100), Err(RevocationStoreError::MissingSessionId)));
    }

    #[test]
    fn test_expired_entries_are_dropped_lazily() {
        let store = RevocationStore::in_memory();
        store.revoke("sid", 200, 100).unwrap();
        assert!(!store.is_revoked("sid", 200));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_revoke_prunes_expired_entries() {
        let store = RevocationStore::in_memory();
        store.revoke("old", 150, 100).unwrap();
        store.revoke("new", 500, 200).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("revoked.json");

        let store = RevocationStore::load(&path, 100).unwrap();
        assert!(store.is_empty());
        store.revoke("sid-a", 1_000, 100).unwrap();
        store.revoke("sid-b", 300, 100).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["revoked_sessions"]["sid-a"], 1_000);
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = RevocationStore::load(&path, 400).unwrap();
        assert!(reloaded.is_revoked("sid-a", 400));
        assert!(!reloaded.is_revoked("sid-b", 400));
        assert_eq!(reloaded.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revoked.json");
        let store = RevocationStore::load(&path, 0).unwrap();
        store.revoke("sid", 100, 0).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revoked.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            RevocationStore::load(&path, 0),
            Err(RevocationStoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("revoked.json");
        let store = RevocationStore::load(&path, 0).unwrap();
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        let err = store.revoke("sid", 100, 0).unwrap_err();
        assert!(matches!(err, RevocationStoreError::Persist { .. }));
        assert!(!store.is_revoked("sid", 1));
        assert!(store.is_empty());
    }
}
