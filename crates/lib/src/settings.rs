//! User settings store: one JSON file of user records, keyed by (namespace, user id).
//!
//! Records are created on first contact and updated in place. There is no
//! transaction around read-then-write: two conversations updating the same user
//! race, and the last write wins. Saves are serialized and always write the
//! newest snapshot, so the file never goes back to an older state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// CalDAV account details gathered from the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalDavSettings {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Settings for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub namespace: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caldav: Option<CalDavSettings>,
}

impl UserRecord {
    pub fn new(namespace: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            user_id: user_id.into(),
            caldav: None,
        }
    }

    fn is(&self, namespace: &str, user_id: &str) -> bool {
        self.namespace == namespace && self.user_id == user_id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings store encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// In-memory user records backed by a JSON file.
pub struct SettingsStore {
    path: PathBuf,
    users: RwLock<Vec<UserRecord>>,
    save_lock: Mutex<()>,
}

impl SettingsStore {
    /// Load the store from `path`; a missing or unreadable file starts empty.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let users = match tokio::fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                log::warn!("settings store {} unreadable, starting empty: {}", path.display(), e);
                Vec::new()
            }),
            Err(_) => {
                log::debug!("settings store {} not found, starting empty", path.display());
                Vec::new()
            }
        };
        Self {
            path,
            users: RwLock::new(users),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot and write under one lock; the file is replaced by rename.
    async fn save(&self) -> Result<(), SettingsError> {
        let _saving = self.save_lock.lock().await;
        let json = {
            let users = self.users.read().await;
            serde_json::to_string_pretty(&*users)?
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn get(&self, namespace: &str, user_id: &str) -> Option<UserRecord> {
        let users = self.users.read().await;
        users.iter().find(|u| u.is(namespace, user_id)).cloned()
    }

    /// Return the user's record, creating and persisting an empty one on first contact.
    pub async fn get_or_create(
        &self,
        namespace: &str,
        user_id: &str,
    ) -> Result<UserRecord, SettingsError> {
        if let Some(existing) = self.get(namespace, user_id).await {
            return Ok(existing);
        }
        let record = UserRecord::new(namespace, user_id);
        {
            let mut users = self.users.write().await;
            // Another conversation may have created it since the read.
            if let Some(existing) = users.iter().find(|u| u.is(namespace, user_id)) {
                return Ok(existing.clone());
            }
            users.push(record.clone());
        }
        log::info!("settings: new user {}/{}", namespace, user_id);
        self.save().await?;
        Ok(record)
    }

    /// Replace (or insert) the record for the same (namespace, user) and persist.
    pub async fn update(&self, record: UserRecord) -> Result<(), SettingsError> {
        {
            let mut users = self.users.write().await;
            match users
                .iter_mut()
                .find(|u| u.is(&record.namespace, &record.user_id))
            {
                Some(existing) => *existing = record,
                None => users.push(record),
            }
        }
        self.save().await
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}
