//! Key-value persistence for conversations and UI preferences.
//!
//! Every value is a whole JSON document replaced on each write. Reads that
//! fail degrade to the default value, writes that fail are logged; neither
//! ever reaches the caller.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::Conversation;

const CONVERSATIONS_KEY: &str = "conversations";
const CURRENT_ID_KEY: &str = "currentConversationId";
const THEME_KEY: &str = "theme";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid key {0:?}")]
    InvalidKey(String),
}

/// String-keyed storage of string documents.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// One `<key>.json` file per key inside a directory.
pub struct FileStore {
    root_dir: PathBuf,
}

impl FileStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Per-user data directory, e.g. `~/.local/share/paperchat` on Linux.
    pub fn default_location() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("paperchat"))
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root_dir.join(format!("{}.json", key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        std::fs::create_dir_all(&self.root_dir)?;

        // Write-then-rename so a crash never leaves half a document behind
        let tmp = path.with_extension("json.tmp");
        debug!("Saving {} to {}", key, path.display());
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store, useful for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// Colour scheme preference.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

/// Typed access to the persisted conversation list, current conversation
/// and theme.
pub struct ConversationStore {
    backend: Box<dyn KeyValueStore>,
}

impl ConversationStore {
    pub fn new(backend: impl KeyValueStore + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// In-memory store with nothing persisted yet.
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    pub fn load_conversations(&self) -> Vec<Conversation> {
        self.load(CONVERSATIONS_KEY).unwrap_or_default()
    }

    pub fn save_conversations(&self, conversations: &[Conversation]) {
        self.save(CONVERSATIONS_KEY, conversations);
    }

    pub fn load_current_id(&self) -> Option<String> {
        self.load(CURRENT_ID_KEY)
    }

    pub fn save_current_id(&self, id: Option<&str>) {
        match id {
            Some(id) => self.save(CURRENT_ID_KEY, id),
            None => {
                if let Err(e) = self.backend.remove(CURRENT_ID_KEY) {
                    warn!("Failed to clear {}: {}", CURRENT_ID_KEY, e);
                }
            }
        }
    }

    pub fn load_theme(&self) -> Theme {
        self.load(THEME_KEY).unwrap_or_default()
    }

    pub fn save_theme(&self, theme: Theme) {
        self.save(THEME_KEY, &theme);
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding unreadable {}: {}", key, e);
                None
            }
        }
    }

    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let result = serde_json::to_string(value)
            .map_err(StoreError::from)
            .and_then(|json| self.backend.set(key, &json));

        if let Err(e) = result {
            warn!("Failed to write {}: {}", key, e);
        }
    }
}

#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
impl KeyValueStore for FailingStore {
    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied").into())
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied").into())
    }

    fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(FileStore::new(dir.path()));

        let mut conversation = Conversation::new();
        conversation.push(Message::user("how do diffusion models work"));
        store.save_conversations(std::slice::from_ref(&conversation));
        store.save_current_id(Some(&conversation.id));
        store.save_theme(Theme::Dark);

        assert!(dir.path().join("conversations.json").exists());

        let reopened = ConversationStore::new(FileStore::new(dir.path()));
        assert_eq!(reopened.load_conversations(), vec![conversation.clone()]);
        assert_eq!(reopened.load_current_id(), Some(conversation.id));
        assert_eq!(reopened.load_theme(), Theme::Dark);

        reopened.save_current_id(None);
        assert_eq!(reopened.load_current_id(), None);
    }

    #[test]
    fn test_missing_values_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(FileStore::new(dir.path().join("not-created-yet")));

        assert!(store.load_conversations().is_empty());
        assert_eq!(store.load_current_id(), None);
        assert_eq!(store.load_theme(), Theme::Light);
    }

    #[test]
    fn test_corrupt_document_degrades_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("conversations.json"), "[{oops").unwrap();
        std::fs::write(dir.path().join("theme.json"), "\"sepia\"").unwrap();

        let store = ConversationStore::new(FileStore::new(dir.path()));
        assert!(store.load_conversations().is_empty());
        assert_eq!(store.load_theme(), Theme::Light);
    }

    #[test]
    fn test_failing_backend_is_not_fatal() {
        let store = ConversationStore::new(FailingStore);

        store.save_conversations(&[Conversation::new()]);
        store.save_current_id(Some("abc"));
        store.save_current_id(None);
        store.save_theme(Theme::Dark);

        assert!(store.load_conversations().is_empty());
        assert_eq!(store.load_current_id(), None);
        assert_eq!(store.load_theme(), Theme::Light);
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let store = FileStore::new("/tmp/unused");
        assert!(matches!(
            store.get("../etc/passwd"),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_theme_wire_format() {
        assert_eq!(serde_json::to_string(&Theme::Dark).unwrap(), "\"dark\"");
    }
}
