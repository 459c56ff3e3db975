//! Persisted user registry for the chat hub.
//!
//! Accounts live in a single JSON file, `users.json`, inside the data
//! directory: `{"alice": {"password": "<sha256 hex>", "friends": ["bob"]}}`.
//! The file is read once at startup and rewritten after every mutation. A
//! missing or unreadable file starts a fresh registry and writes it back;
//! any other I/O problem is a startup failure.
//!
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the registry file inside the data directory
const USERS_FILE: &str = "users.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("user store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("user store encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One account: password digest plus friend links.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UserRecord {
    /// SHA-256 hex digest of the password
    pub password: String,
    /// Usernames linked via `add_friend`, in insertion order
    pub friends: Vec<String>,
}

/// In-memory registry backed by `users.json`.
pub struct UserStore {
    path: PathBuf,
    users: HashMap<String, UserRecord>,
}

impl UserStore {
    /// Open (or initialize) the registry under `data_dir`.
    ///
    /// Creates the directory if needed. A missing or corrupt registry file
    /// resets to an empty registry and writes it back immediately, so the
    /// file exists from the first boot onwards.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(USERS_FILE);

        let loaded = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match loaded {
            Some(users) => Ok(Self { path, users }),
            None => {
                let store = Self {
                    path,
                    users: HashMap::new(),
                };
                store.save()?;
                Ok(store)
            }
        }
    }

    /// Rewrite the registry file from the in-memory map.
    pub fn save(&self) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&self.users)?;
        fs::write(&self.path, raw)?;
        Ok(())
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn get(&self, username: &str) -> Option<&UserRecord> {
        self.users.get(username)
    }

    /// Insert or replace an account record. Does not save.
    pub fn insert(&mut self, username: String, record: UserRecord) {
        self.users.insert(username, record);
    }

    /// Mutable friend list of an existing account. Does not save.
    pub fn friends_mut(&mut self, username: &str) -> Option<&mut Vec<String>> {
        self.users.get_mut(username).map(|r| &mut r.friends)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
