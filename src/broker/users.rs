//! Credential store: a JSON map of client id to stored password
//! representation, persisted under the broker's data directory.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use log::info;

pub struct UserStore {
    path: PathBuf,
    users: HashMap<String, String>,
}

impl UserStore {
    /// Read the store, starting empty if the file does not exist yet.
    pub fn load(path: PathBuf) -> Result<UserStore, super::BrokerError> {
        let users = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        info!("user store loaded: {} user(s)", users.len());
        Ok(UserStore { path, users })
    }

    pub fn get(&self, client_id: &str) -> Option<&str> {
        self.users.get(client_id).map(String::as_str)
    }

    pub fn insert(&mut self, client_id: &str, stored: String) {
        self.users.insert(client_id.to_string(), stored);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Persist through a temporary sibling so a failed write cannot truncate
    /// the existing store.
    pub fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.users)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}
