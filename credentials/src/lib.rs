//! JSON-file-backed implementation of `p3core::ports::CredentialStore`
//! (§1: the credential store is an external collaborator the core only
//! sees through a trait).

use hashbrown::HashMap;
use p3core::ports::CredentialStore;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct UsersFile {
    pub users: HashMap<String, String>,
}

/// Auth-only slice of server configuration (§1: the full `ServerConfig`
/// lives in the server crate, which depends on this one, not the reverse).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatorConfig {
    pub allow_ephemeral: bool,
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        AuthenticatorConfig { allow_ephemeral: true }
    }
}

pub struct InMemoryCredentialStore {
    users: HashMap<String, String>,
}

impl InMemoryCredentialStore {
    pub fn new(users: HashMap<String, String>) -> Self {
        InMemoryCredentialStore {
            users: users.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect(),
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: UsersFile = serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self::new(file.users))
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn verify(&self, screenname: &str, password: &str) -> bool {
        self.users
            .get(&screenname.to_lowercase())
            .map(|stored| stored == password)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_is_case_insensitive_on_screenname() {
        let mut users = HashMap::new();
        users.insert("Bobby".to_string(), "hunter2".to_string());
        let store = InMemoryCredentialStore::new(users);

        assert!(store.verify("BOBBY", "hunter2"));
        assert!(!store.verify("BOBBY", "wrong"));
        assert!(!store.verify("nobody", "anything"));
    }
}
