//! Key-value session and preference storage.
//!
//! Session values live as long as the login; preferences persist per user.
//! An empty string and a missing key are treated the same by readers.

use std::collections::HashMap;

use parking_lot::RwLock;

pub const SESSION_ACCOUNT_ID: &str = "accountId";
pub const SESSION_PROJECT: &str = "projectId";
pub const SESSION_USER_TYPE: &str = "userType";
pub const PREF_PROJECT_DEFAULT: &str = "defaultProjectId";

pub const USER_TYPE_ADMIN: &str = "admin";

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    /// `None` removes the key.
    fn set(&self, key: &str, value: Option<&str>);
}

pub trait Preferences: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

#[derive(Debug, Default)]
pub struct MemorySession {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(pairs: &[(&str, &str)]) -> Self {
        let session = Self::new();
        for (key, value) in pairs {
            session.set(key, Some(*value));
        }
        session
    }
}

impl SessionStore for MemorySession {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    }

    fn set(&self, key: &str, value: Option<&str>) {
        let mut values = self.values.write();
        match value {
            Some(value) => {
                values.insert(key.to_string(), value.to_string());
            }
            None => {
                values.remove(key);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored value, including an explicitly cleared `""`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

impl Preferences for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.raw(key).filter(|value| !value.is_empty())
    }

    fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }
}
