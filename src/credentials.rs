//! Picks the credential pair for a single tracker call.

use crate::config::TrackerConfig;

use serde::Deserialize;
use std::fmt;

/// Username/password (or API token) pair sent to a tracker
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<S: Into<String>, T: Into<String>>(username: S, password: T) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Per-user API token for one tracker instance. Only its owner ever uses it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserCredential {
    pub owner: String,
    pub base_url: String,
    #[serde(default)]
    pub api_username: String,
    #[serde(default)]
    pub api_password: String,
}

/// Lookup of per-user credentials by (owner, base_url)
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, owner: &str, base_url: &str) -> Option<Credentials>;
}

impl CredentialStore for [UserCredential] {
    fn lookup(&self, owner: &str, base_url: &str) -> Option<Credentials> {
        self.iter()
            .find(|c| c.owner == owner && same_base_url(&c.base_url, base_url))
            .map(|c| Credentials::new(c.api_username.as_str(), c.api_password.as_str()))
    }
}

impl CredentialStore for Vec<UserCredential> {
    fn lookup(&self, owner: &str, base_url: &str) -> Option<Credentials> {
        self.as_slice().lookup(owner, base_url)
    }
}

/// Compares base URLs ignoring trailing slashes
pub fn same_base_url(a: &str, b: &str) -> bool {
    a.trim().trim_end_matches('/') == b.trim().trim_end_matches('/')
}

/// A user's own token for this tracker wins over the shared system credential. Empty
/// credentials are a valid outcome; callers check `is_adding_testcase_to_issue_disabled`.
pub fn resolve(
    config: &TrackerConfig,
    user: Option<&str>,
    store: &dyn CredentialStore,
) -> Credentials {
    if let Some(owner) = user {
        if let Some(creds) = store.lookup(owner, config.base()) {
            debug!("{}: using API token of {}", config.base(), owner);
            return creds;
        }
    }
    Credentials::new(config.api_username.as_str(), config.api_password.as_str())
}

// === Tests ===
