//! Tracker configuration records.
//!
//! A [`TrackerConfig`] is owned by the surrounding application. It names the tracker product
//! through a [`TrackerKind`] which is resolved once when the record is loaded.

use serde::Deserialize;
use std::convert::TryFrom;
use std::env;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown tracker type '{0}'")]
    UnknownKind(String),
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("Invalid value '{1}' for {0}")]
    Invalid(&'static str, String),
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub const DEFAULT_WORKPACKAGE_TYPE: &str = "Bug";

/// Supported tracker products
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum TrackerKind {
    Mantis,
    OpenProject,
    Trac,
}

impl TrackerKind {
    pub fn name(self) -> &'static str {
        match self {
            TrackerKind::Mantis => "Mantis",
            TrackerKind::OpenProject => "OpenProject",
            TrackerKind::Trac => "Trac",
        }
    }
}

impl FromStr for TrackerKind {
    type Err = Error;

    /// Accepts short names as well as dotted class paths like
    /// `trackers_integration.issuetracker.Mantis`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().rsplit('.').next().unwrap_or_default();
        match name.to_ascii_lowercase().as_str() {
            "mantis" => Ok(TrackerKind::Mantis),
            "openproject" => Ok(TrackerKind::OpenProject),
            "trac" => Ok(TrackerKind::Trac),
            _ => Err(Error::UnknownKind(s.to_owned())),
        }
    }
}

impl TryFrom<String> for TrackerKind {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        FromStr::from_str(&s)
    }
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_verify_ssl() -> bool {
    true
}

fn default_workpackage_type() -> String {
    DEFAULT_WORKPACKAGE_TYPE.to_owned()
}

/// One configured tracker instance
#[derive(Clone, PartialEq, Deserialize)]
pub struct TrackerConfig {
    #[serde(rename = "tracker_type")]
    pub kind: TrackerKind,
    pub base_url: String,
    #[serde(default)]
    pub api_username: String,
    #[serde(default)]
    pub api_password: String,
    /// Turn off for self-signed test instances
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    /// OpenProject work package type used for new issues
    #[serde(default = "default_workpackage_type")]
    pub workpackage_type: String,
}

impl TrackerConfig {
    pub fn new<S: Into<String>>(kind: TrackerKind, base_url: S) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            api_username: String::new(),
            api_password: String::new(),
            verify_ssl: true,
            workpackage_type: default_workpackage_type(),
        }
    }

    pub fn with_credentials<S: Into<String>, T: Into<String>>(self, username: S, password: T) -> Self {
        Self {
            api_username: username.into(),
            api_password: password.into(),
            ..self
        }
    }

    pub fn insecure(self) -> Self {
        Self {
            verify_ssl: false,
            ..self
        }
    }

    /// Base URL without trailing slash
    pub fn base(&self) -> &str {
        self.base_url.trim().trim_end_matches('/')
    }

    /// Reads `TRACKER_*` settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind = var("TRACKER_TYPE")
            .ok_or(Error::Missing("TRACKER_TYPE"))?
            .parse()?;
        let base_url = var("TRACKER_URL").ok_or(Error::Missing("TRACKER_URL"))?;
        let verify_ssl = match var("TRACKER_VERIFY_SSL") {
            Some(v) => parse_bool(&v).ok_or(Error::Invalid("TRACKER_VERIFY_SSL", v))?,
            None => true,
        };
        Ok(Self {
            kind,
            base_url,
            api_username: var("TRACKER_USERNAME").unwrap_or_default(),
            api_password: var("TRACKER_PASSWORD").unwrap_or_default(),
            verify_ssl,
            workpackage_type: var("OPENPROJECT_WORKPACKAGE_TYPE_NAME")
                .unwrap_or_else(default_workpackage_type),
        })
    }
}

impl fmt::Debug for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_username", &self.api_username)
            .field("api_password", &"***")
            .field("verify_ssl", &self.verify_ssl)
            .field("workpackage_type", &self.workpackage_type)
            .finish()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// === Tests ===
