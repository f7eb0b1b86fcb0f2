mod mantis;
mod openproject;
mod trac;

pub use mantis::{Mantis, MantisApi, ProjectStatus, ViewState};
pub use openproject::{OpenProject, OpenProjectApi};
pub use trac::{Trac, TracApi};

use crate::config::{TrackerConfig, TrackerKind};
use crate::credentials::{self, CredentialStore};
use crate::execution::Execution;
use crate::links::{LinkSink, SinkError};

use lazy_static::lazy_static;
use pulldown_cmark::Parser;
use regex::Regex;
use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for every single tracker request
pub const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request error")]
    Request(#[from] reqwest::Error),
    #[error("{code}: {reason}")]
    Status {
        url: String,
        code: u16,
        reason: String,
    },
    #[error("JSON-RPC call {method} failed: {message}")]
    Rpc { method: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid tracker API response: {res}")]
    Api {
        res: String,
        #[source]
        e: serde_json::Error,
    },
    #[error("Cannot encode request body")]
    Encode(#[source] serde_json::Error),
    #[error("Cannot extract issue ID from URL '{0}'")]
    BugUrl(String),
    #[error(
        "No Trac project known{}",
        .0.map(|id| format!(" for ticket #{}", id)).unwrap_or_default()
    )]
    NoProject(Option<u64>),
    #[error("{op} is not supported by {tracker}")]
    Unsupported {
        op: &'static str,
        tracker: TrackerKind,
    },
    #[error("Trying to construct invalid HTTP header")]
    Header(#[from] http::header::InvalidHeaderValue),
    #[error("Cannot record link reference")]
    Link(#[source] SinkError),
    #[error("Background comment post terminated without result")]
    Background,
}

impl Error {
    fn status(url: &str, status: StatusCode) -> Self {
        Error::Status {
            url: url.to_owned(),
            code: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_owned(),
        }
    }

    /// Tracker could not be reached or refused the request
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Request(_) | Error::Status { .. } | Error::Rpc { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// `{"error": "<message>"}` record for JSON consumers
pub fn error_record(e: &Error) -> Value {
    json!({ "error": e.to_string() })
}

/// Tracker-independent issue representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub status: String,
    pub url: String,
}

/// Tracker-independent comment representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comment {
    pub id: u64,
    pub text: String,
}

/// Tracker-native issue address. Trac additionally needs the project name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BugRef {
    pub id: u64,
    pub project: Option<String>,
}

impl BugRef {
    pub fn new(id: u64) -> Self {
        Self { id, project: None }
    }

    pub fn in_project<S: Into<String>>(id: u64, project: S) -> Self {
        Self {
            id,
            project: Some(project.into()),
        }
    }
}

/// Outcome of a one-click issue report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    /// Issue has been created and linked to the execution
    Filed { issue: Issue, url: String },
    /// Something went wrong, the user has to enter the issue manually at `url`
    Manual { url: String },
}

impl Report {
    pub fn url(&self) -> &str {
        match self {
            Report::Filed { url, .. } | Report::Manual { url } => url,
        }
    }

    pub fn issue(&self) -> Option<&Issue> {
        match self {
            Report::Filed { issue, .. } => Some(issue),
            Report::Manual { .. } => None,
        }
    }
}

/// Raw capabilities of a tracker's remote API. One request per call, no retries.
pub trait Api {
    /// Tracker-native issue payload
    type Issue;
    /// Tracker-native creation payload
    type NewIssue;

    fn get_issue(&self, bug: &BugRef) -> Result<Self::Issue>;

    fn create_issue(&self, fields: &Self::NewIssue) -> Result<Self::Issue>;

    fn update_issue(&self, bug: &BugRef, fields: &Value) -> Result<Value>;

    /// Comments in tracker-defined order
    fn get_comments(&self, bug: &BugRef) -> Result<Vec<Comment>>;

    fn add_comment(&self, bug: &BugRef, text: &str) -> Result<Comment>;

    fn delete_comment(&self, bug: &BugRef, comment_id: u64) -> Result<()>;
}

/// What the test management system sees of an issue tracker
pub trait IssueTracker: Send + Sync {
    fn kind(&self) -> TrackerKind;

    fn links(&self) -> &dyn LinkSink;

    /// Extracts the tracker-native issue address from an issue URL
    fn bug_id_from_url(&self, url: &str) -> Result<BugRef> {
        trailing_id(url).map(BugRef::new)
    }

    /// Fetches the issue behind `url` in normalized form
    fn details(&self, url: &str) -> Result<Issue>;

    /// Creates an issue from `execution` and returns it together with its URL
    fn file_issue(&self, execution: &Execution, reporter: &str) -> Result<(Issue, String)>;

    /// Page for entering an issue manually
    fn new_issue_url(&self, execution: &Execution) -> String;

    fn post_comment(&self, execution: &Execution, bug: &BugRef) -> Result<Comment>;

    fn comments(&self, bug: &BugRef) -> Result<Vec<Comment>>;

    fn is_adding_testcase_to_issue_disabled(&self) -> bool;

    /// One-click report. Never fails: any error turns into a link to the manual report page.
    fn report_issue(&self, execution: &Execution, reporter: &str) -> Report {
        let filed = self
            .file_issue(execution, reporter)
            .and_then(|(issue, url)| {
                self.links()
                    .record(execution.id, &url, true)
                    .map_err(Error::Link)?;
                Ok(Report::Filed { issue, url })
            });
        match filed {
            Ok(report) => {
                info!("{}: TE-{} reported as {}", self.kind(), execution.id, report.url());
                report
            }
            Err(e) => {
                warn!(
                    "{}: cannot report TE-{}, falling back to manual entry: {}",
                    self.kind(),
                    execution.id,
                    chain(&e)
                );
                Report::Manual {
                    url: self.new_issue_url(execution),
                }
            }
        }
    }
}

/// Creates the tracker facade for `config`, acting on behalf of `user` if given.
pub fn connect(
    config: TrackerConfig,
    user: Option<&str>,
    store: &dyn CredentialStore,
    links: Arc<dyn LinkSink>,
) -> Arc<dyn IssueTracker> {
    let creds = credentials::resolve(&config, user, store);
    match config.kind {
        TrackerKind::Mantis => Arc::new(Mantis::new(config, creds, links)),
        TrackerKind::OpenProject => Arc::new(OpenProject::new(config, creds, links)),
        TrackerKind::Trac => Arc::new(Trac::new(config, creds, links)),
    }
}

lazy_static! {
    static ref TRAILING_INT: Regex = Regex::new(r"(\d+)/?$").unwrap();
}

fn trailing_id(url: &str) -> Result<u64> {
    TRAILING_INT
        .captures(url.trim())
        .and_then(|c| c[1].parse().ok())
        .ok_or_else(|| Error::BugUrl(url.to_owned()))
}

/// Error message including all causes
pub(crate) fn chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut cur = e.source();
    while let Some(cause) = cur {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        cur = cause.source();
    }
    msg
}

fn client(verify_ssl: bool, headers: HeaderMap) -> Result<Client> {
    build(Client::builder(), verify_ssl, headers)
}

fn build(builder: ClientBuilder, verify_ssl: bool, headers: HeaderMap) -> Result<Client> {
    Ok(builder
        .default_headers(headers)
        .timeout(TIMEOUT)
        .danger_accept_invalid_certs(!verify_ssl)
        .build()?)
}

/// Rejects non-2xx responses and decodes the body
fn decode<T: DeserializeOwned>(res: Response) -> Result<T> {
    let status = res.status();
    if !status.is_success() {
        return Err(Error::status(res.url().as_str(), status));
    }
    let res = res.text()?;
    serde_json::from_str(&res).map_err(|e| Error::Api { res, e })
}

/// Renders Markdown for trackers which display descriptions and notes as HTML
pub fn markdown_to_html(text: &str) -> String {
    let mut html = String::with_capacity(text.len() * 3 / 2);
    pulldown_cmark::html::push_html(&mut html, Parser::new(text));
    html
}

fn user_agent() -> String {
    format!("{}/{}", clap::crate_name!(), clap::crate_version!())
}

// === Tests ===
