//! Mantis BT REST API (`/api/rest`).

use super::{client, decode, markdown_to_html, user_agent, Api, BugRef, Comment, Error, Issue, IssueTracker, Result};
use crate::config::{TrackerConfig, TrackerKind};
use crate::credentials::Credentials;
use crate::execution::Execution;
use crate::links::LinkSink;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::*;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

const JSON_PATCH: &str = "application/json-patch+json";

/// Every issue created by us goes into this category
pub const CATEGORY: &str = "General";

/// Entry of one of Mantis' fixed code tables
#[derive(Serialize)]
struct Coded {
    id: u16,
    name: &'static str,
    label: &'static str,
}

impl Coded {
    fn new(id: u16, name: &'static str) -> Self {
        Self {
            id,
            name,
            label: name,
        }
    }
}

/// Project status. Mantis has no endpoint to discover these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Development,
    Release,
    Stable,
    Obsolete,
}

impl ProjectStatus {
    fn coded(self) -> Coded {
        match self {
            ProjectStatus::Development => Coded::new(10, "development"),
            ProjectStatus::Release => Coded::new(30, "release"),
            ProjectStatus::Stable => Coded::new(50, "stable"),
            ProjectStatus::Obsolete => Coded::new(70, "obsolete"),
        }
    }
}

impl Default for ProjectStatus {
    fn default() -> Self {
        ProjectStatus::Development
    }
}

impl FromStr for ProjectStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(ProjectStatus::Development),
            "release" => Ok(ProjectStatus::Release),
            "stable" => Ok(ProjectStatus::Stable),
            "obsolete" => Ok(ProjectStatus::Obsolete),
            _ => Err(Error::NotFound(format!("Project status '{}'", s))),
        }
    }
}

impl Serialize for ProjectStatus {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.coded().serialize(s)
    }
}

/// Project view state, hard-coded in Mantis as well
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Public,
    Private,
}

impl ViewState {
    pub fn new(is_public: bool) -> Self {
        if is_public {
            ViewState::Public
        } else {
            ViewState::Private
        }
    }
}

impl Serialize for ViewState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            ViewState::Public => Coded::new(10, "public"),
            ViewState::Private => Coded::new(50, "private"),
        }
        .serialize(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProject {
    pub name: String,
    pub status: ProjectStatus,
    pub description: String,
    pub enabled: bool,
    pub view_state: ViewState,
}

impl NewProject {
    pub fn new(name: &str, description: &str, status: ProjectStatus, is_public: bool) -> Self {
        Self {
            name: name.to_owned(),
            status,
            description: description.to_owned(),
            enabled: true,
            view_state: ViewState::new(is_public),
        }
    }
}

/// Reference to another Mantis object, by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Named {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: String,
}

impl Named {
    fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Project {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Note {
    pub id: u64,
    #[serde(default)]
    pub text: String,
}

impl From<Note> for Comment {
    fn from(n: Note) -> Self {
        Comment {
            id: n.id,
            text: n.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MantisIssue {
    pub id: u64,
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Named,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl MantisIssue {
    fn normalize(self, url: String) -> Issue {
        Issue {
            id: self.id,
            title: self.summary,
            description: self.description,
            status: self.status.name,
            url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewIssue {
    pub summary: String,
    pub description: String,
    pub category: Named,
    pub project: Named,
}

impl NewIssue {
    pub fn new(summary: String, description: String, project: &str) -> Self {
        Self {
            summary,
            description,
            category: Named::new(CATEGORY),
            project: Named::new(project),
        }
    }
}

#[derive(Deserialize)]
struct Projects {
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct CreatedProject {
    project: Project,
}

#[derive(Deserialize)]
struct Issues {
    issues: Vec<MantisIssue>,
}

#[derive(Deserialize)]
struct CreatedIssue {
    issue: MantisIssue,
}

#[derive(Deserialize)]
struct CreatedNote {
    note: Note,
}

#[derive(Debug, Clone)]
pub struct MantisApi {
    client: Client,
    base_url: String,
}

impl MantisApi {
    /// `api_token` goes verbatim into the `Authorization` header.
    pub fn new(base_url: &str, api_token: &str, verify_ssl: bool) -> Result<Self> {
        let mut h = HeaderMap::new();
        h.insert(ACCEPT, HeaderValue::from_static(JSON_PATCH));
        h.insert(AUTHORIZATION, api_token.parse()?);
        h.insert(USER_AGENT, user_agent().parse()?);
        Ok(Self {
            client: client(verify_ssl, h)?,
            base_url: format!("{}/api/rest", base_url.trim_end_matches('/')),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn with_body<B: Serialize>(&self, req: RequestBuilder, body: &B) -> Result<RequestBuilder> {
        let body = serde_json::to_vec(body).map_err(Error::Encode)?;
        Ok(req.header(CONTENT_TYPE, JSON_PATCH).body(body))
    }

    pub fn get_projects(&self) -> Result<Vec<Project>> {
        let url = self.url("projects");
        debug!("GET {}", url);
        let p: Projects = decode(self.client.get(&url).send()?)?;
        Ok(p.projects)
    }

    pub fn create_project(&self, project: &NewProject) -> Result<Project> {
        let url = self.url("projects");
        debug!("POST {}", url);
        let req = self.with_body(self.client.post(&url), project)?;
        let p: CreatedProject = decode(req.send()?)?;
        Ok(p.project)
    }

    pub fn close_issue(&self, bug: &BugRef) -> Result<Value> {
        self.update_issue(bug, &json!({"status": {"name": "closed"}}))
    }
}

impl Api for MantisApi {
    type Issue = MantisIssue;
    type NewIssue = NewIssue;

    fn get_issue(&self, bug: &BugRef) -> Result<MantisIssue> {
        let url = self.url(&format!("issues/{}", bug.id));
        debug!("GET {}", url);
        let i: Issues = decode(self.client.get(&url).send()?)?;
        i.issues
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("Issue {}", bug.id)))
    }

    fn create_issue(&self, fields: &NewIssue) -> Result<MantisIssue> {
        let url = self.url("issues");
        debug!("POST {}", url);
        let req = self.with_body(self.client.post(&url), fields)?;
        let c: CreatedIssue = decode(req.send()?)?;
        Ok(c.issue)
    }

    fn update_issue(&self, bug: &BugRef, fields: &Value) -> Result<Value> {
        let url = self.url(&format!("issues/{}", bug.id));
        debug!("PATCH {}", url);
        let req = self.with_body(self.client.patch(&url), fields)?;
        decode(req.send()?)
    }

    fn get_comments(&self, bug: &BugRef) -> Result<Vec<Comment>> {
        let issue = self.get_issue(bug)?;
        Ok(issue.notes.into_iter().map(Comment::from).collect())
    }

    fn add_comment(&self, bug: &BugRef, text: &str) -> Result<Comment> {
        let url = self.url(&format!("issues/{}/notes", bug.id));
        debug!("POST {}", url);
        let req = self.with_body(self.client.post(&url), &json!({ "text": text }))?;
        let n: CreatedNote = decode(req.send()?)?;
        Ok(n.note.into())
    }

    fn delete_comment(&self, bug: &BugRef, comment_id: u64) -> Result<()> {
        let url = self.url(&format!("issues/{}/notes/{}", bug.id, comment_id));
        debug!("DELETE {}", url);
        decode::<Value>(self.client.delete(&url).send()?)?;
        Ok(())
    }
}

/// Mantis facade.
///
/// Only the API token (`api_password`) is used, `api_username` may stay blank.
pub struct Mantis {
    config: TrackerConfig,
    creds: Credentials,
    links: Arc<dyn LinkSink>,
}

impl Mantis {
    pub fn new(config: TrackerConfig, creds: Credentials, links: Arc<dyn LinkSink>) -> Self {
        Self {
            config,
            creds,
            links,
        }
    }

    pub fn rpc(&self) -> Result<MantisApi> {
        MantisApi::new(
            self.config.base(),
            &self.creds.password,
            self.config.verify_ssl,
        )
    }

    /// Mantis project matching the execution's product, otherwise the first one found
    pub fn project_for(&self, api: &MantisApi, execution: &Execution) -> Result<String> {
        let mut projects = api.get_projects()?;
        if let Some(p) = projects.iter().find(|p| p.name == execution.product) {
            return Ok(p.name.clone());
        }
        if projects.is_empty() {
            return Err(Error::NotFound("Project".into()));
        }
        Ok(projects.swap_remove(0).name)
    }

    fn issue_url(&self, id: u64) -> String {
        format!("{}/view.php?id={}", self.config.base(), id)
    }
}

impl IssueTracker for Mantis {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Mantis
    }

    fn links(&self) -> &dyn LinkSink {
        self.links.as_ref()
    }

    fn details(&self, url: &str) -> Result<Issue> {
        let bug = self.bug_id_from_url(url)?;
        let issue = self.rpc()?.get_issue(&bug)?;
        Ok(issue.normalize(url.to_owned()))
    }

    fn file_issue(&self, execution: &Execution, reporter: &str) -> Result<(Issue, String)> {
        let api = self.rpc()?;
        let project = self.project_for(&api, execution)?;
        let issue = api.create_issue(&NewIssue::new(
            execution.summary(),
            markdown_to_html(&execution.report(reporter).to_string()),
            &project,
        ))?;
        let url = self.issue_url(issue.id);
        Ok((issue.normalize(url.clone()), url))
    }

    fn new_issue_url(&self, _execution: &Execution) -> String {
        format!("{}/bug_report_page.php", self.config.base())
    }

    fn post_comment(&self, execution: &Execution, bug: &BugRef) -> Result<Comment> {
        self.rpc()?
            .add_comment(bug, &markdown_to_html(&execution.comment_text()))
    }

    fn comments(&self, bug: &BugRef) -> Result<Vec<Comment>> {
        self.rpc()?.get_comments(bug)
    }

    fn is_adding_testcase_to_issue_disabled(&self) -> bool {
        self.config.base().is_empty() || self.creds.password.is_empty()
    }
}

// === Tests ===
