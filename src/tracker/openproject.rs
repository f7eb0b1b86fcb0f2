//! OpenProject REST API (`/api/v3`). Authentication is HTTP Basic with the literal user
//! name `apikey` and the API token as password.

use super::{client, decode, user_agent, Api, BugRef, Comment, Error, Issue, IssueTracker, Result};
use crate::config::{TrackerConfig, TrackerKind};
use crate::credentials::Credentials;
use crate::execution::Execution;
use crate::links::LinkSink;

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const API_USER: &str = "apikey";

lazy_static! {
    // tolerates /projects/{slug} prefixes and /activity suffixes
    static ref WORK_PACKAGE_ID: Regex = Regex::new(r"work_packages/(\d+)(?:[/?#]|$)").unwrap();
}

/// HAL collection, elements are found in `_embedded.elements`
#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(rename = "_embedded")]
    embedded: Elements<T>,
}

#[derive(Debug, Deserialize)]
struct Elements<T> {
    elements: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Project {
    pub id: u64,
    pub identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkPackageType {
    pub id: u64,
    pub name: String,
}

/// Text with several renderings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formattable {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub raw: String,
    #[serde(default, skip_serializing)]
    pub html: String,
}

impl Formattable {
    pub fn markdown(raw: String) -> Self {
        Self {
            format: "markdown".into(),
            raw,
            html: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub status: Link,
    #[serde(rename = "type", default)]
    pub kind: Link,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Name {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Embedded {
    pub status: Option<Name>,
    #[serde(rename = "type")]
    pub kind: Option<Name>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkPackage {
    pub id: u64,
    pub subject: String,
    #[serde(default)]
    pub description: Formattable,
    #[serde(rename = "_embedded", default)]
    pub embedded: Embedded,
    #[serde(rename = "_links", default)]
    pub links: Links,
}

impl WorkPackage {
    pub fn status(&self) -> &str {
        match &self.embedded.status {
            Some(s) => &s.name,
            None => &self.links.status.title,
        }
    }

    pub fn type_name(&self) -> &str {
        match &self.embedded.kind {
            Some(t) => &t.name,
            None => &self.links.kind.title,
        }
    }

    fn normalize(self, url: String) -> Issue {
        let title = format!(
            "{} {}: {}",
            self.status().to_uppercase(),
            self.type_name().to_uppercase(),
            self.subject
        );
        let status = self.status().to_owned();
        let description = if self.description.html.is_empty() {
            self.description.raw
        } else {
            self.description.html
        };
        Issue {
            id: self.id,
            title,
            description,
            status,
            url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewLinks {
    #[serde(rename = "type")]
    pub kind: Link,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewWorkPackage {
    /// Target project, part of the URL rather than the body
    #[serde(skip)]
    pub project: u64,
    pub subject: String,
    pub description: Formattable,
    #[serde(rename = "_links")]
    pub links: NewLinks,
}

impl NewWorkPackage {
    pub fn new(project: u64, kind: &WorkPackageType, subject: String, description: String) -> Self {
        Self {
            project,
            subject,
            description: Formattable::markdown(description),
            links: NewLinks {
                kind: Link {
                    href: Some(format!("/api/v3/types/{}", kind.id)),
                    title: kind.name.clone(),
                },
            },
        }
    }
}

/// Work package activity; only those carrying a comment are of interest
#[derive(Debug, Clone, Deserialize)]
struct Activity {
    id: u64,
    #[serde(default)]
    comment: Formattable,
}

impl From<Activity> for Comment {
    fn from(a: Activity) -> Self {
        Comment {
            id: a.id,
            text: a.comment.raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenProjectApi {
    client: Client,
    base_url: String,
    token: String,
}

impl OpenProjectApi {
    pub fn new(base_url: &str, api_token: &str, verify_ssl: bool) -> Result<Self> {
        let mut h = HeaderMap::new();
        h.insert(ACCEPT, HeaderValue::from_static("application/hal+json"));
        h.insert(USER_AGENT, user_agent().parse()?);
        Ok(Self {
            client: client(verify_ssl, h)?,
            base_url: format!("{}/api/v3", base_url.trim_end_matches('/')),
            token: api_token.to_owned(),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        debug!("GET {}", url);
        self.client.get(&url).basic_auth(API_USER, Some(&self.token))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        debug!("POST {}", url);
        self.client.post(&url).basic_auth(API_USER, Some(&self.token))
    }

    /// All visible projects, optionally filtered by name or identifier
    pub fn get_projects(&self, name: Option<&str>) -> Result<Vec<Project>> {
        let mut req = self.get("projects");
        if let Some(name) = name {
            let filter = json!([{"name_and_identifier": {"operator": "=", "values": [name]}}]);
            req = req.query(&[("filters", filter.to_string())]);
        }
        let c: Collection<Project> = decode(req.send()?)?;
        Ok(c.embedded.elements)
    }

    pub fn get_workpackage_types(&self, project_id: u64) -> Result<Vec<WorkPackageType>> {
        let req = self.get(&format!("projects/{}/types", project_id));
        let c: Collection<WorkPackageType> = decode(req.send()?)?;
        Ok(c.embedded.elements)
    }
}

impl Api for OpenProjectApi {
    type Issue = WorkPackage;
    type NewIssue = NewWorkPackage;

    fn get_issue(&self, bug: &BugRef) -> Result<WorkPackage> {
        decode(self.get(&format!("work_packages/{}", bug.id)).send()?)
    }

    fn create_issue(&self, fields: &NewWorkPackage) -> Result<WorkPackage> {
        let req = self.post(&format!("projects/{}/work_packages", fields.project));
        decode(req.json(fields).send()?)
    }

    fn update_issue(&self, bug: &BugRef, fields: &Value) -> Result<Value> {
        let url = format!("{}/work_packages/{}", self.base_url, bug.id);
        debug!("PATCH {}", url);
        let req = self.client.patch(&url).basic_auth(API_USER, Some(&self.token));
        decode(req.json(fields).send()?)
    }

    fn get_comments(&self, bug: &BugRef) -> Result<Vec<Comment>> {
        let req = self.get(&format!("work_packages/{}/activities", bug.id));
        let c: Collection<Activity> = decode(req.send()?)?;
        Ok(c.embedded
            .elements
            .into_iter()
            .filter(|a| !a.comment.raw.is_empty())
            .map(Comment::from)
            .collect())
    }

    fn add_comment(&self, bug: &BugRef, text: &str) -> Result<Comment> {
        let req = self.post(&format!("work_packages/{}/activities", bug.id));
        let a: Activity = decode(req.json(&json!({"comment": {"raw": text}})).send()?)?;
        Ok(a.into())
    }

    // activities cannot be deleted through API v3
    fn delete_comment(&self, _bug: &BugRef, _comment_id: u64) -> Result<()> {
        Err(Error::Unsupported {
            op: "delete_comment",
            tracker: TrackerKind::OpenProject,
        })
    }
}

/// OpenProject facade. Only the API token (`api_password`) is used.
pub struct OpenProject {
    config: TrackerConfig,
    creds: Credentials,
    links: Arc<dyn LinkSink>,
}

impl OpenProject {
    pub fn new(config: TrackerConfig, creds: Credentials, links: Arc<dyn LinkSink>) -> Self {
        Self {
            config,
            creds,
            links,
        }
    }

    pub fn rpc(&self) -> Result<OpenProjectApi> {
        OpenProjectApi::new(
            self.config.base(),
            &self.creds.password,
            self.config.verify_ssl,
        )
    }

    /// Project matching `name` by name or identifier, otherwise the first project visible
    pub fn get_project_by_name(&self, api: &OpenProjectApi, name: &str) -> Result<Project> {
        if let Some(p) = api.get_projects(Some(name))?.into_iter().next() {
            return Ok(p);
        }
        api.get_projects(None)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound("Project".into()))
    }

    /// Work package type called `name`, otherwise the project's first type
    pub fn get_workpackage_type(
        &self,
        api: &OpenProjectApi,
        project_id: u64,
        name: &str,
    ) -> Result<WorkPackageType> {
        let mut types = api.get_workpackage_types(project_id)?;
        match types.iter().position(|t| t.name == name) {
            Some(i) => Ok(types.swap_remove(i)),
            None if !types.is_empty() => Ok(types.swap_remove(0)),
            None => Err(Error::NotFound("WorkPackage Type".into())),
        }
    }

    fn issue_url(&self, id: u64) -> String {
        format!("{}/work_packages/{}", self.config.base(), id)
    }
}

impl IssueTracker for OpenProject {
    fn kind(&self) -> TrackerKind {
        TrackerKind::OpenProject
    }

    fn links(&self) -> &dyn LinkSink {
        self.links.as_ref()
    }

    fn bug_id_from_url(&self, url: &str) -> Result<BugRef> {
        WORK_PACKAGE_ID
            .captures(url.trim())
            .and_then(|c| c[1].parse().ok())
            .map(BugRef::new)
            .ok_or_else(|| Error::BugUrl(url.to_owned()))
    }

    fn details(&self, url: &str) -> Result<Issue> {
        let bug = self.bug_id_from_url(url)?;
        let wp = self.rpc()?.get_issue(&bug)?;
        Ok(wp.normalize(url.to_owned()))
    }

    fn file_issue(&self, execution: &Execution, reporter: &str) -> Result<(Issue, String)> {
        let api = self.rpc()?;
        let project = self.get_project_by_name(&api, &execution.product)?;
        let kind = self.get_workpackage_type(&api, project.id, &self.config.workpackage_type)?;
        let wp = api.create_issue(&NewWorkPackage::new(
            project.id,
            &kind,
            execution.summary(),
            execution.report(reporter).to_string(),
        ))?;
        let url = self.issue_url(wp.id);
        Ok((wp.normalize(url.clone()), url))
    }

    fn new_issue_url(&self, _execution: &Execution) -> String {
        format!("{}/work_packages/new", self.config.base())
    }

    fn post_comment(&self, execution: &Execution, bug: &BugRef) -> Result<Comment> {
        self.rpc()?.add_comment(bug, &execution.comment_text())
    }

    fn comments(&self, bug: &BugRef) -> Result<Vec<Comment>> {
        self.rpc()?.get_comments(bug)
    }

    fn is_adding_testcase_to_issue_disabled(&self) -> bool {
        self.config.base().is_empty() || self.creds.password.is_empty()
    }
}

// === Tests ===

#[cfg(test)]
mod test {
    use super::*;
    use crate::execution::test::execution;
    use crate::links::LinkReferences;

    use assert_matches::assert_matches;
    use httpmock::prelude::*;

    // base64("apikey:secret")
    const AUTH: &str = "Basic YXBpa2V5OnNlY3JldA==";

    fn openproject(base_url: &str) -> OpenProject {
        OpenProject::new(
            TrackerConfig::new(TrackerKind::OpenProject, base_url),
            Credentials::new("", "secret"),
            Arc::new(LinkReferences::new()),
        )
    }

    /// Mocks are matched in creation order, so set up filtered queries first.
    fn projects(server: &MockServer, filter: Option<&str>, body: Value) {
        server.mock(|when, then| {
            let when = when.method(GET).path("/api/v3/projects");
            if let Some(name) = filter {
                when.query_param(
                    "filters",
                    json!([{"name_and_identifier": {"operator": "=", "values": [name]}}])
                        .to_string(),
                );
            }
            then.status(200)
                .json_body(json!({"_type": "Collection", "_embedded": {"elements": body}}));
        });
    }

    fn types(server: &MockServer, project: u64, body: Value) {
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/api/v3/projects/{}/types", project));
            then.status(200)
                .json_body(json!({"_type": "Collection", "_embedded": {"elements": body}}));
        });
    }

    #[test]
    fn bug_id_from_all_url_shapes() {
        let op = openproject("http://bugtracker.kiwitcms.org");
        for url in &[
            "http://bugtracker.kiwitcms.org/work_packages/8",
            "http://bugtracker.kiwitcms.org/work_packages/8/activity",
            "http://bugtracker.kiwitcms.org/projects/demo-project/work_packages/8",
            "http://bugtracker.kiwitcms.org/projects/demo-project/work_packages/8/activity",
        ] {
            assert_eq!(op.bug_id_from_url(url).unwrap(), BugRef::new(8), "{}", url);
        }
        assert_matches!(
            op.bug_id_from_url("http://bugtracker.kiwitcms.org/projects/demo-project"),
            Err(Error::BugUrl(_))
        );
    }

    #[test]
    fn details_title_contains_status_and_type() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v3/work_packages/8")
                .header("Authorization", AUTH);
            then.status(200).json_body(json!({
                "id": 8,
                "subject": "Setup conference website",
                "description": {"format": "markdown", "raw": "", "html": ""},
                "_embedded": {"status": {"name": "New"}, "type": {"name": "Task"}},
                "_links": {"status": {"title": "New"}, "type": {"title": "Task"}}
            }));
        });
        let url = format!("{}/projects/demo-project/work_packages/8/activity", server.base_url());
        let issue = openproject(&server.base_url()).details(&url).unwrap();
        assert_eq!(
            issue,
            Issue {
                id: 8,
                title: "NEW TASK: Setup conference website".into(),
                description: "".into(),
                status: "New".into(),
                url,
            }
        );
        m.assert();
    }

    #[test]
    fn project_by_name_match() {
        let server = MockServer::start();
        projects(
            &server,
            Some("demo-project"),
            json!([{"id": 1, "identifier": "demo-project", "name": "Demo project"}]),
        );
        let op = openproject(&server.base_url());
        let api = op.rpc().unwrap();
        assert_eq!(
            op.get_project_by_name(&api, "demo-project").unwrap().name,
            "Demo project"
        );
    }

    #[test]
    fn project_by_name_fallback_to_first() {
        let server = MockServer::start();
        projects(&server, Some("Non Existent Project"), json!([]));
        projects(
            &server,
            None,
            json!([
                {"id": 2, "identifier": "your-scrum-project", "name": "Scrum project"},
                {"id": 1, "identifier": "demo-project", "name": "Demo project"},
            ]),
        );
        let op = openproject(&server.base_url());
        let api = op.rpc().unwrap();
        assert_eq!(
            op.get_project_by_name(&api, "Non Existent Project")
                .unwrap()
                .name,
            "Scrum project"
        );
    }

    #[test]
    fn project_by_name_none_visible() {
        let server = MockServer::start();
        projects(&server, Some("Demo"), json!([]));
        projects(&server, None, json!([]));
        let op = openproject(&server.base_url());
        let api = op.rpc().unwrap();
        assert_matches!(op.get_project_by_name(&api, "Demo"), Err(Error::NotFound(_)));
    }

    #[test]
    fn workpackage_type_selection() {
        let server = MockServer::start();
        types(
            &server,
            2,
            json!([{"id": 1, "name": "Task"}, {"id": 7, "name": "Bug"}]),
        );
        types(&server, 1, json!([{"id": 1, "name": "Task"}, {"id": 2, "name": "Milestone"}]));
        types(&server, 99, json!([]));
        let op = openproject(&server.base_url());
        let api = op.rpc().unwrap();
        assert_eq!(op.get_workpackage_type(&api, 2, "Bug").unwrap().name, "Bug");
        assert_eq!(op.get_workpackage_type(&api, 1, "Bug").unwrap().name, "Task");
        let err = op.get_workpackage_type(&api, 99, "Bug").unwrap_err();
        assert_eq!(err.to_string(), "WorkPackage Type not found");
    }

    #[test]
    fn file_issue_with_configured_type() {
        let server = MockServer::start();
        projects(
            &server,
            Some("Demo project"),
            json!([{"id": 1, "identifier": "demo-project", "name": "Demo project"}]),
        );
        types(
            &server,
            1,
            json!([{"id": 1, "name": "Task"}, {"id": 5, "name": "Epic"}]),
        );
        let e = execution();
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v3/projects/1/work_packages")
                .header("Authorization", AUTH)
                .json_body(json!({
                    "subject": e.summary(),
                    "description": {"format": "markdown", "raw": e.report("tester").to_string()},
                    "_links": {"type": {"href": "/api/v3/types/5", "title": "Epic"}}
                }));
            then.status(201).json_body(json!({
                "id": 21,
                "subject": e.summary(),
                "description": {"format": "markdown", "raw": "x", "html": "<p>x</p>"},
                "_links": {"status": {"title": "New"}, "type": {"title": "Epic"}}
            }));
        });
        let op = OpenProject::new(
            TrackerConfig {
                workpackage_type: "Epic".into(),
                ..TrackerConfig::new(TrackerKind::OpenProject, server.base_url())
            },
            Credentials::new("", "secret"),
            Arc::new(LinkReferences::new()),
        );
        let (issue, url) = op.file_issue(&e, "tester").unwrap();
        assert_eq!(url, format!("{}/work_packages/21", server.base_url()));
        assert_eq!(issue.status, "New");
        assert_eq!(issue.description, "<p>x</p>");
        assert_eq!(op.bug_id_from_url(&url).unwrap().id, 21);
        create.assert();
    }

    #[test]
    fn comments_are_activities_with_text() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/work_packages/8/activities");
            then.status(200).json_body(json!({"count": 3, "_embedded": {"elements": [
                {"id": 1, "_type": "Activity", "comment": {"format": "markdown", "raw": ""}},
                {"id": 2, "_type": "Activity::Comment", "comment": {"format": "markdown", "raw": "first"}},
                {"id": 3, "_type": "Activity::Comment", "comment": {"format": "markdown", "raw": "second"}},
            ]}}));
        });
        let add = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v3/work_packages/8/activities")
                .json_body(json!({"comment": {"raw": "third"}}));
            then.status(201).json_body(json!({
                "id": 4, "_type": "Activity::Comment", "comment": {"format": "markdown", "raw": "third"}
            }));
        });
        let op = openproject(&server.base_url());
        let bug = BugRef::new(8);
        let texts: Vec<String> = op.comments(&bug).unwrap().into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["first", "second"]);
        let c = op.rpc().unwrap().add_comment(&bug, "third").unwrap();
        assert_eq!(c.id, 4);
        add.assert();
    }

    #[test]
    fn delete_comment_unsupported() {
        let op = openproject("http://openproject.example.com");
        assert_matches!(
            op.rpc().unwrap().delete_comment(&BugRef::new(8), 1),
            Err(Error::Unsupported { .. })
        );
    }

    #[test]
    fn disabled_and_fallback() {
        let op = OpenProject::new(
            TrackerConfig::new(TrackerKind::OpenProject, "http://op.example.com/"),
            Credentials::default(),
            Arc::new(LinkReferences::new()),
        );
        assert!(op.is_adding_testcase_to_issue_disabled());
        assert_eq!(
            op.new_issue_url(&execution()),
            "http://op.example.com/work_packages/new"
        );
        assert!(!openproject("http://op.example.com").is_adding_testcase_to_issue_disabled());
    }
}
