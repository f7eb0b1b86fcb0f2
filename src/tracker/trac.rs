//! Trac ticket JSON-RPC interface (trac-ticketrpc plugin, Trac 1.6 and above).
//!
//! Every call runs in a fresh HTTP session: a GET to `/{project}/login` first obtains the session
//! cookie, the RPC POST to `/{project}/ticketrpc` follows. Without the session the plugin cannot
//! determine ticket permissions even if Basic-Auth credentials are valid.

use super::{build, decode, user_agent, Api, BugRef, Comment, Error, Issue, IssueTracker, Result};
use crate::config::{TrackerConfig, TrackerKind};
use crate::credentials::Credentials;
use crate::execution::Execution;
use crate::links::LinkSink;

use reqwest::blocking::Client;
use reqwest::header::*;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Ticket {
    pub id: u64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
}

impl Ticket {
    fn normalize(self, url: String) -> Issue {
        Issue {
            id: self.id,
            title: self.summary,
            description: self.description,
            status: self.status,
            url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTicket {
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: String,
    pub summary: String,
    pub description: String,
    pub project: String,
    pub version: String,
    pub component: String,
}

impl NewTicket {
    /// Defect of major priority, filed against the product's project and component
    pub fn defect(product: &str, version: &str, summary: String, description: String) -> Self {
        Self {
            kind: "defect".into(),
            priority: "major".into(),
            summary,
            description,
            project: product.to_owned(),
            version: version.to_owned(),
            component: product.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TracComment {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    text: String,
}

impl From<TracComment> for Comment {
    fn from(c: TracComment) -> Self {
        Comment {
            id: c.id,
            text: c.text,
        }
    }
}

/// `ticket.comments` answers either with a bare list or wrapped into `{"comments": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum CommentList {
    Bare(Vec<TracComment>),
    Wrapped { comments: Vec<TracComment> },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

fn rpc_message(error: Option<Value>) -> String {
    match error {
        Some(Value::Object(o)) => match o.get("message") {
            Some(Value::String(m)) => m.clone(),
            _ => Value::Object(o).to_string(),
        },
        Some(Value::String(s)) => s,
        Some(v) if !v.is_null() => v.to_string(),
        _ => "empty result".to_owned(),
    }
}

fn project(bug: &BugRef) -> Result<&str> {
    bug.project.as_deref().ok_or(Error::NoProject(Some(bug.id)))
}

#[derive(Debug, Clone)]
pub struct TracApi {
    base_url: String,
    creds: Credentials,
    verify_ssl: bool,
}

impl TracApi {
    pub fn new(base_url: &str, creds: Credentials, verify_ssl: bool) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            creds,
            verify_ssl,
        }
    }

    fn session(&self) -> Result<Client> {
        let mut h = HeaderMap::new();
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        h.insert(USER_AGENT, user_agent().parse()?);
        build(Client::builder().cookie_store(true), self.verify_ssl, h)
    }

    /// Invokes a JSON-RPC method. `params` must contain the Trac `project`.
    pub fn invoke_method(&self, method: &str, params: &Value) -> Result<Value> {
        let project = match params.get("project").and_then(Value::as_str) {
            Some(p) if !p.is_empty() => p,
            _ => return Err(Error::NoProject(params.get("id").and_then(Value::as_u64))),
        };
        let session = self.session()?;
        let login = format!("{}/{}/login", self.base_url, project);
        debug!("GET {}", login);
        let res = session
            .get(&login)
            .basic_auth(&self.creds.username, Some(&self.creds.password))
            .send()?;
        if res.status() != StatusCode::OK {
            return Err(Error::status(&login, res.status()));
        }
        let url = format!("{}/{}/ticketrpc", self.base_url, project);
        debug!("POST {} ({})", url, method);
        let req = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": Uuid::new_v4().to_string(),
        });
        let res = session
            .post(&url)
            .basic_auth(&self.creds.username, Some(&self.creds.password))
            .json(&req)
            .send()?;
        if res.status() != StatusCode::OK {
            return Err(Error::status(&url, res.status()));
        }
        let env: Envelope = decode(res)?;
        match env.result {
            Some(v) if !v.is_null() => Ok(v),
            _ => Err(Error::Rpc {
                method: method.to_owned(),
                message: rpc_message(env.error),
            }),
        }
    }

    fn call<T: serde::de::DeserializeOwned>(&self, method: &str, params: &Value) -> Result<T> {
        let v = self.invoke_method(method, params)?;
        serde_json::from_value(v.clone()).map_err(|e| Error::Api {
            res: v.to_string(),
            e,
        })
    }

    pub fn close_issue(&self, bug: &BugRef, resolution: &str, text: &str) -> Result<Value> {
        self.invoke_method(
            "ticket.close",
            &json!({
                "id": bug.id,
                "project": project(bug)?,
                "resolution": resolution,
                "text": text,
            }),
        )
    }
}

impl Api for TracApi {
    type Issue = Ticket;
    type NewIssue = NewTicket;

    fn get_issue(&self, bug: &BugRef) -> Result<Ticket> {
        self.call(
            "ticket.details",
            &json!({"id": bug.id, "project": project(bug)?}),
        )
    }

    fn create_issue(&self, fields: &NewTicket) -> Result<Ticket> {
        let params = serde_json::to_value(fields).map_err(Error::Encode)?;
        self.call("ticket.create", &params)
    }

    fn update_issue(&self, bug: &BugRef, fields: &Value) -> Result<Value> {
        let mut params = json!({"id": bug.id, "project": project(bug)?});
        if let (Some(p), Some(f)) = (params.as_object_mut(), fields.as_object()) {
            for (k, v) in f {
                p.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        self.invoke_method("ticket.update", &params)
    }

    fn get_comments(&self, bug: &BugRef) -> Result<Vec<Comment>> {
        let list: CommentList = self.call(
            "ticket.comments",
            &json!({"id": bug.id, "project": project(bug)?}),
        )?;
        let comments = match list {
            CommentList::Bare(c) | CommentList::Wrapped { comments: c } => c,
        };
        Ok(comments.into_iter().map(Comment::from).collect())
    }

    fn add_comment(&self, bug: &BugRef, text: &str) -> Result<Comment> {
        let v = self.invoke_method(
            "ticket.add_comment",
            &json!({"text": text, "id": bug.id, "project": project(bug)?}),
        )?;
        // some plugin versions only acknowledge the call
        let c: TracComment = if v.is_object() {
            serde_json::from_value(v.clone()).map_err(|e| Error::Api {
                res: v.to_string(),
                e,
            })?
        } else {
            TracComment::default()
        };
        Ok(Comment {
            text: if c.text.is_empty() {
                text.to_owned()
            } else {
                c.text
            },
            id: c.id,
        })
    }

    fn delete_comment(&self, bug: &BugRef, comment_id: u64) -> Result<()> {
        self.invoke_method(
            "ticket.delete_comment",
            &json!({"id": bug.id, "project": project(bug)?, "comment_id": comment_id}),
        )?;
        Ok(())
    }
}

/// Trac facade. The Trac project name must match the product name.
///
/// Needs `api_username` and `api_password` with permissions TICKET_CREATE, TICKET_APPEND and
/// TICKET_VIEW.
pub struct Trac {
    config: TrackerConfig,
    creds: Credentials,
    links: Arc<dyn LinkSink>,
}

impl Trac {
    pub fn new(config: TrackerConfig, creds: Credentials, links: Arc<dyn LinkSink>) -> Self {
        Self {
            config,
            creds,
            links,
        }
    }

    pub fn rpc(&self) -> TracApi {
        TracApi::new(
            self.config.base(),
            self.creds.clone(),
            self.config.verify_ssl,
        )
    }

    fn issue_url(&self, project: &str, id: u64) -> String {
        format!("{}/{}/ticket/{}", self.config.base(), project, id)
    }
}

impl IssueTracker for Trac {
    fn kind(&self) -> TrackerKind {
        TrackerKind::Trac
    }

    fn links(&self) -> &dyn LinkSink {
        self.links.as_ref()
    }

    /// `https://trac.example.com/myproject/ticket/123` → ticket 123 in `myproject`
    fn bug_id_from_url(&self, url: &str) -> Result<BugRef> {
        let parts: Vec<&str> = url.trim().trim_end_matches('/').split('/').collect();
        if parts.len() < 3 {
            return Err(Error::BugUrl(url.to_owned()));
        }
        let id = parts[parts.len() - 1]
            .parse()
            .map_err(|_| Error::BugUrl(url.to_owned()))?;
        Ok(BugRef::in_project(id, parts[parts.len() - 3]))
    }

    fn details(&self, url: &str) -> Result<Issue> {
        let bug = self.bug_id_from_url(url)?;
        let ticket = self.rpc().get_issue(&bug)?;
        Ok(ticket.normalize(url.to_owned()))
    }

    fn file_issue(&self, execution: &Execution, reporter: &str) -> Result<(Issue, String)> {
        let ticket = self.rpc().create_issue(&NewTicket::defect(
            &execution.product,
            &execution.version,
            execution.summary(),
            execution.report(reporter).to_string(),
        ))?;
        let url = self.issue_url(&execution.product, ticket.id);
        Ok((ticket.normalize(url.clone()), url))
    }

    fn new_issue_url(&self, execution: &Execution) -> String {
        format!("{}/{}/newticket", self.config.base(), execution.product)
    }

    fn post_comment(&self, execution: &Execution, bug: &BugRef) -> Result<Comment> {
        let bug = match bug.project {
            Some(_) => bug.clone(),
            None => BugRef::in_project(bug.id, execution.product.as_str()),
        };
        self.rpc().add_comment(&bug, &execution.comment_text())
    }

    fn comments(&self, bug: &BugRef) -> Result<Vec<Comment>> {
        self.rpc().get_comments(bug)
    }

    fn is_adding_testcase_to_issue_disabled(&self) -> bool {
        self.config.base().is_empty()
            || self.creds.username.is_empty()
            || self.creds.password.is_empty()
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
    use lazy_static::lazy_static;
    use std::collections::HashSet;
    use std::sync::Mutex;

    // base64("tester:tester")
    const AUTH: &str = "Basic dGVzdGVyOnRlc3Rlcg==";

    lazy_static! {
        static ref REQUEST_IDS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
    }

    /// Remembers the JSON-RPC request id, accepts only UUIDs
    fn record_id(req: &HttpMockRequest) -> bool {
        let id = req
            .body
            .as_ref()
            .and_then(|b| serde_json::from_slice::<Value>(b).ok())
            .and_then(|v| v["id"].as_str().map(str::to_owned));
        match id {
            Some(id) if Uuid::parse_str(&id).is_ok() => {
                REQUEST_IDS.lock().unwrap().insert(id);
                true
            }
            _ => false,
        }
    }

    fn trac(base_url: &str) -> Trac {
        Trac::new(
            TrackerConfig::new(TrackerKind::Trac, base_url),
            Credentials::new("tester", "tester"),
            Arc::new(LinkReferences::new()),
        )
    }

    fn login<'a>(server: &'a MockServer, project: &str) -> httpmock::Mock<'a> {
        let path = format!("/{}/login", project);
        server.mock(|when, then| {
            when.method(GET).path(path).header("Authorization", AUTH);
            then.status(200)
                .header("Set-Cookie", "trac_auth=0123abcd; Path=/")
                .body("logged in");
        })
    }

    fn rpc<'a>(
        server: &'a MockServer,
        project: &str,
        method: &str,
        result: Value,
    ) -> httpmock::Mock<'a> {
        let path = format!("/{}/ticketrpc", project);
        let partial = json!({"jsonrpc": "2.0", "method": method}).to_string();
        server.mock(|when, then| {
            when.method(POST)
                .path(path)
                .header("Authorization", AUTH)
                .header("Cookie", "trac_auth=0123abcd")
                .json_body_partial(partial);
            then.status(200)
                .json_body(json!({"jsonrpc": "2.0", "id": "1", "result": result, "error": null}));
        })
    }

    #[test]
    fn bug_info_from_url() {
        let t = trac("http://trac.example.com");
        assert_eq!(
            t.bug_id_from_url("http://trac.example.com/demo/ticket/123")
                .unwrap(),
            BugRef::in_project(123, "demo")
        );
        assert_eq!(
            t.bug_id_from_url("http://trac.example.com/demo/ticket/123/")
                .unwrap(),
            BugRef::in_project(123, "demo")
        );
        assert_matches!(t.bug_id_from_url("123"), Err(Error::BugUrl(_)));
        assert_matches!(
            t.bug_id_from_url("http://trac.example.com/demo/newticket"),
            Err(Error::BugUrl(_))
        );
    }

    #[test]
    fn login_precedes_rpc() {
        let server = MockServer::start();
        let login = login(&server, "demo");
        let details = rpc(
            &server,
            "demo",
            "ticket.details",
            json!({"id": 7, "summary": "Smoke test failed", "description": "Something went wrong", "status": "new"}),
        );
        let url = format!("{}/demo/ticket/7", server.base_url());
        let issue = trac(&server.base_url()).details(&url).unwrap();
        assert_eq!(
            issue,
            Issue {
                id: 7,
                title: "Smoke test failed".into(),
                description: "Something went wrong".into(),
                status: "new".into(),
                url,
            }
        );
        login.assert();
        details.assert();
    }

    #[test]
    fn failed_login_skips_rpc() {
        let server = MockServer::start();
        let login = server.mock(|when, then| {
            when.method(GET).path("/demo/login");
            then.status(401);
        });
        let call = server.mock(|when, then| {
            when.method(POST).path("/demo/ticketrpc");
            then.status(200).json_body(json!({"result": {}}));
        });
        let err = trac(&server.base_url())
            .rpc()
            .invoke_method("ticket.details", &json!({"id": 1, "project": "demo"}))
            .unwrap_err();
        assert_eq!(
            crate::tracker::error_record(&err),
            json!({"error": "401: Unauthorized"})
        );
        login.assert();
        call.assert_hits(0);
    }

    #[test]
    fn rpc_error_envelope() {
        let server = MockServer::start();
        login(&server, "demo");
        server.mock(|when, then| {
            when.method(POST).path("/demo/ticketrpc");
            then.status(200).json_body(json!({
                "jsonrpc": "2.0", "id": "1", "result": null,
                "error": {"code": -32602, "message": "Ticket 99 does not exist."}
            }));
        });
        let err = trac(&server.base_url())
            .rpc()
            .get_issue(&BugRef::in_project(99, "demo"))
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(
            err.to_string(),
            "JSON-RPC call ticket.details failed: Ticket 99 does not exist."
        );
    }

    #[test]
    fn request_ids_differ_per_call() {
        let server = MockServer::start();
        login(&server, "demo");
        let call = server.mock(|when, then| {
            when.method(POST).path("/demo/ticketrpc").matches(record_id);
            then.status(200).json_body(json!({"result": {"id": 1}}));
        });
        let api = trac(&server.base_url()).rpc();
        let params = json!({"id": 1, "project": "demo"});
        api.invoke_method("ticket.details", &params).unwrap();
        api.invoke_method("ticket.details", &params).unwrap();
        call.assert_hits(2);
        assert_eq!(REQUEST_IDS.lock().unwrap().len(), 2);
    }

    #[test]
    fn project_required_before_any_request() {
        let server = MockServer::start();
        let any = server.mock(|when, then| {
            when.path_contains("login");
            then.status(200);
        });
        let err = trac(&server.base_url())
            .rpc()
            .invoke_method("ticket.details", &json!({"id": 1}))
            .unwrap_err();
        assert_matches!(err, Error::NoProject(Some(1)));
        let err = trac(&server.base_url())
            .rpc()
            .invoke_method("ticket.create", &json!({"project": ""}))
            .unwrap_err();
        assert_eq!(err.to_string(), "No Trac project known");
        any.assert_hits(0);
    }

    #[test]
    fn add_comment_result_shapes() {
        let server = MockServer::start();
        login(&server, "demo");
        rpc(&server, "demo", "ticket.add_comment", json!(true));
        let c = trac(&server.base_url())
            .rpc()
            .add_comment(&BugRef::in_project(7, "demo"), "hello")
            .unwrap();
        assert_eq!(c, Comment { id: 0, text: "hello".into() });

        let server = MockServer::start();
        login(&server, "demo");
        rpc(&server, "demo", "ticket.add_comment", json!({"id": "x"}));
        assert_matches!(
            trac(&server.base_url())
                .rpc()
                .add_comment(&BugRef::in_project(7, "demo"), "hello"),
            Err(Error::Api { .. })
        );
    }

    #[test]
    fn file_issue_creates_defect() {
        let server = MockServer::start();
        let mut e = execution();
        e.product = "demo".into();
        login(&server, "demo");
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/demo/ticketrpc")
                .json_body_partial(
                    json!({
                        "method": "ticket.create",
                        "params": {
                            "type": "defect",
                            "priority": "major",
                            "summary": e.summary(),
                            "project": "demo",
                            "component": "demo",
                            "version": "unspecified",
                        }
                    })
                    .to_string(),
                );
            then.status(200).json_body(json!({"result": {
                "id": 11, "summary": e.summary(), "description": "...", "status": "new"
            }}));
        });
        let t = trac(&server.base_url());
        let (issue, url) = t.file_issue(&e, "tester").unwrap();
        assert_eq!(url, format!("{}/demo/ticket/11", server.base_url()));
        assert_eq!(issue.id, 11);
        create.assert();
    }

    #[test]
    fn comments_in_both_shapes() {
        let server = MockServer::start();
        login(&server, "demo");
        rpc(
            &server,
            "demo",
            "ticket.comments",
            json!({"comments": [{"id": 1, "text": "a"}, {"id": 2, "text": "b"}]}),
        );
        let t = trac(&server.base_url());
        let c = t.comments(&BugRef::in_project(7, "demo")).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c[1].text, "b");

        let server = MockServer::start();
        login(&server, "demo");
        rpc(&server, "demo", "ticket.comments", json!([{"id": 3, "text": "c"}]));
        let t = trac(&server.base_url());
        let c = t.comments(&BugRef::in_project(7, "demo")).unwrap();
        assert_eq!(c, vec![Comment { id: 3, text: "c".into() }]);
    }

    #[test]
    fn post_comment_falls_back_to_product_project() {
        let server = MockServer::start();
        let mut e = execution();
        e.product = "demo".into();
        login(&server, "demo");
        let add = rpc(
            &server,
            "demo",
            "ticket.add_comment",
            json!({"id": 5, "text": e.comment_text()}),
        );
        let c = trac(&server.base_url())
            .post_comment(&e, &BugRef::new(7))
            .unwrap();
        assert!(c.text.contains("Confirmed via test execution"));
        add.assert();
    }

    #[test]
    fn missing_project() {
        let t = trac("http://trac.example.com");
        assert_matches!(
            t.rpc().get_issue(&BugRef::new(3)),
            Err(Error::NoProject(Some(3)))
        );
    }

    #[test]
    fn disabled_without_username() {
        let t = Trac::new(
            TrackerConfig::new(TrackerKind::Trac, "http://trac.example.com"),
            Credentials::new("", "tester"),
            Arc::new(LinkReferences::new()),
        );
        assert!(t.is_adding_testcase_to_issue_disabled());
        assert!(!trac("http://trac.example.com").is_adding_testcase_to_issue_disabled());
        assert_eq!(
            t.new_issue_url(&execution()),
            "http://trac.example.com/Demo project/newticket"
        );
    }
}
