//! Posts "confirmed via test execution" comments off the caller's thread.

use crate::execution::Execution;
use crate::tracker::{chain, BugRef, Comment, Error, IssueTracker, Result};

use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;

/// Handle to a comment post running in the background. Dropping it detaches the post.
#[derive(Debug)]
pub struct Pending {
    rx: Receiver<Result<Comment>>,
}

impl Pending {
    /// Blocks until the post has completed
    pub fn wait(self) -> Result<Comment> {
        self.rx.recv().map_err(|_| Error::Background)?
    }
}

/// Runs `post_comment` on a thread of its own, so that posts never queue behind each other.
/// Failures are logged since nobody needs to wait on the result.
pub fn post_in_background(
    tracker: Arc<dyn IssueTracker>,
    execution: Execution,
    bug: BugRef,
) -> Pending {
    let (tx, rx) = channel();
    let name = format!("comment-TE-{}", execution.id);
    let spawned = thread::Builder::new().name(name).spawn(move || {
        let res = tracker.post_comment(&execution, &bug);
        match &res {
            Ok(c) => debug!(
                "{}: TE-{} commented on #{} ({})",
                tracker.kind(),
                execution.id,
                bug.id,
                c.id
            ),
            Err(e) => error!(
                "{}: cannot comment TE-{} on #{}: {}",
                tracker.kind(),
                execution.id,
                bug.id,
                chain(e)
            ),
        }
        // receiver may be gone already
        tx.send(res).ok();
    });
    // a failed spawn drops the sender, `wait` then reports `Error::Background`
    if let Err(e) = spawned {
        error!("Cannot start background comment post: {}", e);
    }
    Pending { rx }
}

/// Links `executions` to the issue at `url` and comments on it once per execution.
///
/// Link references are recorded synchronously. Comments are skipped when the tracker has adding
/// test cases disabled.
pub fn add_testexecution_to_issue(
    tracker: &Arc<dyn IssueTracker>,
    executions: Vec<Execution>,
    url: &str,
) -> Result<Vec<Pending>> {
    let bug = tracker.bug_id_from_url(url)?;
    for e in &executions {
        tracker
            .links()
            .record(e.id, url, true)
            .map_err(Error::Link)?;
    }
    if tracker.is_adding_testcase_to_issue_disabled() {
        info!("{}: adding test cases to issues disabled", tracker.kind());
        return Ok(vec![]);
    }
    Ok(executions
        .into_iter()
        .map(|e| post_in_background(Arc::clone(tracker), e, bug.clone()))
        .collect())
}

// === Tests ===
