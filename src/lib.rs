//! Reports, inspects and comments on defects in external issue trackers (Mantis, OpenProject,
//! Trac) on behalf of a test management system.

#[macro_use]
extern crate log;

pub mod config;
pub mod credentials;
pub mod execution;
pub mod links;
pub mod poster;
pub mod tracker;

pub use crate::config::{TrackerConfig, TrackerKind};
pub use crate::credentials::{CredentialStore, Credentials, UserCredential};
pub use crate::execution::Execution;
pub use crate::links::{LinkReference, LinkReferences, LinkSink};
pub use crate::poster::{add_testexecution_to_issue, post_in_background, Pending};
pub use crate::tracker::{connect, BugRef, Comment, Issue, IssueTracker, Report};
