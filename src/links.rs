//! Link references between test executions and issue URLs.

use serde::Serialize;
use std::error::Error as StdError;
use std::sync::{Mutex, PoisonError};

pub type SinkError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkReference {
    pub execution: u64,
    pub url: String,
    pub is_defect: bool,
}

/// Receives link references for executions. `record` is get-or-create by (execution, url) and
/// returns whether a new reference was created.
pub trait LinkSink: Send + Sync {
    fn record(&self, execution: u64, url: &str, is_defect: bool) -> Result<bool, SinkError>;
}

/// In-process link reference store
#[derive(Debug, Default)]
pub struct LinkReferences {
    links: Mutex<Vec<LinkReference>>,
}

impl LinkReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_execution(&self, execution: u64) -> Vec<LinkReference> {
        let links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links
            .iter()
            .filter(|l| l.execution == execution)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LinkSink for LinkReferences {
    fn record(&self, execution: u64, url: &str, is_defect: bool) -> Result<bool, SinkError> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if links.iter().any(|l| l.execution == execution && l.url == url) {
            return Ok(false);
        }
        links.push(LinkReference {
            execution,
            url: url.to_owned(),
            is_defect,
        });
        Ok(true)
    }
}

// === Tests ===
