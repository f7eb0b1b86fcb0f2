//! Test execution context from which defects are reported.
//!
//! This will be picked up by tracker/* to create a concrete issue or comment.

use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TestRun {
    pub id: u64,
    pub summary: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TestCase {
    pub id: u64,
    pub summary: String,
    /// Steps to reproduce, in Markdown
    #[serde(default)]
    pub text: String,
    pub url: String,
    #[serde(default)]
    pub components: Vec<String>,
}

/// Single run of a test case
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Execution {
    pub id: u64,
    pub url: String,
    pub run: TestRun,
    pub case: TestCase,
    pub product: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build: String,
}

impl Execution {
    /// Issue headline
    pub fn summary(&self) -> String {
        format!("Failed test: {}", self.case.summary)
    }

    /// Issue body filed on behalf of `reporter`
    pub fn report<'a>(&'a self, reporter: &'a str) -> Report<'a> {
        Report {
            execution: self,
            reporter,
        }
    }

    /// Comment posted when this execution gets linked to an existing issue
    pub fn comment_text(&self) -> String {
        format!(
            "Confirmed via test execution\n\
             TR-{}: {}\n\
             {}\n\
             TE-{}: {}",
            self.run.id, self.run.summary, self.run.url, self.id, self.case.summary
        )
    }
}

/// Rendered issue description.
///
/// Normal Display: only issue body
/// Alternate Display: headline + body
pub struct Report<'a> {
    execution: &'a Execution,
    reporter: &'a str,
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.execution;
        if f.alternate() {
            writeln!(f, "{}\n", e.summary())?;
        }
        writeln!(f, "Filed from execution {}\n", e.url)?;
        writeln!(f, "**Product:**\n{}\n", e.product)?;
        writeln!(f, "**Component(s):**\n{}\n", e.case.components.join(", "))?;
        writeln!(f, "**Version:**\n{}\n", e.version)?;
        writeln!(f, "**Build:**\n{}\n", e.build)?;
        writeln!(f, "**Test case:**\n{}\n", e.case.url)?;
        writeln!(f, "**Steps to reproduce:**\n{}\n", e.case.text)?;
        write!(f, "**Reporter:**\n{}", self.reporter)
    }
}

// === Tests ===
