#[macro_use]
extern crate log;

use trackers::credentials::{CredentialStore, UserCredential};
use trackers::{connect, IssueTracker, LinkReferences, TrackerConfig, TrackerKind};

use anyhow::{bail, Context, Error};
use colored::*;
use env_logger::Env;
use std::fs;
use std::io::stdout;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    rename_all = "kebab",
    after_help = "\
    Set RUST_LOG=trackers=debug in the environment to get full logging output.
    "
)]
pub struct Opt {
    /// Tracker product: mantis, openproject or trac
    #[structopt(short = "t", long = "type", global = true, env = "TRACKER_TYPE")]
    kind: Option<TrackerKind>,
    /// Base URL of the tracker instance
    #[structopt(short, long, global = true, value_name = "URL", env = "TRACKER_URL")]
    url: Option<String>,
    /// System API username
    #[structopt(long, global = true, env = "TRACKER_USERNAME", hide_env_values = true)]
    username: Option<String>,
    /// System API password or token
    #[structopt(long, global = true, env = "TRACKER_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Don't verify TLS certificates
    #[structopt(short = "k", long, global = true)]
    insecure: bool,
    /// OpenProject work package type for new issues
    #[structopt(
        long,
        global = true,
        value_name = "NAME",
        env = "OPENPROJECT_WORKPACKAGE_TYPE_NAME",
        default_value = "Bug"
    )]
    workpackage_type: String,
    /// JSON file with per-user API tokens
    #[structopt(short, long, global = true, value_name = "FILE", parse(from_os_str))]
    credentials: Option<PathBuf>,
    /// Act on behalf of this user (looks up their token in the credentials file)
    #[structopt(long, global = true, value_name = "OWNER")]
    user: Option<String>,
    #[structopt(subcommand)]
    command: Cmd,
}

#[derive(Debug, Clone, StructOpt)]
pub enum Cmd {
    /// Shows the normalized issue behind URL.
    Details {
        #[structopt(value_name = "URL")]
        url: String,
    },
    /// Lists comments of the issue behind URL.
    Comments {
        #[structopt(value_name = "URL")]
        url: String,
    },
    /// Tells whether test executions will be commented on issues.
    Check,
}

impl Opt {
    fn config(&self) -> Result<TrackerConfig> {
        let kind = match self.kind {
            Some(k) => k,
            None => bail!("No tracker type given either as option or via TRACKER_TYPE"),
        };
        let url = match &self.url {
            Some(u) => u,
            None => bail!("No tracker URL given either as option or via TRACKER_URL"),
        };
        let mut config = TrackerConfig::new(kind, url.as_str()).with_credentials(
            self.username.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default(),
        );
        config.workpackage_type = self.workpackage_type.clone();
        if self.insecure {
            config = config.insecure();
        }
        Ok(config)
    }

    fn store(&self) -> Result<Vec<UserCredential>> {
        match &self.credentials {
            Some(path) => {
                let f = fs::File::open(path)
                    .with_context(|| format!("Cannot open credentials file {}", path.display()))?;
                Ok(serde_json::from_reader(f)
                    .with_context(|| format!("Cannot parse credentials file {}", path.display()))?)
            }
            None => Ok(vec![]),
        }
    }

    fn tracker(&self) -> Result<Arc<dyn IssueTracker>> {
        let config = self.config()?;
        let store = self.store()?;
        if self.user.is_some() && self.credentials.is_none() {
            warn!("--user given without --credentials, using system credentials");
        }
        info!("Connecting to {} at {}", config.kind, config.base().green());
        Ok(connect(
            config,
            self.user.as_deref(),
            &store as &dyn CredentialStore,
            Arc::new(LinkReferences::new()),
        ))
    }
}

fn details(tracker: &dyn IssueTracker, url: &str) -> Result<()> {
    let issue = tracker
        .details(url)
        .with_context(|| format!("Failed to fetch issue {}", url))?;
    serde_json::to_writer_pretty(stdout().lock(), &issue).context("broken pipe")?;
    println!();
    Ok(())
}

fn comments(tracker: &dyn IssueTracker, url: &str) -> Result<()> {
    let bug = tracker.bug_id_from_url(url)?;
    let comments = tracker
        .comments(&bug)
        .with_context(|| format!("Failed to fetch comments of {}", url))?;
    info!("{} comment(s)", comments.len().to_string().yellow());
    serde_json::to_writer_pretty(stdout().lock(), &comments).context("broken pipe")?;
    println!();
    Ok(())
}

fn check(tracker: &dyn IssueTracker) {
    if tracker.is_adding_testcase_to_issue_disabled() {
        println!(
            "{}: adding test cases to issues is {}",
            tracker.kind(),
            "disabled".red().bold()
        );
    } else {
        println!(
            "{}: adding test cases to issues is {}",
            tracker.kind(),
            "enabled".green().bold()
        );
    }
}

fn run() -> Result<()> {
    dotenv::dotenv().ok();
    let opt = Opt::from_args();
    let tracker = opt.tracker()?;
    match opt.command {
        Cmd::Details { ref url } => details(tracker.as_ref(), url),
        Cmd::Comments { ref url } => comments(tracker.as_ref(), url),
        Cmd::Check => {
            check(tracker.as_ref());
            Ok(())
        }
    }
}

fn main() {
    env_logger::from_env(Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        for e in err.chain() {
            error!("{}", e);
            // reqwest seems to fold all causes into its head error
            if e.downcast_ref::<reqwest::Error>().is_some() {
                break;
            }
        }
        std::process::exit(1);
    }
}
