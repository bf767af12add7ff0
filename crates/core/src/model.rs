//! Coordinator-side records.
//!
//! These types mirror the records exchanged with the central coordinator:
//! the build, the repository, the stage assigned to this runner and the
//! system that produced them. They are inputs to the compiler and the
//! state machine; the runner never persists them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Build and step status tags.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const PASSING: &str = "success";
    pub const FAILING: &str = "failure";
    pub const ERROR: &str = "error";
    pub const KILLED: &str = "killed";
    pub const SKIPPED: &str = "skipped";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Build {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub parent: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub cron: String,
    #[serde(default)]
    pub link: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub deploy_to: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author_login: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub author_avatar: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub finished: i64,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, rename = "git_http_url")]
    pub http_url: String,
    #[serde(default, rename = "git_ssh_url")]
    pub ssh_url: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub trusted: bool,
    /// Stage timeout in minutes.
    #[serde(default)]
    pub timeout: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub build_id: i64,
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, rename = "type")]
    pub stage_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub stopped: i64,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StageStep>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageStep {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub step_id: i64,
    #[serde(default)]
    pub stage_id: i64,
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub stopped: i64,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub errignore: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default)]
    pub detached: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct System {
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub version: String,
}

/// Netrc credentials injected into clone and, optionally, build steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Netrc {
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
}

/// A named secret delivered with the stage detail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSecret {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub pull_request: bool,
}
