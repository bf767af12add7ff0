//! Container engine port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use hodei_runner_core::{CancelToken, Spec, Step};

use crate::logging::LogWriter;

/// Exit state of a single step run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunState {
    pub exited: bool,
    pub exit_code: i64,
    pub oom_killed: bool,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),

    #[error("cannot pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("container run failed: {0}")]
    Run(String),

    #[error("missing secrets: {}", .0.join(", "))]
    MissingSecrets(Vec<String>),

    #[error("canceled")]
    Canceled,

    #[error("engine unreachable: {0}")]
    Unreachable(String),
}

/// Engine abstracts the container runtime. Implementations create the
/// stage environment, run single steps while streaming output, and tear
/// everything down.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Creates the network and volumes declared by the spec and runs the
    /// internal setup steps. Errors here are fatal for the stage.
    async fn setup(&self, spec: &Spec) -> Result<(), EngineError>;

    /// Runs a single step to completion, streaming container output into
    /// the writer. Must not return before the stream is flushed, and must
    /// return an exited state with an accurate exit code.
    async fn run(
        &self,
        spec: &Spec,
        step: &Step,
        output: Arc<dyn LogWriter>,
        cancel: CancelToken,
    ) -> Result<RunState, EngineError>;

    /// Best-effort teardown of every container, volume and the network.
    /// Never fails the stage; implementations log and swallow errors.
    async fn destroy(&self, spec: &Spec) -> Result<(), EngineError>;

    /// Pings the underlying engine daemon.
    async fn ping(&self) -> Result<(), EngineError>;
}
