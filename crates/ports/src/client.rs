//! Coordinator client and status reporter ports.

use async_trait::async_trait;
use thiserror::Error;

use hodei_runner_core::{Build, Netrc, Repo, Stage, StageSecret, State, System};

#[derive(Error, Debug)]
pub enum ClientError {
    /// The stage was accepted by another runner first.
    #[error("optimistic lock error")]
    OptimisticLock,

    #[error("coordinator transport error: {0}")]
    Transport(String),
}

/// The full stage detail fetched after acceptance.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub build: Build,
    pub repo: Repo,
    pub stage: Stage,
    pub system: System,
    pub netrc: Netrc,
    pub secrets: Vec<StageSecret>,
    /// Raw pipeline configuration document.
    pub config: String,
}

/// Client for the central coordinator. Appears as an interface only; the
/// transport lives outside the core.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Claims ownership of the stage. Returns
    /// [`ClientError::OptimisticLock`] when another runner won the race.
    async fn accept(&self, stage: &Stage) -> Result<(), ClientError>;

    /// Fetches the full stage detail.
    async fn detail(&self, stage: &Stage) -> Result<StageContext, ClientError>;

    /// Blocks until the build is cancelled remotely. Resolves `true` on
    /// cancellation, `false` when watching ends without one.
    async fn watch(&self, build_id: i64) -> Result<bool, ClientError>;

    /// Pushes an updated stage record.
    async fn update(&self, stage: &Stage) -> Result<(), ClientError>;
}

/// Reports state transitions back to the coordinator.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report_stage(&self, state: &State) -> Result<(), ClientError>;

    async fn report_step(&self, state: &State, step_name: &str) -> Result<(), ClientError>;
}

/// Reporter that discards everything. Used by the exec subcommand and in
/// tests.
pub struct NopReporter;

#[async_trait]
impl Reporter for NopReporter {
    async fn report_stage(&self, _state: &State) -> Result<(), ClientError> {
        Ok(())
    }

    async fn report_step(&self, _state: &State, _step: &str) -> Result<(), ClientError> {
        Ok(())
    }
}
