//! Global environment provider port.

use async_trait::async_trait;

use hodei_runner_core::{Build, Repo};

/// A provider-supplied global variable. Masked variables are additionally
/// registered as synthetic secrets so their values are redacted in logs.
#[derive(Debug, Clone, Default)]
pub struct EnvVariable {
    pub name: String,
    pub data: String,
    pub mask: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EnvRequest {
    pub build: Build,
    pub repo: Repo,
}

/// Lists environment variables that should be added to every pipeline
/// step by default.
#[async_trait]
pub trait EnvProvider: Send + Sync {
    async fn list(&self, req: &EnvRequest) -> Result<Vec<EnvVariable>, String>;
}
