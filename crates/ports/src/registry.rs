//! Registry credential provider port.

use async_trait::async_trait;

use hodei_runner_core::{Auth, Build, Repo};

#[derive(Debug, Clone, Default)]
pub struct RegistryRequest {
    pub build: Build,
    pub repo: Repo,
}

/// Lists registry credentials usable to pull private images.
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    async fn list(&self, req: &RegistryRequest) -> Result<Vec<Auth>, String>;
}
