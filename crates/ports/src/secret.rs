//! Secret provider port.

use async_trait::async_trait;
use std::sync::Arc;

use hodei_runner_core::{Build, Repo};

/// Request context for a secret lookup.
#[derive(Debug, Clone, Default)]
pub struct SecretRequest {
    pub name: String,
    pub build: Build,
    pub repo: Repo,
}

/// Resolves named secrets for a pipeline. Lookups that find nothing
/// return `Ok(None)`; providers reserve errors for transport failures.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn find(&self, req: &SecretRequest) -> Result<Option<String>, String>;
}

/// Combines providers; the first provider that yields a value wins.
pub struct CombineSecrets {
    providers: Vec<Arc<dyn SecretProvider>>,
}

impl CombineSecrets {
    pub fn new(providers: Vec<Arc<dyn SecretProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl SecretProvider for CombineSecrets {
    async fn find(&self, req: &SecretRequest) -> Result<Option<String>, String> {
        for provider in &self.providers {
            if let Some(value) = provider.find(req).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}
