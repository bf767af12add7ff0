//! Static providers.
//!
//! Environment-configured secret, registry and env providers. They back
//! the corresponding ports when no external plugin endpoint is
//! configured.

use async_trait::async_trait;
use std::collections::HashMap;

use hodei_runner_compiler::auths;
use hodei_runner_core::Auth;
use hodei_runner_ports::{
    EnvProvider, EnvRequest, EnvVariable, RegistryProvider, RegistryRequest, SecretProvider,
    SecretRequest,
};

/// Secrets sourced from the runner configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    secrets: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl SecretProvider for StaticSecrets {
    async fn find(&self, req: &SecretRequest) -> Result<Option<String>, String> {
        Ok(self.secrets.get(&req.name).cloned())
    }
}

/// Registry credentials parsed from a docker config file on disk.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    credentials: Vec<Auth>,
}

impl StaticRegistry {
    pub fn new(credentials: Vec<Auth>) -> Self {
        Self { credentials }
    }

    /// Loads credentials from a docker `config.json` path. A missing
    /// path yields an empty provider.
    pub fn from_file(path: &str) -> Self {
        if path.is_empty() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(data) => match auths::parse_docker_config(&data) {
                Ok(credentials) => Self { credentials },
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "cannot parse docker config");
                    Self::default()
                }
            },
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "cannot read docker config");
                Self::default()
            }
        }
    }
}

#[async_trait]
impl RegistryProvider for StaticRegistry {
    async fn list(&self, _req: &RegistryRequest) -> Result<Vec<Auth>, String> {
        Ok(self.credentials.clone())
    }
}

/// Global environment variables from the runner configuration. All
/// static variables are unmasked.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvs {
    envs: HashMap<String, String>,
}

impl StaticEnvs {
    pub fn new(envs: HashMap<String, String>) -> Self {
        Self { envs }
    }
}

#[async_trait]
impl EnvProvider for StaticEnvs {
    async fn list(&self, _req: &EnvRequest) -> Result<Vec<EnvVariable>, String> {
        Ok(self
            .envs
            .iter()
            .map(|(name, data)| EnvVariable {
                name: name.clone(),
                data: data.clone(),
                mask: false,
            })
            .collect())
    }
}
