//! Runner configuration.
//!
//! Every option is environment-named with a `DRONE_` prefix, loaded
//! through per-section `from_env` constructors. Legacy variable names
//! are rewritten in place before parsing.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("cannot read environment file {path}: {reason}")]
    EnvFile { path: String, reason: String },
}

// legacy environment variables. the key is the legacy variable name,
// the value is the current one.
const LEGACY: &[(&str, &str)] = &[
    ("DRONE_MACHINE", "DRONE_RUNNER_NAME"),
    ("DRONE_RUNNER_OS", "DRONE_PLATFORM_OS"),
    ("DRONE_RUNNER_ARCH", "DRONE_PLATFORM_ARCH"),
    ("DRONE_RUNNER_KERNEL", "DRONE_PLATFORM_KERNEL"),
    ("DRONE_RUNNER_VARIANT", "DRONE_PLATFORM_VARIANT"),
    ("DRONE_REGISTRY_ENDPOINT", "DRONE_REGISTRY_PLUGIN_ENDPOINT"),
    ("DRONE_REGISTRY_SECRET", "DRONE_REGISTRY_PLUGIN_TOKEN"),
    ("DRONE_REGISTRY_PLUGIN_SECRET", "DRONE_REGISTRY_PLUGIN_TOKEN"),
    (
        "DRONE_REGISTRY_SKIP_VERIFY",
        "DRONE_REGISTRY_PLUGIN_SKIP_VERIFY",
    ),
    ("DRONE_SECRET_ENDPOINT", "DRONE_SECRET_PLUGIN_ENDPOINT"),
    ("DRONE_SECRET_SECRET", "DRONE_SECRET_PLUGIN_TOKEN"),
    ("DRONE_SECRET_SKIP_VERIFY", "DRONE_SECRET_PLUGIN_SKIP_VERIFY"),
    ("DRONE_LIMIT_MEM_SWAP", "DRONE_MEMORY_SWAP_LIMIT"),
    ("DRONE_LIMIT_MEM", "DRONE_MEMORY_LIMIT"),
    ("DRONE_LIMIT_CPU_QUOTA", "DRONE_CPU_QUOTA"),
    ("DRONE_LIMIT_CPU_SHARES", "DRONE_CPU_SHARES"),
    ("DRONE_LIMIT_CPU_SET", "DRONE_CPU_SET"),
    ("DRONE_SERVER_PROTO", "DRONE_HTTP_PROTO"),
    ("DRONE_SERVER_HOST", "DRONE_HTTP_HOST"),
    ("DRONE_SERVER_PORT", "DRONE_HTTP_BIND"),
];

fn var(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn var_or(key: &str, default: &str) -> String {
    let value = var(key);
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn var_bool(key: &str) -> bool {
    matches!(var(key).to_lowercase().as_str(), "true" | "1" | "yes")
}

fn var_i64(key: &str) -> Result<i64, ConfigError> {
    let value = var(key);
    if value.is_empty() {
        return Ok(0);
    }
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

fn var_usize(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = var(key);
    if value.is_empty() {
        return Ok(default);
    }
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

fn var_list(key: &str) -> Vec<String> {
    var(key)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// comma-separated key:value pairs, e.g. "a:1,b:2".
fn var_map(key: &str) -> HashMap<String, String> {
    var_list(key)
        .into_iter()
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':').or_else(|| pair.split_once('='))?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Coordinator connection.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub host: String,
    pub proto: String,
    pub secret: String,
    pub skip_verify: bool,
    pub dump: bool,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            host: var("DRONE_RPC_HOST"),
            proto: var_or("DRONE_RPC_PROTO", "http"),
            secret: var("DRONE_RPC_SECRET"),
            skip_verify: var_bool("DRONE_RPC_SKIP_VERIFY"),
            dump: var_bool("DRONE_RPC_DUMP_HTTP"),
        }
    }

    pub fn address(&self) -> String {
        format!("{}://{}", self.proto, self.host)
    }
}

/// Local dashboard and delegate endpoint.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub bind: String,
    pub host: String,
    pub proto: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind: var_or("DRONE_HTTP_BIND", ":3000"),
            host: var("DRONE_HTTP_HOST"),
            proto: var_or("DRONE_HTTP_PROTO", "http"),
        }
    }

    /// The socket address to listen on; the drone convention uses a
    /// `:port` form.
    pub fn listen_addr(&self) -> String {
        if self.bind.starts_with(':') {
            format!("0.0.0.0{}", self.bind)
        } else {
            self.bind.clone()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub name: String,
    pub capacity: usize,
    pub max_procs: usize,
    pub environ: HashMap<String, String>,
    pub env_file: String,
    pub secrets: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub volumes: HashMap<String, String>,
    pub networks: Vec<String>,
    pub privileged_images: Vec<String>,
    pub clone_image: String,
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            name: var("DRONE_RUNNER_NAME"),
            capacity: var_usize("DRONE_RUNNER_CAPACITY", 2)?,
            max_procs: var_usize("DRONE_RUNNER_MAX_PROCS", 0)?,
            environ: var_map("DRONE_RUNNER_ENVIRON"),
            env_file: var("DRONE_RUNNER_ENV_FILE"),
            secrets: var_map("DRONE_RUNNER_SECRETS"),
            labels: var_map("DRONE_RUNNER_LABELS"),
            volumes: var_map("DRONE_RUNNER_VOLUMES"),
            networks: var_list("DRONE_RUNNER_NETWORKS"),
            privileged_images: var_list("DRONE_RUNNER_PRIVILEGED_IMAGES"),
            clone_image: var("DRONE_RUNNER_CLONE_IMAGE"),
        };
        if config.name.is_empty() {
            config.name = hostname();
        }
        if !config.env_file.is_empty() {
            for (k, v) in read_env_file(&config.env_file)? {
                config.environ.insert(k, v);
            }
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlatformConfig {
    pub os: String,
    pub arch: String,
    pub kernel: String,
    pub variant: String,
}

impl PlatformConfig {
    pub fn from_env() -> Self {
        Self {
            os: var_or("DRONE_PLATFORM_OS", "linux"),
            arch: var_or("DRONE_PLATFORM_ARCH", std::env::consts::ARCH),
            kernel: var("DRONE_PLATFORM_KERNEL"),
            variant: var("DRONE_PLATFORM_VARIANT"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LimitConfig {
    pub repos: Vec<String>,
    pub events: Vec<String>,
    pub trusted: bool,
}

impl LimitConfig {
    pub fn from_env() -> Self {
        Self {
            repos: var_list("DRONE_LIMIT_REPOS"),
            events: var_list("DRONE_LIMIT_EVENTS"),
            trusted: var_bool("DRONE_LIMIT_TRUSTED"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourcesConfig {
    pub memory: i64,
    pub memory_swap: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub cpu_shares: i64,
    pub cpu_set: Vec<String>,
    pub shm_size: i64,
}

impl ResourcesConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            memory: var_i64("DRONE_MEMORY_LIMIT")?,
            memory_swap: var_i64("DRONE_MEMORY_SWAP_LIMIT")?,
            cpu_quota: var_i64("DRONE_CPU_QUOTA")?,
            cpu_period: var_i64("DRONE_CPU_PERIOD")?,
            cpu_shares: var_i64("DRONE_CPU_SHARES")?,
            cpu_set: var_list("DRONE_CPU_SET"),
            shm_size: var_i64("DRONE_SHM_SIZE")?,
        })
    }
}

/// External plugin endpoint (secret, registry or environment).
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    pub endpoint: String,
    pub token: String,
    pub skip_verify: bool,
}

impl PluginConfig {
    fn from_env(prefix: &str) -> Self {
        Self {
            endpoint: var(&format!("DRONE_{prefix}_PLUGIN_ENDPOINT")),
            token: var(&format!("DRONE_{prefix}_PLUGIN_TOKEN")),
            skip_verify: var_bool(&format!("DRONE_{prefix}_PLUGIN_SKIP_VERIFY")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    pub config: String,
    pub stream_pull: bool,
}

impl DockerConfig {
    pub fn from_env() -> Self {
        Self {
            config: var("DRONE_DOCKER_CONFIG"),
            stream_pull: var_or("DRONE_DOCKER_STREAM_PULL", "true") == "true",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TmateConfig {
    pub enabled: bool,
    pub image: String,
    pub server: String,
    pub port: String,
    pub rsa_fingerprint: String,
    pub ed25519_fingerprint: String,
    pub authorized_keys: String,
}

impl TmateConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: var_bool("DRONE_TMATE_ENABLED"),
            image: var_or("DRONE_TMATE_IMAGE", "drone/drone-runner-docker:latest"),
            server: var("DRONE_TMATE_HOST"),
            port: var("DRONE_TMATE_PORT"),
            rsa_fingerprint: var("DRONE_TMATE_FINGERPRINT_RSA"),
            ed25519_fingerprint: var("DRONE_TMATE_FINGERPRINT_ED25519"),
            authorized_keys: var("DRONE_TMATE_AUTHORIZED_KEYS"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetrcConfig {
    pub clone_only: bool,
}

impl NetrcConfig {
    pub fn from_env() -> Self {
        Self {
            clone_only: var_bool("DRONE_NETRC_CLONE_ONLY"),
        }
    }
}

/// Unified runner configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub runner: RunnerConfig,
    pub platform: PlatformConfig,
    pub limit: LimitConfig,
    pub resources: ResourcesConfig,
    pub secret_plugin: PluginConfig,
    pub registry_plugin: PluginConfig,
    pub env_plugin: PluginConfig,
    pub docker: DockerConfig,
    pub tmate: TmateConfig,
    pub netrc: NetrcConfig,
}

impl Config {
    /// Loads configuration from the environment, rewriting legacy
    /// variable names first.
    pub fn from_env() -> Result<Self, ConfigError> {
        rewrite_legacy_vars();
        Ok(Self {
            client: ClientConfig::from_env(),
            server: ServerConfig::from_env(),
            runner: RunnerConfig::from_env()?,
            platform: PlatformConfig::from_env(),
            limit: LimitConfig::from_env(),
            resources: ResourcesConfig::from_env()?,
            secret_plugin: PluginConfig::from_env("SECRET"),
            registry_plugin: PluginConfig::from_env("REGISTRY"),
            env_plugin: PluginConfig::from_env("ENV"),
            docker: DockerConfig::from_env(),
            tmate: TmateConfig::from_env(),
            netrc: NetrcConfig::from_env(),
        })
    }
}

fn rewrite_legacy_vars() {
    for (old, new) in LEGACY {
        if let Ok(value) = std::env::var(old) {
            if std::env::var(new).is_err() {
                std::env::set_var(new, value);
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

// KEY=value lines; blank lines and comments are skipped.
fn read_env_file(path: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|e| ConfigError::EnvFile {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    let mut out = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            out.push((
                k.trim().to_string(),
                v.trim().trim_matches('"').to_string(),
            ));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // env-var tests mutate process state and therefore run in a single
    // test to avoid interleaving.
    #[test]
    fn test_from_env() {
        std::env::set_var("DRONE_RPC_HOST", "drone.example.com");
        std::env::set_var("DRONE_RPC_PROTO", "https");
        std::env::set_var("DRONE_RUNNER_NAME", "runner-1");
        std::env::set_var("DRONE_RUNNER_CAPACITY", "4");
        std::env::set_var("DRONE_RUNNER_LABELS", "zone:eu,tier:fast");
        std::env::set_var("DRONE_RUNNER_VOLUMES", "/var/cache:/cache:ro");
        std::env::set_var("DRONE_MEMORY_LIMIT", "1024");
        // legacy spellings rewrite to the new names
        std::env::set_var("DRONE_LIMIT_CPU_SHARES", "512");
        std::env::set_var("DRONE_SERVER_PORT", ":4000");

        let config = Config::from_env().unwrap();
        assert_eq!(config.client.address(), "https://drone.example.com");
        assert_eq!(config.runner.name, "runner-1");
        assert_eq!(config.runner.capacity, 4);
        assert_eq!(config.runner.labels["zone"], "eu");
        assert_eq!(config.runner.volumes["/var/cache"], "/cache:ro");
        assert_eq!(config.resources.memory, 1024);
        assert_eq!(config.resources.cpu_shares, 512);
        assert_eq!(config.server.bind, ":4000");
        assert_eq!(config.server.listen_addr(), "0.0.0.0:4000");

        std::env::set_var("DRONE_RUNNER_CAPACITY", "not-a-number");
        assert!(RunnerConfig::from_env().is_err());
        std::env::remove_var("DRONE_RUNNER_CAPACITY");
    }
}
