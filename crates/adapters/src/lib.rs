//! Adapters: concrete implementations of the runner ports.
//!
//! The Docker engine built on bollard-next, the HTTP log-sink client,
//! static secret/registry/environment providers, and configuration
//! loading from the environment.

pub mod config;
pub mod docker;
pub mod livelog_client;
pub mod providers;

pub use crate::config::Config;
pub use crate::docker::DockerEngine;
pub use crate::livelog_client::HttpLogStreamClient;
pub use crate::providers::{StaticEnvs, StaticRegistry, StaticSecrets};
