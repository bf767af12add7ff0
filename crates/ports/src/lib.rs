//! Ports: trait interfaces consumed by the runner core.
//!
//! Every external collaborator of the compile-and-execute engine appears
//! here as a trait: the container engine, the secret/registry/environment
//! providers, the coordinator client, the status reporter and the
//! log-stream sink. Adapters implement them; the core depends only on the
//! traits.

pub mod client;
pub mod engine;
pub mod environ;
pub mod logging;
pub mod registry;
pub mod secret;

pub use crate::client::{ClientError, CoordinatorClient, NopReporter, Reporter, StageContext};
pub use crate::engine::{Engine, EngineError, RunState};
pub use crate::environ::{EnvProvider, EnvRequest, EnvVariable};
pub use crate::logging::{
    CardUploader, Line, LogStreamClient, LogStreamError, LogWriter, StepStream, StreamWriter,
    Streamer,
};
pub use crate::registry::{RegistryProvider, RegistryRequest};
pub use crate::secret::{CombineSecrets, SecretProvider, SecretRequest};
