//! Domain Core: Pipeline Execution Model
//!
//! This crate contains the domain entities and value objects shared by the
//! compiler, the execer and the engine adapters: the parsed pipeline
//! resource, the compiled execution plan (Spec), run/err/pull policies,
//! the coordinator-side records and the stage state machine. It has no
//! dependency on ports, adapters or any container engine.

pub mod cancel;
pub mod environ;
pub mod error;
pub mod image;
pub mod model;
pub mod policy;
pub mod resource;
pub mod spec;
pub mod state;

pub use crate::cancel::CancelToken;
pub use crate::error::{DomainError, Result};
pub use crate::model::{status, Build, Netrc, Repo, Stage, StageSecret, StageStep, System};
pub use crate::policy::{ErrPolicy, PullPolicy, RunPolicy};
pub use crate::spec::{
    Auth, Network, Secret, Spec, Step, Volume, VolumeDevice, VolumeEmptyDir, VolumeHostPath,
    VolumeMount,
};
pub use crate::state::State;
