//! Error types shared across the system

use thiserror::Error;

/// Base error type for the runner domain.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("linter: {0}")]
    Lint(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("unknown step dependency detected: {step} references {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected")]
    DependencyCycle,

    #[error("expression error: {0}")]
    Expression(String),

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
