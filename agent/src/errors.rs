//! Error types for the rollout agent

use thiserror::Error;

use crate::deploy::health::HealthDiagnostics;

/// Main error type for the rollout agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Deployment already in progress for {0}")]
    ConflictError(String),

    #[error("Missing prerequisite: {0}")]
    PrerequisiteError(String),

    #[error("Image build failed: {0}")]
    BuildError(String),

    #[error("Container start failed: {0}")]
    StartError(String),

    #[error("Health check failed: {message}")]
    HealthCheckError {
        message: String,
        diagnostics: Option<Box<HealthDiagnostics>>,
    },

    #[error("Route registration failed: {0}")]
    RegistrationError(String),

    #[error("Rollback failed: {0}")]
    RollbackError(String),

    #[error("Port range exhausted: {0}")]
    ExhaustedError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Timed out: {0}")]
    TimeoutError(String),

    #[error("Source fetch error: {0}")]
    SourceError(String),

    #[error("Secret fetch error: {0}")]
    SecretError(String),

    #[error("Control channel error: {0}")]
    ControlChannelError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable identifier for the error class
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::IoError(_) => "io",
            AgentError::JsonError(_) => "json",
            AgentError::HttpError(_) => "http",
            AgentError::ApiError(_) => "api",
            AgentError::ValidationError(_) => "validation",
            AgentError::ConflictError(_) => "conflict",
            AgentError::PrerequisiteError(_) => "prerequisite",
            AgentError::BuildError(_) => "build",
            AgentError::StartError(_) => "start",
            AgentError::HealthCheckError { .. } => "health_check",
            AgentError::RegistrationError(_) => "registration",
            AgentError::RollbackError(_) => "rollback",
            AgentError::ExhaustedError(_) => "exhausted",
            AgentError::ProcessError(_) => "process",
            AgentError::TimeoutError(_) => "timeout",
            AgentError::SourceError(_) => "source",
            AgentError::SecretError(_) => "secret",
            AgentError::ControlChannelError(_) => "control_channel",
            AgentError::ConfigError(_) => "config",
            AgentError::ServerError(_) => "server",
            AgentError::ShutdownError(_) => "shutdown",
            AgentError::NotFound(_) => "not_found",
            AgentError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Internal(err.to_string())
    }
}
