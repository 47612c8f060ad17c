use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::ResourceKey;

#[derive(Error, Debug)]
pub enum ConvergentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Target not registered: {0}")]
    UnknownTarget(String),

    #[error("Controller is shut down")]
    ShutDown,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Schema validation failed in '{path}': {errors}")]
    SchemaValidation { path: PathBuf, errors: String },

    #[error("Invalid API version '{version}', expected '{expected}'")]
    InvalidApiVersion { version: String, expected: String },

    #[error("Duplicate resource name '{name}' for kind '{kind}'")]
    DuplicateName { kind: String, name: String },

    #[error("Config directory not found: {0}")]
    ConfigDirNotFound(PathBuf),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised while retrieving a desired-state bundle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Source authentication failed: {0}")]
    AuthFailed(String),

    #[error("Network error while fetching source: {0}")]
    NetworkError(String),

    #[error("Fetch timed out after {0}s")]
    Timeout(u64),

    #[error("Failed to read source '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Git operation failed: {0}")]
    Git(String),
}

impl FetchError {
    /// Returns true if the error is likely transient and the fetch can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::NetworkError(_) | FetchError::Timeout(_))
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return FetchError::NetworkError(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return FetchError::AuthFailed(stderr.trim().to_string());
    }

    if lower.contains("repository not found")
        || lower.contains("does not appear to be a git repository")
        || lower.contains("does not exist")
        || lower.contains("unknown revision")
    {
        return FetchError::NotFound(stderr.trim().to_string());
    }

    FetchError::Git(stderr.trim().to_string())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Failed to parse YAML document '{document}': {message}")]
    Parse { document: String, message: String },

    #[error("Malformed expression '{expression}' in '{document}': {reason}")]
    Malformed {
        document: String,
        expression: String,
        reason: String,
    },

    #[error("Undefined value '{path}' referenced in '{document}'")]
    UndefinedValue { document: String, path: String },

    #[error("Invalid resource document '{document}': {message}")]
    InvalidDocument { document: String, message: String },

    #[error("Failed to apply patch '{patch}': {message}")]
    Patch { patch: String, message: String },

    #[error("Resource {0} is rendered more than once")]
    DuplicateIdentity(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("Resource {0} appears more than once in the {1} state")]
    DuplicateIdentity(String, &'static str),

    #[error("Resource {key} cannot be compared: {message}")]
    InvalidResource { key: String, message: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Dependency cycle detected among: {}", members.join(", "))]
    DependencyCycle { members: Vec<String> },

    #[error("Resource {resource} depends on {dependency}, which is not part of the target")]
    UnknownDependency { resource: String, dependency: String },

    #[error("Invalid dependency reference '{reference}' on {resource}")]
    InvalidReference { resource: String, reference: String },

    #[error("Invalid sync wave '{value}' on {resource}")]
    InvalidSyncWave { resource: String, value: String },
}

/// Per-action failures reported by the target resource system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Apply of {key} rejected: {message}")]
    Rejected { key: ResourceKey, message: String },

    #[error("Conflict while writing {key}: {message}")]
    Conflict { key: ResourceKey, message: String },

    #[error("Resource API unavailable: {0}")]
    Unavailable(String),

    #[error("Resource {0} not found")]
    NotFound(ResourceKey),

    #[error("Replacement {0} did not become ready in time")]
    NotReady(ResourceKey),
}

impl ApplyError {
    /// Returns true if the error is transient and the action may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApplyError::Conflict { .. } | ApplyError::Unavailable(_) | ApplyError::NotReady(_)
        )
    }
}

/// Failures that abort a reconciliation cycle before or during syncing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("reading live state failed: {0}")]
    LiveState(#[from] ApplyError),

    #[error("diff failed: {0}")]
    Diff(#[from] DiffError),

    #[error("plan failed: {0}")]
    Plan(#[from] PlanError),

    #[error("superseded")]
    Superseded,
}

/// Pipeline stage an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetching,
    Rendering,
    Diffing,
    Planning,
    Syncing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetching => write!(f, "fetching"),
            Stage::Rendering => write!(f, "rendering"),
            Stage::Diffing => write!(f, "diffing"),
            Stage::Planning => write!(f, "planning"),
            Stage::Syncing => write!(f, "syncing"),
        }
    }
}

/// An error surfaced to observers, verbatim, with the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, error: &SyncError) -> Self {
        Self {
            stage,
            message: error.to_string(),
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

pub type Result<T> = std::result::Result<T, ConvergentError>;
