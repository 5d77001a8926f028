use std::path::PathBuf;
use thiserror::Error;

/// Failures of the update detection and reconciliation engine.
///
/// Every variant is scoped to the smallest unit it affects (run, workload, tag or GitOps
/// candidate); only [`EngineError::Config`] is fatal, and only at startup.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("workload discovery failed: {0}")]
    Discovery(String),

    #[error("registry {registry} request failed: {message}")]
    Registry { registry: String, message: String },

    #[error("no registry credentials configured for {0} and no default registry entry")]
    RegistryAuthUnresolved(String),

    #[error("tag '{tag}' is not a semantic version: {reason}")]
    InvalidVersion { tag: String, reason: String },

    #[error("no Deployment or StatefulSet in GitOps target {target} references image {image}")]
    ManifestNotFound { target: String, image: String },

    #[error("workload {workload} now runs {live}, update was requested for {requested}")]
    StaleUpdateRequest {
        workload: String,
        requested: String,
        live: String,
    },

    #[error("notification dispatch failed: {0}")]
    NotificationDispatch(String),

    #[error("GitOps target '{0}' is not configured")]
    UnknownGitOpsTarget(String),

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot '{name}' could not be (de)serialized: {message}")]
    Snapshot { name: String, message: String },
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Drift between the GitOps repository and the cluster. Needs an operator.
    pub fn is_drift(&self) -> bool {
        matches!(
            self,
            EngineError::ManifestNotFound { .. } | EngineError::StaleUpdateRequest { .. }
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Runs `fut` with a deadline, mapping expiry to [`EngineError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, timeout: std::time::Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            operation: operation.to_string(),
            seconds: timeout.as_secs(),
        }),
    }
}
