use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures surfaced by supervisor operations. The `Display` text is the
/// human-readable reason handed back to the admin layer.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("user {user_id} has no endpoint configured, set one before starting the worker")]
    MissingEndpoint { user_id: String },
    #[error("failed to launch worker for user {user_id}: {reason}")]
    SpawnFailure { user_id: String, reason: String },
    #[error("failed to write config artifact {}: {source}", path.display())]
    ArtifactWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("user {0} not found")]
    RecordNotFound(String),
    #[error("invalid worker spec: {0}")]
    InvalidSpec(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SupervisorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SupervisorError::RecordNotFound(id),
            other => SupervisorError::Store(other),
        }
    }
}

impl SupervisorError {
    /// Whether the caller can fix the problem by changing the request or the record.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::MissingEndpoint { .. } | SupervisorError::InvalidSpec(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SupervisorError::RecordNotFound(_))
    }
}
