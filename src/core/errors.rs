use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("User not logged in.")]
    NotSignedIn,

    #[error("{0}")]
    Remote(String),

    #[error("Image upload failed: {0}")]
    Upload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed document: {0}")]
    Data(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Message without the variant prefix, used when an engine composes its own error line.
    pub fn detail(&self) -> String {
        match self {
            SyncError::Upload(msg)
            | SyncError::Remote(msg)
            | SyncError::NotFound(msg)
            | SyncError::Data(msg)
            | SyncError::InvalidInput(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

// Remote services report opaque failures; they pass through as store errors
impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Remote(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Data(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_become_remote_errors() {
        let err: SyncError = anyhow::anyhow!("permission denied").into();
        assert!(matches!(err, SyncError::Remote(ref m) if m == "permission denied"));
        assert_eq!(err.to_string(), "permission denied");
    }

    #[test]
    fn detail_strips_variant_prefix() {
        let err = SyncError::Upload("timeout".to_string());
        assert_eq!(err.to_string(), "Image upload failed: timeout");
        assert_eq!(err.detail(), "timeout");
        assert_eq!(SyncError::NotSignedIn.detail(), "User not logged in.");
    }
}
