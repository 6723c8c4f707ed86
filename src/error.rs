//! Error types surfaced by the guide core.
//!
//! Storage and HTTP plumbing use `anyhow` internally; anything a request
//! handler needs to branch on is lifted into [`GuideError`].

/// Typed failures of the conversational core and the progress service.
#[derive(Debug, thiserror::Error)]
pub enum GuideError {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("persistence write failed: {0}")]
    PersistenceWriteFailed(String),

    #[error("stale progress state for user {user_id}: completed unit {unit} is beyond the stage map")]
    StaleState { user_id: String, unit: u32 },

    #[error("reflection too long: {len} characters (max {max})")]
    ReflectionTooLong { len: usize, max: usize },

    #[error("episode {0} has no reflection yet")]
    ReflectionMissing(u32),

    #[error("episode {episode} is locked until episode {required} is completed")]
    ContentLocked { episode: u32, required: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type GuideResult<T> = std::result::Result<T, GuideError>;

impl GuideError {
    /// Short machine-readable tag used in HTTP error payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GuideError::UnknownUser(_) => "unknown_user",
            GuideError::ContentNotFound(_) => "content_not_found",
            GuideError::GenerationFailed(_) => "generation_failed",
            GuideError::PersistenceWriteFailed(_) => "persistence_write_failed",
            GuideError::StaleState { .. } => "stale_state",
            GuideError::ReflectionTooLong { .. } => "reflection_too_long",
            GuideError::ReflectionMissing(_) => "reflection_missing",
            GuideError::ContentLocked { .. } => "content_locked",
            GuideError::InvalidInput(_) => "invalid_input",
            GuideError::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_convert_from_anyhow() {
        let err: GuideError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind(), "storage");
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn locked_message_names_required_episode() {
        let err = GuideError::ContentLocked {
            episode: 4,
            required: 3,
        };
        assert_eq!(
            err.to_string(),
            "episode 4 is locked until episode 3 is completed"
        );
    }
}
