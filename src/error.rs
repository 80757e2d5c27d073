//! Error types for render attempts and decoders.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// A concurrent attempt already published a frame at the same decoded size.
    #[error("Superseded by a completed render at {width}x{height}")]
    Superseded { width: u32, height: u32 },

    #[error("Render task failed: {0}")]
    Task(String),
}

impl RenderError {
    pub fn superseded(width: u32, height: u32) -> Self {
        Self::Superseded { width, height }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}

impl From<tokio::task::JoinError> for RenderError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Decoder error: {0}")]
    Failed(String),

    #[error("Decoder already released")]
    Released,
}

impl From<String> for DecodeError {
    fn from(s: String) -> Self {
        DecodeError::Failed(s)
    }
}

impl From<&str> for DecodeError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}
