use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Edit-time validation errors
    #[error("Cannot connect node {0} to itself")]
    SelfConnection(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Connecting {from} -> {to} would create a cycle")]
    CycleDetected { from: String, to: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    // Generation errors
    #[error("Generation request failed: {0}")]
    GenerationRequest(String),

    #[error("Generation streaming error: {0}")]
    GenerationStream(String),

    #[error("Generation response parse error: {0}")]
    GenerationParse(String),

    #[error("Generation timed out after {secs}s")]
    GenerationTimeout { secs: u64 },

    #[error("Provider not supported: {0}")]
    UnsupportedProvider(String),

    // Run errors
    #[error("Run cancelled")]
    Cancelled,

    #[error("Dependency {0} failed")]
    DependencyFailed(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Persistence errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Whether this error was raised by edit-time validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::SelfConnection(_)
                | Self::NodeNotFound(_)
                | Self::CycleDetected { .. }
                | Self::DuplicateNode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
