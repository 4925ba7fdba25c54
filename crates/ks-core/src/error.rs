use std::fmt;

/// Which external collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Embedding,
    Index,
    Generation,
}

impl Upstream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Index => "index",
            Self::Generation => "generation",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Invalid weights, window sizes or thresholds. Fatal at startup.
    Config(String),
    /// A tension or chunk has no vector. Excluded from scoring, never a request failure.
    MissingEmbedding { id: String },
    /// An embedding, index or generation collaborator failed.
    Upstream { service: Upstream, message: String },
}

impl CoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn upstream(service: Upstream, msg: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            message: msg.into(),
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            CoreError::MissingEmbedding { id } => write!(f, "no embedding for '{id}'"),
            CoreError::Upstream { service, message } => {
                write!(f, "{} service unavailable: {message}", service.as_str())
            }
        }
    }
}

impl std::error::Error for CoreError {}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
