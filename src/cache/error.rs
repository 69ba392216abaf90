use thiserror::Error;

/// Failure modes shared by every cache backend.
///
/// `NotFound` is a cache miss and never fatal for callers; every other
/// variant is a genuine backend or codec failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache key not found")]
    NotFound,
    #[error("failed to encode cache value: {0}")]
    Encode(String),
    #[error("failed to decode cache value: {0}")]
    Decode(String),
    #[error("cache value of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl CacheError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
            Self::TooLarge { .. } => "too_large",
            Self::Backend(_) => "backend",
        }
    }
}
