use std::error::Error as StdError;

use axum::{http::StatusCode, response::Response};
use thiserror::Error;

use crate::{application::store::StoreError, domain::error::DomainError, infra::error::InfraError};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Coarse classification every pipeline failure maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Transient,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("operation cancelled (committed: {committed})")]
    Cancelled { committed: bool },
    /// A hook failed after the mutation became durable.
    #[error("{phase} hook failed after the mutation was persisted")]
    AfterHook {
        phase: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn after_hook(phase: &'static str, source: Error) -> Self {
        Self::AfterHook {
            phase,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::AfterHook { .. } | Error::Internal(_) => ErrorKind::Internal,
            Error::Domain(err) => match err {
                DomainError::NotFound { .. } => ErrorKind::NotFound,
                DomainError::Validation { .. } => ErrorKind::BadRequest,
                DomainError::Conflict { .. } => ErrorKind::Conflict,
                DomainError::Invariant { .. } => ErrorKind::Internal,
            },
            Error::Store(err) => match err {
                StoreError::NotFound => ErrorKind::NotFound,
                StoreError::Duplicate { .. } | StoreError::Integrity(_) => ErrorKind::Conflict,
                StoreError::InvalidInput(_) | StoreError::Unsupported(_) => ErrorKind::BadRequest,
                StoreError::Timeout | StoreError::Unavailable(_) => ErrorKind::Transient,
                StoreError::Persistence(_) | StoreError::Serialization(_) => ErrorKind::Internal,
            },
            Error::Infra(err) => match err {
                InfraError::Database { .. } => ErrorKind::Transient,
                _ => ErrorKind::Internal,
            },
        }
    }

    /// True when the store was mutated before the failure surfaced.
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            Error::Cancelled { committed: true } | Error::AfterHook { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(StoreError::Serialization(err.to_string()))
    }
}
