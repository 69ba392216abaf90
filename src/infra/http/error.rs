use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use trellis_api_types::codes;

use crate::application::error::{Error, ErrorKind, ErrorReport};

use super::envelope;

/// Non-standard status for requests cancelled before completion.
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug)]
pub struct ApiError {
    source: &'static str,
    error: Error,
}

impl ApiError {
    pub fn new(source: &'static str, error: Error) -> Self {
        Self { source, error }
    }

    pub fn bad_request(source: &'static str, message: impl Into<String>) -> Self {
        Self::new(source, Error::bad_request(message))
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn status(&self) -> StatusCode {
        match self.error.kind() {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Cancelled => StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::REQUEST_TIMEOUT),
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> i32 {
        if matches!(self.error, Error::AfterHook { .. }) {
            return codes::AFTER_HOOK;
        }
        match self.error.kind() {
            ErrorKind::BadRequest => codes::BAD_REQUEST,
            ErrorKind::NotFound => codes::NOT_FOUND,
            ErrorKind::Conflict => codes::CONFLICT,
            ErrorKind::Transient => codes::TRANSIENT,
            ErrorKind::Cancelled => codes::CANCELLED,
            ErrorKind::Internal => codes::INTERNAL,
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self::new("infra::http::controller", error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details stay in the logs.
        let message = match self.error.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.error.to_string(),
        };
        let mut response = envelope::failure(status, self.code(), message);
        ErrorReport::from_error(self.source, status, &self.error).attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::store::StoreError;

    #[test]
    fn kinds_map_to_statuses_and_codes() {
        let conflict = ApiError::from(Error::Store(StoreError::Duplicate {
            table: "users".into(),
            field: "email".into(),
        }));
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(conflict.code(), codes::CONFLICT);

        let cancelled = ApiError::from(Error::Cancelled { committed: true });
        assert_eq!(cancelled.status().as_u16(), 499);

        let after = ApiError::from(Error::after_hook("create_after", Error::internal("boom")));
        assert_eq!(after.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(after.code(), codes::AFTER_HOOK);
    }

    #[test]
    fn responses_carry_an_error_report() {
        let response = ApiError::bad_request("test", "nope").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert_eq!(report.source, "test");
    }
}
