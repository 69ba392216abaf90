//! The one renderer every controller response goes through.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use trellis_api_types::Envelope;

pub fn success<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(Envelope::success(data))).into_response()
}

pub fn failure(status: StatusCode, code: i32, msg: impl Into<String>) -> Response {
    (status, Json(Envelope::<()>::failure(code, msg))).into_response()
}

/// Bare JSON body served as a download named `filename`.
pub fn attachment<T: Serialize>(filename: &str, body: T) -> Response {
    let mut response = (StatusCode::OK, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    response
}
