//! HTTP error response handling for the API
//!
//! This module converts domain errors into HTTP responses: the status code
//! comes from [`ToHttpStatus`], the body is a FHIR `OperationOutcome`, and
//! throttling errors carry their `Retry-After` hint as a header.

use crate::error::{Error, OperationOutcome, ToHttpStatus};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

/// Implement IntoResponse for Error to automatically convert errors to HTTP responses
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry_after = self.retry_after();
        let outcome: OperationOutcome = self.into();

        let mut response = (status_code, Json(outcome)).into_response();
        if let Some(seconds) = retry_after
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}
