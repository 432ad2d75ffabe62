//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

/// Errors returned by request handlers.
///
/// Authorization failures arrive from the store as `NotFound` and are
/// answered with a 404 like any missing resource.
#[derive(Debug)]
pub enum ApiError {
    Internal(courselore_core::Error),
    Unauthorized(String),
    NotFound(String),
    BadRequest(String),
    /// A validation rejection of a submitted form or action.
    Unprocessable(String),
}

impl From<courselore_core::Error> for ApiError {
    fn from(err: courselore_core::Error) -> Self {
        match err {
            courselore_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            courselore_core::Error::InvalidInput(msg) => ApiError::Unprocessable(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Internal(err) => {
                tracing::error!(subsystem = "api", error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: courselore_core::Error) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_core_errors_map_to_status() {
        assert_eq!(
            status_of(courselore_core::Error::not_found("message 4")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(courselore_core::Error::invalid("Content cannot be empty")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(courselore_core::Error::Mail("relay down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_unauthorized_status() {
        let response = ApiError::Unauthorized("no user".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
