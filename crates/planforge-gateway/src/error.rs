use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use planforge_core::PlanforgeError;

/// A [`PlanforgeError`] carried to the wire.
///
/// Clients see only the terminal, named error kind and its message — never
/// internals or stack traces.
#[derive(Debug)]
pub struct ApiError(pub PlanforgeError);

impl From<PlanforgeError> for ApiError {
    fn from(err: PlanforgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PlanforgeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PlanforgeError::NotFound(_) => StatusCode::NOT_FOUND,
            PlanforgeError::Conflict(_)
            | PlanforgeError::WrongStage(_)
            | PlanforgeError::StaleApproval(_)
            | PlanforgeError::NotFailed(_) => StatusCode::CONFLICT,
            PlanforgeError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            PlanforgeError::TransientBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (PlanforgeError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (PlanforgeError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PlanforgeError::Conflict("x".into()), StatusCode::CONFLICT),
            (PlanforgeError::WrongStage("x".into()), StatusCode::CONFLICT),
            (PlanforgeError::StaleApproval("x".into()), StatusCode::CONFLICT),
            (PlanforgeError::NotFailed("x".into()), StatusCode::CONFLICT),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
