//! Maps `KernelError` onto HTTP status codes and a uniform JSON error body,
//! the way the teacher's REST adapters translate a domain result into a
//! response rather than leaking `Debug` output to callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cadence_kernel::KernelError;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

pub enum ApiError {
    NotFound(String),
    Kernel(KernelError),
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        Self::Kernel(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::Kernel(err) => {
                let status = match &err {
                    KernelError::Validation(_)
                    | KernelError::ScheduleParse(_)
                    | KernelError::UnresolvedTemplate(_)
                    | KernelError::SchemaViolation(_) => StatusCode::BAD_REQUEST,
                    KernelError::ToolError { .. } => StatusCode::BAD_GATEWAY,
                    KernelError::Cancelled => StatusCode::CONFLICT,
                    KernelError::Store(_) | KernelError::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                let code = match &err {
                    KernelError::Validation(_) => "validation",
                    KernelError::ScheduleParse(_) => "schedule_parse",
                    KernelError::UnresolvedTemplate(_) => "unresolved_template",
                    KernelError::SchemaViolation(_) => "schema_violation",
                    KernelError::ToolError { .. } => "tool_error",
                    KernelError::Cancelled => "cancelled",
                    KernelError::Store(_) => "store",
                    KernelError::Internal(_) => "internal",
                };
                (status, code, err.to_string())
            }
        };
        let body = ErrorBody {
            error: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
