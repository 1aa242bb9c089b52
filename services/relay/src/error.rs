use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Fatal errors that can only occur on the init path or while propagating a
/// storage failure up to something that must decide whether to keep running.
///
/// Per-event validation failures are *not* represented here — they are
/// advisory strings destined for an `OK` frame (see `validator.rs`), and
/// promoting them to variants here would just get turned back into a string
/// at the one call site that reads them.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Wire shape for non-2xx HTTP responses from the metrics/health surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
}

pub type HttpResponse = Response;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
        }),
    )
        .into_response()
}
