use std::{fmt, io};

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

/// Which configured part-count threshold was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Parts,
    Files,
    Fields,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitKind::Parts => "parts",
            LimitKind::Files => "files",
            LimitKind::Fields => "fields",
        })
    }
}

/// Error type for form aggregation.
#[derive(Error, Debug)]
pub enum FormError {
    /// A configured parts/files/fields threshold was exceeded.
    #[error("reached {kind} limit")]
    LimitExceeded { kind: LimitKind },

    /// The decoder reported malformed input or the transport failed.
    #[error("multipart decode failed: {0}")]
    Decode(#[source] Box<dyn std::error::Error>),

    /// A file part could not be written to the storage sink.
    #[error("failed to persist file part {field:?}: {source}")]
    Persistence { field: String, source: io::Error },

    /// A field name with no base key, e.g. `""` or `"[x]"`.
    #[error("field name {0:?} has no base key")]
    InvalidFieldName(String),
}

impl FormError {
    pub(crate) fn limit(kind: LimitKind) -> Self {
        FormError::LimitExceeded { kind }
    }

    pub(crate) fn decode<E>(err: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        FormError::Decode(Box::new(err))
    }

    pub(crate) fn persistence(field: impl Into<String>, source: io::Error) -> Self {
        FormError::Persistence {
            field: field.into(),
            source,
        }
    }

    /// Status for HTTP-style callers: 413 for limit rejections, 400 otherwise.
    pub fn status(&self) -> StatusCode {
        match self {
            FormError::LimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl ResponseError for FormError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).body(self.to_string())
    }
}
