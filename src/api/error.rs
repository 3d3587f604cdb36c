use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::Error;

/// Body of every failed response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub reason: String,
}

/// An [`Error`] on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::ValidationError(_)
            | Error::SerializationError(_)
            | Error::YamlError(_)
            | Error::Base64Error(_)
            | Error::IllegalServicePackage(_)
            | Error::NotFound(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match &self.0 {
            Error::SerializationError(_) | Error::YamlError(_) | Error::Base64Error(_) => "DataUnmarshalError",
            Error::KubeError(_) => "KubeError",
            Error::DatabaseError(_) => "DatabaseError",
            Error::IllegalServicePackage(_) | Error::ValidationError(_) => "ValidationError",
            Error::NotFound(_) => "NotFound",
            Error::ServiceInstallError(_) => "ServiceInstallError",
            Error::ServiceDeleteError(_) => "ServiceDeleteError",
            Error::InstanceCreateError(_) => "InstanceCreateError",
            Error::Timeout(_) => "Timeout",
            Error::Conflict(_) => "Conflict",
            Error::CrdError(_) | Error::ConfigError(_) => "InternalError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        } else {
            warn!("request rejected: {}", self.0);
        }
        envelope(status, self.code(), self.0.to_string())
    }
}

/// Failed response with the common body.
pub(crate) fn envelope(status: StatusCode, code: &str, reason: String) -> Response {
    let body = ErrorBody {
        code: code.to_string(),
        reason,
    };
    (status, Json(body)).into_response()
}
