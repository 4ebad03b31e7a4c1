//! Request-level failures reported to the network-visible loader.

use pd_net::HttpStatusCode;

/// Why a custom-scheme load did not complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum LoadError {
    #[error("request is missing a required argument")]
    InvalidArgument,
    #[error("initiator may not load local content")]
    AccessDenied,
    #[error("cross-origin request to a scheme without CORS support")]
    CorsDisabledScheme,
    #[error("generic I/O failure")]
    IoFailure,
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,
    #[error("url not found")]
    UrlNotFound,
    #[error("url is invalid")]
    UrlInvalid,
    #[error("request was aborted")]
    RequestAborted,
    #[error("request was denied")]
    RequestDenied,
    #[error("request failed")]
    RequestFailed,
}

impl LoadError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid-argument",
            Self::AccessDenied => "access-denied",
            Self::CorsDisabledScheme => "cors-disabled-scheme",
            Self::IoFailure => "io-failure",
            Self::RangeNotSatisfiable => "range-not-satisfiable",
            Self::UrlNotFound => "url-not-found",
            Self::UrlInvalid => "url-invalid",
            Self::RequestAborted => "request-aborted",
            Self::RequestDenied => "request-denied",
            Self::RequestFailed => "request-failed",
        }
    }

    /// Status used when the failure is rendered as a response status line.
    pub fn status(self) -> HttpStatusCode {
        match self {
            Self::InvalidArgument | Self::UrlInvalid => HttpStatusCode::BAD_REQUEST,
            Self::AccessDenied | Self::CorsDisabledScheme | Self::RequestDenied => {
                HttpStatusCode::FORBIDDEN
            }
            Self::UrlNotFound => HttpStatusCode::NOT_FOUND,
            Self::RangeNotSatisfiable => HttpStatusCode::RANGE_NOT_SATISFIABLE,
            Self::IoFailure | Self::RequestAborted | Self::RequestFailed => {
                HttpStatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
