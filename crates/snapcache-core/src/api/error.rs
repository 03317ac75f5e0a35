use thiserror::Error;

use crate::auth::AuthError;
use crate::models::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Upstream timed out: {0}")]
    Timeout(String),

    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Upstream returned errors ({status}): {}", join_codes(.errors))]
    ErrorList { status: u16, errors: Vec<StoreError> },

    #[error("Not authorized to access {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Developer programme agreement not signed")]
    AgreementNotSigned,

    #[error("Account has no username")]
    MissingUsername,

    #[error("Macaroon discharge still stale after {0} refresh attempt(s)")]
    MacaroonRefreshRequired(u32),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        body.to_string()
    } else {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
}

fn join_codes(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(|e| e.code.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ApiError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = truncate_body(body);
        match status {
            403 => ApiError::Forbidden(truncated),
            404 => ApiError::NotFound(truncated),
            _ => ApiError::Rejected {
                status,
                body: truncated,
            },
        }
    }

    /// Status a web handler should answer with when this error ends the
    /// request.
    pub fn gateway_status(&self) -> u16 {
        match self {
            ApiError::Timeout(_) => 504,
            ApiError::Rejected { status, .. } => *status,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::InvalidRequest(_) => 400,
            ApiError::Auth(AuthError::NotAuthenticated | AuthError::InvalidCredential(_)) => 401,
            ApiError::Network(e) if e.is_timeout() => 504,
            ApiError::Unavailable(_)
            | ApiError::Network(_)
            | ApiError::ErrorList { .. }
            | ApiError::AgreementNotSigned
            | ApiError::MissingUsername
            | ApiError::MacaroonRefreshRequired(_)
            | ApiError::Auth(AuthError::AuthService(_))
            | ApiError::InvalidResponse(_) => 502,
        }
    }

    /// Page the user should be sent to, for errors they can fix.
    pub fn redirect_path(&self) -> Option<&'static str> {
        match self {
            ApiError::MissingUsername => Some("/account/username"),
            ApiError::AgreementNotSigned => Some("/account/agreement"),
            ApiError::Auth(AuthError::NotAuthenticated | AuthError::InvalidCredential(_)) => {
                Some("/login")
            }
            _ => None,
        }
    }
}
