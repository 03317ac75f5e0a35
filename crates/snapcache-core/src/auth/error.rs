use thiserror::Error;

use super::macaroon::MacaroonError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(#[from] MacaroonError),

    #[error("Auth service error: {0}")]
    AuthService(String),

    #[error("Not authenticated")]
    NotAuthenticated,
}

impl From<reqwest::Error> for AuthError {
    fn from(error: reqwest::Error) -> Self {
        AuthError::AuthService(error.to_string())
    }
}
