//! Macaroon authentication.
//!
//! This module provides:
//! - `Macaroon`: the credential codec and request binding
//! - `Session`: the per-user credential pair and identity
//! - `SessionFile`: JSON persistence of a session for the CLI
//! - `AuthBroker`: header building, refresh detection and the refresh call
//!
//! The broker never retries on its own. Callers re-issue the original
//! request after a refresh and cap how often they do so.

pub mod broker;
pub mod error;
pub mod macaroon;
pub mod session;

pub use broker::{
    build_header, caveat_id, empty_session, is_authenticated, needs_refresh, AuthBroker, AuthEndpoints,
    MacaroonVerification, VerificationOutcome, REFRESH_SENTINEL,
};
pub use error::AuthError;
pub use macaroon::{Caveat, Macaroon, MacaroonError};
pub use session::{CredentialPair, Identity, Session, SessionFile};
