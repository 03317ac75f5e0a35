//! Core library for snapcache.
//!
//! Provides the pieces a snap store frontend needs to talk to the store:
//!
//! - `cache`: the cached, retrying HTTP accessor with stale-on-error fallback
//! - `auth`: macaroon credentials, session state and the refresh broker
//! - `api`: the typed store client and its error taxonomy
//! - `models`: store payloads
//! - `config`: endpoint and policy configuration

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;

pub use api::{ApiError, Fetched, SearchPage, StoreClient};
pub use auth::{AuthBroker, AuthError, Session, VerificationOutcome};
pub use cache::{CachedAccessor, FetchOutcome, ResponseSnapshot, RetryConfig};
pub use config::Config;
