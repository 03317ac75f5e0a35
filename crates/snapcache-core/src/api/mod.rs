//! Snap store client module.
//!
//! This module provides the `StoreClient` for the public catalogue (details,
//! search, featured and promoted listings, metrics) and for the publisher
//! dashboard (account, agreement, listing metadata, status).
//!
//! Catalogue reads are served through the response cache. Publisher calls
//! authenticate with the session's root and discharge macaroons.

pub mod client;
pub mod error;

pub use client::{Fetched, SearchPage, StoreClient};
pub use error::ApiError;
