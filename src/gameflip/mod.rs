//! Signed access to the marketplace REST API.

pub mod auth;
pub mod client;
pub mod config;
pub mod listings;
pub mod transport;

pub use auth::Credentials;
pub use client::{ApiClient, ApiError};
