//! REST API client module for the SmartGrow backend.
//!
//! This module provides the `ApiClient` for signing in and calling the
//! greenhouse API through the session transport, and `ApiError`, the error
//! type every request returns.
//!
//! The API uses JWT bearer token authentication; tokens are issued by the
//! `Auth` controller and renewed transparently on 401.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
