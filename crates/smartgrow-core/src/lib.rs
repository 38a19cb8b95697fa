//! SmartGrow client core.
//!
//! Talks to the SmartGrow greenhouse backend on behalf of a signed-in user:
//! - `transport`: bearer-authenticated dispatch with single-flight token renewal
//! - `auth`: credential stores and the token pair vault
//! - `api`: typed client, login/register/logout flows, error type
//! - `models`: wire DTOs
//! - `config`: on-disk and environment configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod transport;

pub use api::{ApiClient, ApiError};
pub use config::Config;
pub use transport::{SessionEvent, SessionTransport};
