//! Data transfer objects exchanged with the SmartGrow backend.
//!
//! - `LoginCredentials`, `RegisterCredentials`: sign-in and sign-up payloads
//! - `AuthResponse`, `RefreshResponse`: token pairs issued by the auth controller
//! - `HealthStatus`: service health check

pub mod auth;
pub mod health;

pub use auth::{AuthResponse, LoginCredentials, RefreshResponse, RegisterCredentials};
pub use health::HealthStatus;
