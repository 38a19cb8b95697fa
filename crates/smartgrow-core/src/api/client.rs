//! API client for communicating with the SmartGrow REST API.
//!
//! This module provides the `ApiClient` struct: typed calls on top of the
//! session transport, plus the login, registration and logout flows that
//! create and destroy the stored session.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::ApiError;
use crate::auth::{CredentialPair, CredentialVault};
use crate::config::Config;
use crate::models::{AuthResponse, HealthStatus, LoginCredentials, RefreshResponse, RegisterCredentials};
use crate::transport::{
    HttpResponse, ReqwestExchange, RequestDescriptor, SessionEvent, SessionTransport,
};

// ============================================================================
// Constants
// ============================================================================

/// Route of the user controller (account deletion)
pub const USER_PATH: &str = "User";

/// Route of the health check controller
pub const HEALTH_PATH: &str = "Health";

/// API client for SmartGrow.
/// Clone is cheap - clones share the transport, credentials and refresh state.
#[derive(Clone)]
pub struct ApiClient {
    transport: SessionTransport,
}

impl ApiClient {
    /// Build a client from configuration: reqwest exchange plus the
    /// configured credential backend.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let exchange = ReqwestExchange::new(config.request_timeout())?;
        let vault = CredentialVault::new(config.open_credential_store()?);
        let transport = SessionTransport::new(Arc::new(exchange), vault, config.transport_settings());
        Ok(Self::with_transport(transport))
    }

    pub fn with_transport(transport: SessionTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.transport.subscribe()
    }

    /// Whether an access token is stored. Says nothing about its validity.
    pub fn is_authenticated(&self) -> Result<bool, ApiError> {
        Ok(self.transport.vault().access_token()?.is_some())
    }

    pub fn user_email(&self) -> Result<Option<String>, ApiError> {
        Ok(self.transport.vault().user_email()?)
    }

    fn auth_endpoint(&self, name: &str) -> String {
        self.transport.settings().auth_endpoint(name)
    }

    // ===== Generic Requests =====

    pub async fn send(&self, request: RequestDescriptor) -> Result<HttpResponse, ApiError> {
        self.transport.send(request).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(RequestDescriptor::get(path)).await?.json()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.send(RequestDescriptor::post(path).json(body)?).await?.json()
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        self.send(RequestDescriptor::put(path).json(body)?).await?.json()
    }

    /// DELETE `path`, ignoring any response body.
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(RequestDescriptor::delete(path)).await?;
        Ok(())
    }

    // ===== Session =====

    /// Sign in and store the issued token pair.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<AuthResponse, ApiError> {
        let auth: AuthResponse = self.post(&self.auth_endpoint("login"), credentials).await?;
        self.start_session(&auth)?;
        Ok(auth)
    }

    /// Create an account and store the issued token pair.
    pub async fn register(&self, credentials: &RegisterCredentials) -> Result<AuthResponse, ApiError> {
        let auth: AuthResponse = self.post(&self.auth_endpoint("register"), credentials).await?;
        self.start_session(&auth)?;
        Ok(auth)
    }

    fn start_session(&self, auth: &AuthResponse) -> Result<(), ApiError> {
        let vault = self.transport.vault();
        vault.replace(&CredentialPair::new(auth.access_token.clone(), auth.refresh_token.clone()))?;
        vault.set_user_email(&auth.email)?;
        info!(email = %auth.email, "Signed in");
        self.transport.publish(SessionEvent::LoggedIn {
            email: auth.email.clone(),
        });
        Ok(())
    }

    /// Exchange `refresh_token` for a new pair without touching the store.
    ///
    /// The transport renews tokens on its own; this is for callers that
    /// manage a token pair themselves.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let request = RequestDescriptor::post(self.auth_endpoint("refresh"))
            .raw_body(refresh_token.as_bytes().to_vec(), "application/json");
        self.send(request).await?.json()
    }

    /// Forget the stored session.
    pub fn logout(&self) -> Result<(), ApiError> {
        let vault = self.transport.vault();
        vault.clear()?;
        vault.clear_user_email()?;
        info!("Signed out");
        self.transport.publish(SessionEvent::LoggedOut);
        Ok(())
    }

    /// Delete the signed-in account on the server, then sign out locally.
    pub async fn delete_user(&self) -> Result<(), ApiError> {
        self.delete(USER_PATH).await?;
        debug!("Account deleted");
        self.logout()
    }

    // ===== Data Fetching Methods =====

    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.get(HEALTH_PATH).await
    }
}
