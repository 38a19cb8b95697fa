//! Authenticated request dispatch with transparent token renewal.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::SessionEvent;
use super::exchange::HttpExchange;
use super::refresh::{RefreshFailure, RefreshGate, RefreshLease, RefreshOutcome, Ticket};
use super::request::{authorized_headers, resolve_url, HttpResponse, PreparedRequest, RequestDescriptor};
use crate::api::ApiError;
use crate::auth::{CredentialPair, CredentialVault};
use crate::models::RefreshResponse;

/// Default route prefix of the authentication controller.
pub const DEFAULT_AUTH_PATH: &str = "Auth";

/// Upper bound on a refresh call. Waiters are stuck until it resolves.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// Capacity of the session event channel; slow subscribers lag, senders never block.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Auth endpoints whose 401s are returned as-is instead of triggering a refresh.
const EXCLUDED_AUTH_ENDPOINTS: [&str; 3] = ["login", "register", "refresh"];

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub base_url: String,
    pub auth_path: String,
    pub refresh_timeout: Duration,
}

impl TransportSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_path: DEFAULT_AUTH_PATH.to_string(),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    /// Path of an endpoint on the auth controller, e.g. `Auth/login`.
    pub fn auth_endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.auth_path, name)
    }

    pub fn is_excluded_endpoint(&self, url: &str) -> bool {
        EXCLUDED_AUTH_ENDPOINTS
            .iter()
            .any(|name| url.contains(&self.auth_endpoint(name)))
    }
}

/// Everything the transport shares between clones.
pub struct SessionState {
    exchange: Arc<dyn HttpExchange>,
    vault: CredentialVault,
    gate: Arc<RefreshGate>,
    events: broadcast::Sender<SessionEvent>,
    settings: TransportSettings,
}

/// Drop-in replacement for a plain HTTP client that keeps the session alive.
///
/// Clones share credentials, refresh state and the event channel.
#[derive(Clone)]
pub struct SessionTransport {
    state: Arc<SessionState>,
}

impl SessionTransport {
    pub fn new(exchange: Arc<dyn HttpExchange>, vault: CredentialVault, settings: TransportSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(SessionState {
                exchange,
                vault,
                gate: RefreshGate::new(),
                events,
                settings,
            }),
        }
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.state.vault
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.state.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.events.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.state.events.send(event);
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.gate.is_refreshing()
    }

    /// Send `request` with the stored access token.
    ///
    /// A 401 triggers at most one renewal and one replay. Other failures,
    /// and 401s from the auth endpoints, come back as errors untouched.
    pub async fn send(&self, mut request: RequestDescriptor) -> Result<HttpResponse, ApiError> {
        let mut token = self.state.vault.access_token()?;

        loop {
            let response = self.dispatch(&request, token.as_deref()).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Self::check_response(response);
            }

            if self.state.settings.is_excluded_endpoint(&request.url) {
                debug!(url = %request.url, "401 from auth endpoint, passing through");
                return Self::check_response(response);
            }
            if request.already_retried() {
                warn!(url = %request.url, "Request rejected again after token refresh");
                return Self::check_response(response);
            }

            request.mark_retried();
            let renewed = self.renewed_token(token.as_deref()).await?;
            token = Some(renewed);
        }
    }

    fn check_response(response: HttpResponse) -> Result<HttpResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status(), &response.text()))
        }
    }

    async fn dispatch(&self, request: &RequestDescriptor, token: Option<&str>) -> Result<HttpResponse, ApiError> {
        let prepared = PreparedRequest {
            method: request.method.clone(),
            url: resolve_url(&self.state.settings.base_url, &request.url),
            headers: authorized_headers(request, token)?,
            body: request.body.clone(),
        };
        debug!(
            method = %prepared.method,
            url = %prepared.url,
            authenticated = token.is_some(),
            replay = request.already_retried(),
            "Sending request"
        );
        self.state.exchange.execute(prepared).await
    }

    /// Obtain an access token newer than `rejected`, sharing a single refresh
    /// with every other caller that needs one at the same time.
    async fn renewed_token(&self, rejected: Option<&str>) -> Result<String, ApiError> {
        let state = &self.state;
        let ticket = state.gate.join(rejected, || state.vault.access_token())?;

        match ticket {
            Ticket::Current(token) => {
                debug!("Access token already renewed, replaying");
                Ok(token)
            }
            Ticket::Waiter(rx) => match rx.await {
                Ok(outcome) => outcome.map_err(ApiError::from),
                Err(_) => Err(ApiError::AuthExpired("token refresh was abandoned".into())),
            },
            Ticket::Leader(lease) => {
                // Run detached so a cancelled caller cannot strand the waiters.
                let transport = self.clone();
                let handle = tokio::spawn(async move { transport.run_refresh(lease).await });
                match handle.await {
                    Ok(outcome) => outcome.map_err(ApiError::from),
                    Err(e) => Err(ApiError::AuthExpired(format!("token refresh task failed: {}", e))),
                }
            }
        }
    }

    async fn run_refresh(&self, lease: RefreshLease) -> RefreshOutcome {
        let renewed = match self.request_new_pair().await {
            Ok(pair) => self
                .state
                .vault
                .replace(&pair)
                .map(|()| pair)
                .map_err(|e| RefreshFailure::new(format!("failed to store renewed credentials: {}", e))),
            Err(failure) => Err(failure),
        };

        match renewed {
            Ok(pair) => {
                let released = lease.settle(Ok(pair.access_token.clone()));
                info!(released, "Access token refreshed");
                self.publish(SessionEvent::Refreshed);
                Ok(pair.access_token)
            }
            Err(failure) => {
                warn!(reason = %failure.reason, "Token refresh failed, ending session");
                if let Err(e) = self.state.vault.clear() {
                    warn!(error = %e, "Failed to clear stored credentials");
                }
                let rejected = lease.settle(Err(failure.clone()));
                debug!(rejected, "Rejected queued requests");
                self.publish(SessionEvent::expired(failure.reason.clone()));
                Err(failure)
            }
        }
    }

    async fn request_new_pair(&self) -> Result<CredentialPair, RefreshFailure> {
        let refresh_token = self
            .state
            .vault
            .refresh_token()
            .map_err(|e| RefreshFailure::new(format!("failed to read refresh token: {}", e)))?
            .ok_or_else(|| RefreshFailure::new("no refresh token stored"))?;

        // The endpoint takes the bare token as its JSON body.
        let request = RequestDescriptor::post(self.state.settings.auth_endpoint("refresh"))
            .raw_body(refresh_token.into_bytes(), "application/json");
        let access_token = self.state.vault.access_token().ok().flatten();

        let timeout = self.state.settings.refresh_timeout;
        let response = match tokio::time::timeout(timeout, self.dispatch(&request, access_token.as_deref())).await {
            Err(_) => return Err(RefreshFailure::new(format!("refresh timed out after {:?}", timeout))),
            Ok(Err(e)) => return Err(RefreshFailure::new(format!("refresh request failed: {}", e))),
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            return Err(RefreshFailure::new(format!("refresh endpoint returned {}", response.status())));
        }

        let renewed: RefreshResponse = response
            .json()
            .map_err(|e| RefreshFailure::new(e.to_string()))?;
        Ok(CredentialPair::new(renewed.token, renewed.refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use reqwest::header;

    use super::*;
    use crate::auth::CredentialStore;
    use crate::transport::events::UNAUTHENTICATED_ROOT;
    use crate::transport::testing::{json, status, token_server, transport_with, ScriptedExchange};

    fn expired_pair() -> Option<CredentialPair> {
        Some(CredentialPair::new("old-at", "old-rt"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_401s_share_one_refresh() {
        let exchange = Arc::new(token_server("new-at").with_refresh_delay(Duration::from_millis(50)));
        let (transport, _) = transport_with(exchange.clone(), expired_pair());

        let (a, b, c) = tokio::join!(
            transport.send(RequestDescriptor::get("a")),
            transport.send(RequestDescriptor::get("b")),
            transport.send(RequestDescriptor::get("c")),
        );
        for result in [a, b, c] {
            assert!(result.unwrap().is_success());
        }

        let refreshes = exchange.refresh_calls();
        assert_eq!(refreshes.len(), 1);
        assert_eq!(refreshes[0].body.as_deref(), Some(b"old-rt".as_slice()));
        assert_eq!(refreshes[0].headers.get(header::CONTENT_TYPE).unwrap(), "application/json");

        for path in ["/a", "/b", "/c"] {
            let calls = exchange.calls_to(path);
            assert_eq!(calls.len(), 2, "{path} should be sent once and replayed once");
            assert_eq!(calls[0].bearer_token(), Some("old-at"));
            assert_eq!(calls[1].bearer_token(), Some("new-at"));
        }

        let snap = transport.vault().snapshot().unwrap();
        assert_eq!(snap.access_token.as_deref(), Some("new-at"));
        assert_eq!(snap.refresh_token.as_deref(), Some("new-rt"));
        assert!(!transport.is_refreshing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_spawned_requests_share_one_refresh() {
        let exchange = Arc::new(token_server("new-at").with_refresh_delay(Duration::from_millis(20)));
        let (transport, _) = transport_with(exchange.clone(), expired_pair());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let transport = transport.clone();
                tokio::spawn(async move { transport.send(RequestDescriptor::get(format!("sensor/{i}"))).await })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(exchange.refresh_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_request_is_not_retried_twice() {
        let exchange = Arc::new(ScriptedExchange::new(|req| {
            if req.url.ends_with("Auth/refresh") {
                json(StatusCode::OK, serde_json::json!({"token": "new-at", "refreshToken": "new-rt"}))
            } else {
                Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, "greenhouse belongs to another account"))
            }
        }));
        let (transport, _) = transport_with(exchange.clone(), expired_pair());

        let result = transport.send(RequestDescriptor::get("Greenhouse")).await;

        assert!(matches!(result, Err(ApiError::Unauthorized(ref body)) if body == "greenhouse belongs to another account"));
        assert_eq!(exchange.refresh_calls().len(), 1);
        assert_eq!(exchange.calls_to("/Greenhouse").len(), 2);
    }

    #[tokio::test]
    async fn test_auth_endpoints_never_trigger_refresh() {
        let exchange = Arc::new(ScriptedExchange::new(|_| status(StatusCode::UNAUTHORIZED)));
        let (transport, _) = transport_with(exchange.clone(), expired_pair());

        for url in ["Auth/login", "Auth/register", "Auth/refresh"] {
            let result = transport.send(RequestDescriptor::post(url)).await;
            assert!(matches!(result, Err(ApiError::Unauthorized(_))), "{url}");
        }

        assert_eq!(exchange.requests().len(), 3);
        // Credentials are left alone
        assert_eq!(transport.vault().access_token().unwrap().as_deref(), Some("old-at"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_refresh_ends_session() {
        let exchange = Arc::new(
            ScriptedExchange::new(|req| {
                if req.url.ends_with("Auth/refresh") {
                    status(StatusCode::INTERNAL_SERVER_ERROR)
                } else {
                    status(StatusCode::UNAUTHORIZED)
                }
            })
            .with_refresh_delay(Duration::from_millis(30)),
        );
        let (transport, _) = transport_with(exchange.clone(), expired_pair());
        let mut events = transport.subscribe();

        let (a, b, c) = tokio::join!(
            transport.send(RequestDescriptor::get("a")),
            transport.send(RequestDescriptor::get("b")),
            transport.send(RequestDescriptor::get("c")),
        );
        for result in [a, b, c] {
            assert!(matches!(result, Err(ApiError::AuthExpired(_))));
        }

        assert_eq!(exchange.refresh_calls().len(), 1);
        let snap = transport.vault().snapshot().unwrap();
        assert_eq!(snap.access_token, None);
        assert_eq!(snap.refresh_token, None);

        match events.recv().await.unwrap() {
            SessionEvent::Expired { redirect_to, reason } => {
                assert_eq!(redirect_to, UNAUTHENTICATED_ROOT);
                assert!(reason.contains("500"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_calling_endpoint() {
        let exchange = Arc::new(token_server("new-at"));
        let (transport, store) = transport_with(exchange.clone(), None);
        store.set("accessToken", "old-at").unwrap();

        let result = transport.send(RequestDescriptor::get("Preset")).await;

        assert!(matches!(result, Err(ApiError::AuthExpired(ref r)) if r.contains("no refresh token")));
        assert!(exchange.refresh_calls().is_empty());
        assert_eq!(store.get("accessToken").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_is_a_failure() {
        let exchange = Arc::new(token_server("new-at").with_refresh_delay(Duration::from_secs(120)));
        let (transport, _) = transport_with(exchange.clone(), expired_pair());

        let result = transport.send(RequestDescriptor::get("Preset")).await;

        assert!(matches!(result, Err(ApiError::AuthExpired(ref r)) if r.contains("timed out")));
        assert_eq!(transport.vault().snapshot().unwrap().refresh_token, None);
        assert!(!transport.is_refreshing());
    }

    #[tokio::test]
    async fn test_malformed_refresh_response_fails_closed() {
        let exchange = Arc::new(ScriptedExchange::new(|req| {
            if req.url.ends_with("Auth/refresh") {
                // Older field name for the access token is not accepted
                json(StatusCode::OK, serde_json::json!({"accessToken": "new-at", "refreshToken": "new-rt"}))
            } else {
                status(StatusCode::UNAUTHORIZED)
            }
        }));
        let (transport, _) = transport_with(exchange.clone(), expired_pair());

        let result = transport.send(RequestDescriptor::get("Preset")).await;

        assert!(matches!(result, Err(ApiError::AuthExpired(_))));
        assert_eq!(transport.vault().snapshot().unwrap().access_token, None);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through_without_refresh() {
        let exchange = Arc::new(ScriptedExchange::new(|req| {
            if req.url.ends_with("/down") {
                status(StatusCode::SERVICE_UNAVAILABLE)
            } else if req.url.ends_with("/missing") {
                status(StatusCode::NOT_FOUND)
            } else {
                Err(ApiError::Transport("connection reset".into()))
            }
        }));
        let (transport, _) = transport_with(exchange.clone(), expired_pair());

        assert!(matches!(transport.send(RequestDescriptor::get("down")).await, Err(ApiError::ServerError(_))));
        assert!(matches!(transport.send(RequestDescriptor::get("missing")).await, Err(ApiError::NotFound(_))));
        assert!(matches!(transport.send(RequestDescriptor::get("reset")).await, Err(ApiError::Transport(_))));
        assert!(exchange.refresh_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_request_has_no_bearer() {
        let exchange = Arc::new(ScriptedExchange::new(|_| json(StatusCode::OK, serde_json::json!({"status": "Healthy"}))));
        let (transport, _) = transport_with(exchange.clone(), None);

        transport.send(RequestDescriptor::get("Health")).await.unwrap();

        let sent = exchange.requests();
        assert_eq!(sent[0].url, "http://greenhouse.test/api/Health");
        assert!(sent[0].headers.get(header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn test_token_renewed_elsewhere_is_reused() {
        let store_slot: Arc<std::sync::OnceLock<Arc<crate::auth::MemoryStore>>> = Arc::new(std::sync::OnceLock::new());
        let rejections = Arc::new(AtomicUsize::new(0));

        let exchange = {
            let store_slot = store_slot.clone();
            let rejections = rejections.clone();
            Arc::new(ScriptedExchange::new(move |req| {
                if req.bearer_token() == Some("new-at") {
                    return json(StatusCode::OK, serde_json::json!({}));
                }
                // Another client finished a refresh while this request was in flight.
                rejections.fetch_add(1, Ordering::SeqCst);
                let store = store_slot.get().unwrap();
                store.set("accessToken", "new-at").unwrap();
                store.set("refreshToken", "new-rt").unwrap();
                status(StatusCode::UNAUTHORIZED)
            }))
        };
        let (transport, store) = transport_with(exchange.clone(), expired_pair());
        store_slot.set(store).unwrap();

        transport.send(RequestDescriptor::get("Preset")).await.unwrap();

        assert_eq!(rejections.load(Ordering::SeqCst), 1);
        assert!(exchange.refresh_calls().is_empty());
    }

    #[tokio::test]
    async fn test_successful_refresh_publishes_event() {
        let exchange = Arc::new(token_server("new-at"));
        let (transport, _) = transport_with(exchange, expired_pair());
        let mut events = transport.subscribe();

        transport.send(RequestDescriptor::get("Preset")).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);
    }

    #[test]
    fn test_excluded_endpoint_matching() {
        let settings = TransportSettings::new("http://h/api/");
        assert!(settings.is_excluded_endpoint("Auth/login"));
        assert!(settings.is_excluded_endpoint("/Auth/register"));
        assert!(settings.is_excluded_endpoint("http://h/api/Auth/refresh"));
        assert!(!settings.is_excluded_endpoint("User"));
        assert!(!settings.is_excluded_endpoint("auth/login"));
        assert!(!settings.is_excluded_endpoint("Auth/logout"));
    }
}
