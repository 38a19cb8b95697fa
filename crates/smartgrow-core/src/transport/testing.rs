//! Scripted HTTP exchange for exercising the session layer without a server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::exchange::HttpExchange;
use super::request::{HttpResponse, PreparedRequest};
use super::session::{SessionTransport, TransportSettings};
use crate::api::ApiError;
use crate::auth::{CredentialPair, CredentialVault, MemoryStore};

type Handler = dyn Fn(&PreparedRequest) -> Result<HttpResponse, ApiError> + Send + Sync;

pub struct ScriptedExchange {
    handler: Box<Handler>,
    refresh_delay: Duration,
    log: Mutex<Vec<PreparedRequest>>,
}

impl ScriptedExchange {
    pub fn new(handler: impl Fn(&PreparedRequest) -> Result<HttpResponse, ApiError> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            refresh_delay: Duration::ZERO,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Delay responses from the refresh endpoint.
    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<PreparedRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn refresh_calls(&self) -> Vec<PreparedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.ends_with("Auth/refresh"))
            .collect()
    }

    pub fn calls_to(&self, suffix: &str) -> Vec<PreparedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.ends_with(suffix))
            .collect()
    }
}

#[async_trait]
impl HttpExchange for ScriptedExchange {
    async fn execute(&self, request: PreparedRequest) -> Result<HttpResponse, ApiError> {
        self.log.lock().unwrap().push(request.clone());
        if request.url.ends_with("Auth/refresh") && !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        (self.handler)(&request)
    }
}

pub fn json(status: StatusCode, body: serde_json::Value) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::new(status, body.to_string()))
}

pub fn status(status: StatusCode) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::new(status, Vec::new()))
}

/// Backend that accepts only `valid` as bearer token and renews to
/// `new-at`/`new-rt` when asked.
pub fn token_server(valid: &'static str) -> ScriptedExchange {
    ScriptedExchange::new(move |req| {
        if req.url.ends_with("Auth/refresh") {
            return json(StatusCode::OK, serde_json::json!({"token": "new-at", "refreshToken": "new-rt"}));
        }
        if req.bearer_token() == Some(valid) {
            json(StatusCode::OK, serde_json::json!({"url": req.url}))
        } else {
            status(StatusCode::UNAUTHORIZED)
        }
    })
}

pub const BASE_URL: &str = "http://greenhouse.test/api/";

/// Transport over `exchange` with a memory store seeded with `pair`.
pub fn transport_with(
    exchange: Arc<ScriptedExchange>,
    pair: Option<CredentialPair>,
) -> (SessionTransport, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let vault = CredentialVault::new(store.clone());
    if let Some(pair) = pair {
        vault.replace(&pair).unwrap();
    }
    let transport = SessionTransport::new(exchange, vault, TransportSettings::new(BASE_URL));
    (transport, store)
}
