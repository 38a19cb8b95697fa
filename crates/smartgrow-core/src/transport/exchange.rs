use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::request::{HttpResponse, PreparedRequest};
use crate::api::ApiError;

/// One HTTP round trip. Implementations return every status as a response;
/// only failures to get a response at all are errors.
#[async_trait]
pub trait HttpExchange: Send + Sync {
    async fn execute(&self, request: PreparedRequest) -> Result<HttpResponse, ApiError>;
}

/// [`HttpExchange`] over a pooled `reqwest::Client`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestExchange {
    client: Client,
}

impl ReqwestExchange {
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
    async fn execute(&self, request: PreparedRequest) -> Result<HttpResponse, ApiError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        debug!(method = %request.method, url = %request.url, %status, bytes = body.len(), "Response received");

        Ok(HttpResponse { status, headers, body })
    }
}
