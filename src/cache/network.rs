use futures::future::BoxFuture;
use thiserror::Error;

use super::{CacheRequest, StoredResponse};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("invalid request url {0}")]
    InvalidUrl(String),
}

/// Live fetches made by the cache manager.
pub trait Network: Send + Sync {
    /// Perform the request. Any HTTP status counts as success; only transport
    /// failures are errors.
    fn fetch<'a>(
        &'a self,
        request: &'a CacheRequest,
    ) -> BoxFuture<'a, Result<StoredResponse, NetworkError>>;
}

/// [`Network`] backed by reqwest, resolving relative URLs against an origin.
#[derive(Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
    origin: reqwest::Url,
}

impl HttpNetwork {
    pub fn new(origin: &str) -> Result<Self, NetworkError> {
        let origin =
            reqwest::Url::parse(origin).map_err(|_| NetworkError::InvalidUrl(origin.to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            origin,
        })
    }

    async fn send(&self, request: &CacheRequest) -> Result<StoredResponse, NetworkError> {
        let url = self
            .origin
            .join(&request.url)
            .map_err(|_| NetworkError::InvalidUrl(request.url.clone()))?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| NetworkError::InvalidUrl(request.url.clone()))?;

        let response = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(|e| NetworkError::Unreachable(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| NetworkError::Unreachable(e.to_string()))?;

        Ok(StoredResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

impl Network for HttpNetwork {
    fn fetch<'a>(
        &'a self,
        request: &'a CacheRequest,
    ) -> BoxFuture<'a, Result<StoredResponse, NetworkError>> {
        Box::pin(self.send(request))
    }
}
