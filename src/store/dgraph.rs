//! Dgraph HTTP client
//!
//! Speaks the `/query`, `/mutate`, `/alter` and `/health` endpoints of a
//! Dgraph alpha. Response bodies are wrapped in a `{"data", "errors"}`
//! envelope; a non-empty `errors` array is reported as
//! [`StoreError::Remote`] even when the status code is 200.

use crate::config::StoreConfig;
use crate::store::{Assigned, GraphStore, Mutation, StoreError, Vars};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};

/// Dgraph over its HTTP API
///
/// Queries run read-only in best-effort mode (`ro=true&be=true`) and every
/// mutation is sent with `commitNow=true`, so no transaction outlives a
/// single call.
#[derive(Debug, Clone)]
pub struct DgraphStore {
    client: Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    #[serde(default)]
    message: String,
}

impl DgraphStore {
    /// Creates a store client for `config.address`
    ///
    /// # Arguments
    ///
    /// * `config` - Store address and per-request timeout
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self::with_client(client, &config.address))
    }

    /// Uses an existing client; a trailing `/` on `address` is ignored
    pub fn with_client(client: Client, address: &str) -> Self {
        Self {
            client,
            base: address.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, StoreError> {
        let response = check_status(response).await?;
        let envelope: Envelope<T> = serde_json::from_slice(&response.bytes().await?)?;

        if !envelope.errors.is_empty() {
            let messages: Vec<String> = envelope.errors.into_iter().map(|e| e.message).collect();
            return Err(StoreError::Remote(messages.join("; ")));
        }
        envelope
            .data
            .ok_or_else(|| StoreError::Remote("response has no data".to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl GraphStore for DgraphStore {
    async fn query(&self, query: &str, vars: &Vars) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(self.endpoint("query"))
            .query(&[("ro", "true"), ("be", "true")])
            .json(&json!({ "query": query, "variables": vars }))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<Assigned, StoreError> {
        let response = self
            .client
            .post(self.endpoint("mutate"))
            .query(&[("commitNow", "true")])
            .json(&mutation)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn health(&self) -> Result<(), StoreError> {
        let response = self.client.get(self.endpoint("health")).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn alter(&self, schema: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.endpoint("alter"))
            .body(schema.to_string())
            .send()
            .await?;
        let _: Value = Self::decode(response).await?;
        Ok(())
    }
}
