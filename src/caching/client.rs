//! Client for the upstream context-cache API

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Model name the cache API expects on creation
const CACHE_MODEL: &str = "moonshot-v1";

/// A server-side context cache
///
/// Only the fields the proxy acts on are read; `null` counts as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Cache {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Cache {
    /// Caches in the `error` state cannot be attached to requests
    pub fn is_usable(&self) -> bool {
        self.status != "error"
    }
}

#[derive(Serialize)]
struct CreateCache<'a> {
    model: &'static str,
    messages: &'a RawValue,
    tools: Option<&'a RawValue>,
    ttl: u64,
}

/// Raw `messages` and `tools` of a chat request, forwarded as-is on creation
#[derive(Debug, Deserialize)]
pub struct RawCacheBody<'a> {
    #[serde(borrow)]
    pub messages: &'a RawValue,
    #[serde(default, borrow)]
    pub tools: Option<&'a RawValue>,
}

/// Thin wrapper over the `/v1/caching` endpoints
#[derive(Clone)]
pub struct CachingClient {
    client: reqwest::Client,
    endpoint: String,
}

impl CachingClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    fn url(&self, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/v1/caching/{}", self.endpoint, id),
            None => format!("{}/v1/caching", self.endpoint),
        }
    }

    /// `POST /v1/caching`
    pub async fn create(
        &self,
        key: &str,
        messages: &RawValue,
        tools: Option<&RawValue>,
        ttl: Duration,
    ) -> Result<Cache> {
        let body = CreateCache {
            model: CACHE_MODEL,
            messages,
            tools,
            ttl: ttl.as_secs(),
        };
        let response = self
            .client
            .post(self.url(None))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("Failed to send cache create request")?
            .error_for_status()
            .context("Cache create rejected")?;
        response
            .json::<Cache>()
            .await
            .context("Failed to decode created cache")
    }

    /// `GET /v1/caching/{id}`
    pub async fn get(&self, key: &str, id: &str) -> Result<Cache> {
        let response = self
            .client
            .get(self.url(Some(id)))
            .bearer_auth(key)
            .send()
            .await
            .context("Failed to send cache get request")?
            .error_for_status()
            .context("Cache get rejected")?;
        response.json::<Cache>().await.context("Failed to decode cache")
    }

    /// `DELETE /v1/caching/{id}`
    pub async fn delete(&self, key: &str, id: &str) -> Result<()> {
        self.client
            .delete(self.url(Some(id)))
            .bearer_auth(key)
            .send()
            .await
            .context("Failed to send cache delete request")?
            .error_for_status()
            .context("Cache delete rejected")?;
        Ok(())
    }
}
