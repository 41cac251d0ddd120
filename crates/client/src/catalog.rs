use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::RwLock;

use crate::error::{ChatResult, HttpSnafu};
use crate::transport::{HeaderSource, check_status};

pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(5 * 60);

/// A function an assistant can run, as listed by its library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sample_questions: Vec<String>,
}

impl FunctionDescriptor {
    pub fn title(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    functions: Vec<FunctionDescriptor>,
    fetched_at: Instant,
}

#[derive(Debug)]
struct FunctionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl FunctionCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    async fn get_fresh(&self, assistant_id: &str) -> Option<Vec<FunctionDescriptor>> {
        let entries = self.entries.read().await;
        entries.get(assistant_id).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(entry.functions.clone())
            } else {
                None
            }
        })
    }

    async fn get_any(&self, assistant_id: &str) -> Option<Vec<FunctionDescriptor>> {
        let entries = self.entries.read().await;
        entries
            .get(assistant_id)
            .map(|entry| entry.functions.clone())
    }

    async fn set(&self, assistant_id: &str, functions: Vec<FunctionDescriptor>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            assistant_id.to_string(),
            CacheEntry {
                functions,
                fetched_at: Instant::now(),
            },
        );
    }
}

/// Reads an assistant's function library, caching listings per assistant.
#[derive(Clone)]
pub struct FunctionCatalog {
    client: Client,
    base_url: String,
    headers: Arc<dyn HeaderSource>,
    cache: Arc<FunctionCache>,
}

impl FunctionCatalog {
    pub fn new(base_url: impl Into<String>, headers: impl HeaderSource + 'static) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: Arc::new(headers),
            cache: Arc::new(FunctionCache::new(DEFAULT_CATALOG_TTL)),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache = Arc::new(FunctionCache::new(ttl));
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn functions_url(&self, assistant_id: &str) -> String {
        format!("{}/v1alpha/libraries/{assistant_id}/functions", self.base_url)
    }

    /// Lists the assistant's functions. A failed fetch falls back to the last
    /// listing, however old.
    pub async fn list(&self, assistant_id: &str) -> ChatResult<Vec<FunctionDescriptor>> {
        if let Some(functions) = self.cache.get_fresh(assistant_id).await {
            tracing::trace!(assistant_id, "function listing served from cache");
            return Ok(functions);
        }

        match self.fetch_list(assistant_id).await {
            Ok(functions) => {
                tracing::debug!(assistant_id, count = functions.len(), "function listing fetched");
                self.cache.set(assistant_id, functions.clone()).await;
                Ok(functions)
            }
            Err(error) => match self.cache.get_any(assistant_id).await {
                Some(stale) => {
                    tracing::warn!(assistant_id, error = %error, "serving stale function listing");
                    Ok(stale)
                }
                None => Err(error),
            },
        }
    }

    /// Looks up one function. `None` when the backend does not know it.
    pub async fn get(
        &self,
        assistant_id: &str,
        function_id: &str,
    ) -> ChatResult<Option<FunctionDescriptor>> {
        if let Some(functions) = self.cache.get_fresh(assistant_id).await {
            if let Some(found) = functions.into_iter().find(|function| function.id == function_id) {
                return Ok(Some(found));
            }
        }

        let stage = "get-function";
        let url = format!("{}/{function_id}", self.functions_url(assistant_id));
        let response = self.send(&url, stage).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response.status(), stage)?;
        let function = response.json().await.context(HttpSnafu {
            stage: "decode-function",
        })?;
        Ok(Some(function))
    }

    async fn fetch_list(&self, assistant_id: &str) -> ChatResult<Vec<FunctionDescriptor>> {
        let stage = "list-functions";
        let response = self.send(&self.functions_url(assistant_id), stage).await?;
        check_status(response.status(), stage)?;
        response.json().await.context(HttpSnafu {
            stage: "decode-function-list",
        })
    }

    async fn send(&self, url: &str, stage: &'static str) -> ChatResult<reqwest::Response> {
        let headers = self.headers.headers().await?;
        self.client
            .get(url)
            .headers(headers)
            .send()
            .await
            .context(HttpSnafu { stage })
    }
}
