//! Versioned cache buckets and the cache store seam.
//!
//! A bucket maps request identity (effectively a GET URL) to a stored
//! response snapshot. Exactly one bucket is current at any time; the others
//! are condemned for deletion when the worker activates.

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use pondokit_net::{RequestId, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::SwError;

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage.
    ///
    /// Headers whose values are not valid UTF-8 are dropped from the
    /// snapshot; the body is copied in full.
    pub fn from_response(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: response.url.to_string(),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Rebuild a response from this snapshot.
    pub fn to_response(&self) -> Result<Response, SwError> {
        let url = Url::parse(&self.url)
            .map_err(|e| SwError::CacheError(format!("bad cached URL {}: {}", self.url, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }

        Ok(Response {
            request_id: RequestId::new(),
            url,
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: Bytes::from(self.body.clone()),
        })
    }
}

/// Cache store abstraction.
///
/// The worker never touches storage directly; everything goes through this
/// trait so tests can substitute an in-memory fake and hosts can plug in a
/// persistent store. Entries are keyed by URL within a named bucket.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a bucket, creating it if absent.
    async fn open(&self, bucket: &str) -> Result<(), SwError>;

    /// Store an entry, overwriting any prior entry for the same URL.
    async fn put(&self, bucket: &str, entry: CacheEntry) -> Result<(), SwError>;

    /// Look up an entry by URL.
    async fn match_request(&self, bucket: &str, url: &str)
        -> Result<Option<CacheEntry>, SwError>;

    /// Delete a single entry. Returns whether it existed.
    async fn delete(&self, bucket: &str, url: &str) -> Result<bool, SwError>;

    /// All entry URLs in a bucket.
    async fn keys(&self, bucket: &str) -> Result<Vec<String>, SwError>;

    /// All bucket names.
    async fn bucket_names(&self) -> Result<Vec<String>, SwError>;

    /// Delete a whole bucket. Returns whether it existed.
    async fn delete_bucket(&self, bucket: &str) -> Result<bool, SwError>;
}

/// In-memory cache store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    buckets: RwLock<HashMap<String, HashMap<String, CacheEntry>>>,
}

impl MemoryCacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, bucket: &str) -> Result<(), SwError> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default();
        Ok(())
    }

    async fn put(&self, bucket: &str, entry: CacheEntry) -> Result<(), SwError> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_string())
            .or_default()
            .insert(entry.url.clone(), entry);
        Ok(())
    }

    async fn match_request(
        &self,
        bucket: &str,
        url: &str,
    ) -> Result<Option<CacheEntry>, SwError> {
        Ok(self
            .buckets
            .read()
            .await
            .get(bucket)
            .and_then(|entries| entries.get(url))
            .cloned())
    }

    async fn delete(&self, bucket: &str, url: &str) -> Result<bool, SwError> {
        Ok(self
            .buckets
            .write()
            .await
            .get_mut(bucket)
            .map(|entries| entries.remove(url).is_some())
            .unwrap_or(false))
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<String>, SwError> {
        Ok(self
            .buckets
            .read()
            .await
            .get(bucket)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn bucket_names(&self) -> Result<Vec<String>, SwError> {
        Ok(self.buckets.read().await.keys().cloned().collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool, SwError> {
        Ok(self.buckets.write().await.remove(bucket).is_some())
    }
}
