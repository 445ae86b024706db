//! Worker configuration.
//!
//! The inputs the worker is compiled against in the deployed app (version
//! token, app shell manifest, exclusion prefixes) become a deserializable
//! config here so hosts and harnesses can supply them at construction.

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::SwError;

/// Policy for same-origin runtime resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeStrategy {
    /// Answer from the cache immediately when possible, refresh in the
    /// background for future requests.
    #[default]
    StaleWhileRevalidate,
    /// Answer from the cache when possible; only a miss touches the network.
    CacheFirst,
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwConfig {
    /// Version token. Names the cache bucket; must change whenever shell
    /// assets change, or existing installations keep stale copies.
    pub version: String,

    /// Worker scope. Origin anchor for request classification and base for
    /// resolving relative manifest entries.
    pub scope: Url,

    /// App shell manifest: every URL required to boot the UI offline.
    pub shell: Vec<String>,

    /// Navigation fallback page served when the network is unreachable.
    #[serde(default = "default_offline_fallback")]
    pub offline_fallback: String,

    /// URL prefixes (literal or `*` wildcard) whose traffic bypasses the
    /// cache entirely.
    #[serde(default)]
    pub exclusions: Vec<String>,

    /// Runtime resource policy.
    #[serde(default)]
    pub strategy: RuntimeStrategy,
}

fn default_offline_fallback() -> String {
    "offline.html".to_string()
}

impl SwConfig {
    /// The cache bucket name for this worker version.
    pub fn bucket_name(&self) -> &str {
        &self.version
    }

    /// Resolve a manifest path against the worker scope.
    pub fn resolve(&self, path: &str) -> Result<Url, SwError> {
        self.scope
            .join(path)
            .map_err(|e| SwError::ConfigError(format!("cannot resolve {}: {}", path, e)))
    }

    /// The fully-resolved app shell manifest.
    pub fn shell_urls(&self) -> Result<Vec<Url>, SwError> {
        self.shell.iter().map(|path| self.resolve(path)).collect()
    }

    /// The fully-resolved navigation fallback URL.
    pub fn offline_fallback_url(&self) -> Result<Url, SwError> {
        self.resolve(&self.offline_fallback)
    }

    /// Check whether a URL shares the worker's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin()
    }

    /// Validate the configuration.
    ///
    /// The offline fallback is expected to appear in the shell manifest so
    /// it is actually cached at install; a missing entry is logged rather
    /// than rejected, since the worker still functions with the synthesized
    /// fallback.
    pub fn validate(&self) -> Result<(), SwError> {
        if self.version.is_empty() {
            return Err(SwError::ConfigError("version token is empty".to_string()));
        }
        if self.shell.is_empty() {
            return Err(SwError::ConfigError("shell manifest is empty".to_string()));
        }
        if !self.shell.contains(&self.offline_fallback) {
            warn!(
                fallback = %self.offline_fallback,
                "Offline fallback is not in the shell manifest; navigations will \
                 synthesize a response when offline"
            );
        }
        Ok(())
    }
}
