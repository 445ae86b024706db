//! Request classification and fetch strategies.
//!
//! Every intercepted request is classified exactly once, then routed:
//! navigations are network-first with an offline fallback, same-origin GETs
//! follow the configured runtime policy, and everything else passes through
//! untouched.

use std::sync::Arc;

use http::StatusCode;
use pondokit_net::{NetworkBackend, Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStore};
use crate::config::RuntimeStrategy;
use crate::exclude::ExclusionFilter;
use crate::{FetchEvent, SwError, SwEvent};

/// Classification of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Matches an exclusion prefix; never intercepted.
    Excluded,
    /// Top-level document load.
    Navigation,
    /// Same-origin GET, eligible for runtime caching.
    Runtime,
    /// Non-GET or unclassified; proceeds as an ordinary network call.
    PassThrough,
}

/// Classify a fetch event.
///
/// Exclusion wins over everything else: excluded traffic is invisible to the
/// worker even when it is a navigation.
pub fn classify(event: &FetchEvent, scope: &Url, filter: &ExclusionFilter) -> RequestClass {
    let url = &event.request.url;

    if filter.is_excluded(url) {
        return RequestClass::Excluded;
    }
    if event.is_navigation {
        return RequestClass::Navigation;
    }
    if event.request.is_get() && url.origin() == scope.origin() {
        return RequestClass::Runtime;
    }
    RequestClass::PassThrough
}

/// Outcome of handling a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The worker answers the request with this response.
    Respond(Response),
    /// The worker declines; the request proceeds as an ordinary,
    /// uncached network call.
    PassThrough,
}

impl FetchOutcome {
    /// The response, if the worker answered.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            FetchOutcome::PassThrough => None,
        }
    }
}

/// Routes intercepted requests to the strategy their class calls for.
///
/// Built once per worker: the exclusion patterns are compiled and the
/// fallback URL resolved at construction, not per request.
pub struct FetchRouter {
    store: Arc<dyn CacheStore>,
    net: Arc<dyn NetworkBackend>,
    filter: ExclusionFilter,
    scope: Url,
    bucket: String,
    fallback: Url,
    strategy: RuntimeStrategy,
    events: mpsc::UnboundedSender<SwEvent>,
}

impl FetchRouter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn CacheStore>,
        net: Arc<dyn NetworkBackend>,
        filter: ExclusionFilter,
        scope: Url,
        bucket: String,
        fallback: Url,
        strategy: RuntimeStrategy,
        events: mpsc::UnboundedSender<SwEvent>,
    ) -> Self {
        Self {
            store,
            net,
            filter,
            scope,
            bucket,
            fallback,
            strategy,
            events,
        }
    }

    /// Route a fetch event.
    pub async fn route(&self, event: &FetchEvent) -> Result<FetchOutcome, SwError> {
        match classify(event, &self.scope, &self.filter) {
            RequestClass::Excluded => {
                debug!(url = %event.request.url, "Excluded prefix, passing through");
                Ok(FetchOutcome::PassThrough)
            }
            RequestClass::PassThrough => {
                trace!(url = %event.request.url, method = %event.request.method, "Unclassified, passing through");
                Ok(FetchOutcome::PassThrough)
            }
            RequestClass::Navigation => {
                Ok(FetchOutcome::Respond(self.navigation(&event.request).await))
            }
            RequestClass::Runtime => {
                let response = match self.strategy {
                    RuntimeStrategy::StaleWhileRevalidate => {
                        self.stale_while_revalidate(&event.request).await?
                    }
                    RuntimeStrategy::CacheFirst => self.cache_first(&event.request).await?,
                };
                Ok(FetchOutcome::Respond(response))
            }
        }
    }

    /// Network-first navigation with offline fallback.
    ///
    /// Any HTTP response counts as success; only transport errors trigger
    /// the fallback chain. Never fails: the final fallback is a synthesized
    /// 503 so the page never sees an unhandled rejection.
    async fn navigation(&self, request: &Request) -> Response {
        match self.net.fetch(request).await {
            Ok(response) => {
                trace!(url = %request.url, status = %response.status, "Navigation served from network");
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Navigation fetch failed, using offline fallback");
                self.offline_fallback(&request.url).await
            }
        }
    }

    /// The cached offline page, or a synthesized 503 if it is missing.
    async fn offline_fallback(&self, requested: &Url) -> Response {
        let cached = match self
            .store
            .match_request(&self.bucket, self.fallback.as_str())
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Offline fallback lookup failed");
                None
            }
        };

        cached
            .and_then(|entry| entry.to_response().ok())
            .unwrap_or_else(|| {
                Response::synthetic(requested.clone(), StatusCode::SERVICE_UNAVAILABLE, "Offline")
            })
    }

    /// Stale-while-revalidate: answer from the cache instantly when
    /// possible, refresh in the background for the next request.
    async fn stale_while_revalidate(&self, request: &Request) -> Result<Response, SwError> {
        match self.lookup(request.url.as_str()).await {
            Some(entry) => {
                trace!(url = %request.url, "Cache hit, revalidating in background");
                self.spawn_revalidation(request.clone());
                entry.to_response()
            }
            None => {
                let response = self.net.fetch(request).await?;
                self.store_if_fresh(&response).await;
                Ok(response)
            }
        }
    }

    /// Cache-first: only a miss touches the network; a miss that also fails
    /// on the network falls back to the cached offline page.
    async fn cache_first(&self, request: &Request) -> Result<Response, SwError> {
        if let Some(entry) = self.lookup(request.url.as_str()).await {
            trace!(url = %request.url, "Cache hit");
            return entry.to_response();
        }

        match self.net.fetch(request).await {
            Ok(response) => {
                self.store_if_fresh(&response).await;
                Ok(response)
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache-first miss failed on network");
                match self
                    .store
                    .match_request(&self.bucket, self.fallback.as_str())
                    .await
                {
                    Ok(Some(entry)) => entry.to_response(),
                    _ => Err(e.into()),
                }
            }
        }
    }

    /// Cache lookup that degrades a store error to a miss.
    async fn lookup(&self, url: &str) -> Option<CacheEntry> {
        match self.store.match_request(&self.bucket, url).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(url = %url, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Store a copy of a 200 response. Write failures are logged and
    /// swallowed: the cache is an optimization, not the source of truth.
    async fn store_if_fresh(&self, response: &Response) {
        if response.status != StatusCode::OK {
            return;
        }
        if let Err(e) = self
            .store
            .put(&self.bucket, CacheEntry::from_response(response))
            .await
        {
            warn!(url = %response.url, error = %e, "Cache write failed");
        }
    }

    /// Refresh a cached entry in the background. Completion is reported via
    /// `SwEvent::Revalidated` whether or not the refresh stored anything.
    fn spawn_revalidation(&self, request: Request) {
        let store = Arc::clone(&self.store);
        let net = Arc::clone(&self.net);
        let bucket = self.bucket.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let refreshed = match net.fetch(&request).await {
                Ok(response) if response.status == StatusCode::OK => {
                    match store.put(&bucket, CacheEntry::from_response(&response)).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(url = %request.url, error = %e, "Cache refresh write failed");
                            false
                        }
                    }
                }
                Ok(response) => {
                    trace!(url = %request.url, status = %response.status, "Revalidation skipped non-200");
                    false
                }
                Err(e) => {
                    debug!(url = %request.url, error = %e, "Background revalidation failed");
                    false
                }
            };

            let _ = events.send(SwEvent::Revalidated {
                url: request.url.to_string(),
                refreshed,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn filter(prefixes: &[&str]) -> ExclusionFilter {
        let prefixes: Vec<String> = prefixes.iter().map(|s| s.to_string()).collect();
        ExclusionFilter::compile(&prefixes).unwrap()
    }

    fn scope() -> Url {
        Url::parse("https://pondo.app/").unwrap()
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[test]
    fn test_classify_navigation() {
        let event = FetchEvent::navigation(get("https://pondo.app/"));
        assert_eq!(
            classify(&event, &scope(), &filter(&[])),
            RequestClass::Navigation
        );
    }

    #[test]
    fn test_classify_runtime_same_origin_get() {
        let event = FetchEvent::subresource(get("https://pondo.app/styles.css"));
        assert_eq!(
            classify(&event, &scope(), &filter(&[])),
            RequestClass::Runtime
        );
    }

    #[test]
    fn test_classify_cross_origin_passes_through() {
        let event = FetchEvent::subresource(get("https://cdn.other.net/font.woff2"));
        assert_eq!(
            classify(&event, &scope(), &filter(&[])),
            RequestClass::PassThrough
        );
    }

    #[test]
    fn test_classify_non_get_passes_through() {
        let mut request = get("https://pondo.app/ledger");
        request.method = Method::POST;
        let event = FetchEvent::subresource(request);
        assert_eq!(
            classify(&event, &scope(), &filter(&[])),
            RequestClass::PassThrough
        );
    }

    #[test]
    fn test_classify_exclusion_wins_over_navigation() {
        let event = FetchEvent::navigation(get("https://auth.example.co/login"));
        assert_eq!(
            classify(&event, &scope(), &filter(&["https://*.example.co"])),
            RequestClass::Excluded
        );
    }

    #[test]
    fn test_fetch_outcome_response_accessor() {
        let response = Response::synthetic(scope(), StatusCode::OK, "ok");
        let outcome = FetchOutcome::Respond(response);
        assert!(outcome.response().is_some());
        assert!(FetchOutcome::PassThrough.response().is_none());
    }
}
