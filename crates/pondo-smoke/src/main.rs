//! Pondo offline smoke harness.
//!
//! Drives the worker runtime through a scripted install → activate → fetch
//! session against an in-process backend, then yanks the network to exercise
//! the offline paths. Prints a JSON summary of phase timings and outcomes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use pondokit_common::{init_logging, LogConfig, PondoError};
use pondokit_net::{NetError, NetworkBackend, Request, Response};
use pondokit_sw::{
    CacheStore, Client, FetchEvent, FetchOutcome, LifecycleEvent, MemoryCacheStore,
    ServiceWorker, SwEvent,
};
use serde_json::json;
use tokio::time::timeout;
use tracing::info;
use url::Url;

/// Worker config for the scripted session. Mirrors what the deployed app
/// compiles into its worker: versioned shell assets plus the auth backend
/// on the exclusion list.
const CONFIG: &str = r#"{
    "version": "pondo-v2",
    "scope": "https://pondo.app/",
    "shell": [
        "/",
        "offline.html",
        "styles.css?v=2",
        "app.js?v=2",
        "manifest.webmanifest"
    ],
    "offline_fallback": "offline.html",
    "exclusions": [
        "https://pondo-auth.supabase.co",
        "https://*.supabase.co"
    ],
    "strategy": "stale-while-revalidate"
}"#;

/// Scripted network backend: a URL table plus an offline switch.
struct ScriptedNet {
    routes: Mutex<HashMap<String, (u16, String)>>,
    offline: AtomicBool,
}

impl ScriptedNet {
    fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    fn route(&self, url: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .expect("route table poisoned")
            .insert(url.to_string(), (status, body.to_string()));
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkBackend for ScriptedNet {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".to_string()));
        }
        let routes = self.routes.lock().expect("route table poisoned");
        match routes.get(request.url.as_str()) {
            Some((status, body)) => Ok(Response::synthetic(
                request.url.clone(),
                StatusCode::from_u16(*status).unwrap_or(StatusCode::OK),
                body.clone(),
            )),
            None => Ok(Response::synthetic(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                "",
            )),
        }
    }
}

/// Wall-clock timings per scenario phase.
struct PhaseTiming {
    phases: Mutex<Vec<(&'static str, Duration)>>,
}

impl PhaseTiming {
    fn new() -> Self {
        Self {
            phases: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, phase: &'static str, duration: Duration) {
        self.phases
            .lock()
            .expect("timings poisoned")
            .push((phase, duration));
    }

    fn summary(&self) -> serde_json::Value {
        let phases = self.phases.lock().expect("timings poisoned");
        let mut summary = serde_json::Map::new();
        for (phase, duration) in phases.iter() {
            let ms = duration.as_secs_f64() * 1000.0;
            summary.insert(phase.to_string(), json!((ms * 100.0).round() / 100.0));
        }
        serde_json::Value::Object(summary)
    }
}

fn seed_routes(net: &ScriptedNet) {
    net.route("https://pondo.app/", 200, "<html>pondo shell</html>");
    net.route(
        "https://pondo.app/offline.html",
        200,
        "<html>you are offline</html>",
    );
    net.route("https://pondo.app/styles.css?v=2", 200, ".counter{}");
    net.route("https://pondo.app/app.js?v=2", 200, "boot()");
    net.route("https://pondo.app/manifest.webmanifest", 200, "{}");
    net.route(
        "https://pondo.app/summary/week.json",
        200,
        r#"{"income":1200,"expense":450}"#,
    );
}

fn get(url: &str) -> Result<Request, PondoError> {
    Url::parse(url)
        .map(Request::get)
        .map_err(|e| PondoError::config(format!("bad scenario URL {}: {}", url, e)))
}

fn body_text(outcome: &FetchOutcome) -> String {
    outcome
        .response()
        .and_then(|r| r.text().ok())
        .unwrap_or_default()
}

async fn next_revalidation(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<SwEvent>,
) -> Option<(String, bool)> {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await? {
                SwEvent::Revalidated { url, refreshed } => return Some((url, refreshed)),
                _ => continue,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[tokio::main]
async fn main() -> Result<(), PondoError> {
    init_logging(LogConfig::default().with_filter("pondo_smoke=info,pondokit_sw=debug"));

    let config: pondokit_sw::SwConfig = serde_json::from_str(CONFIG)
        .map_err(|e| PondoError::config(format!("bad worker config: {}", e)))?;

    let store = Arc::new(MemoryCacheStore::new());
    let net = Arc::new(ScriptedNet::new());
    seed_routes(&net);

    // A leftover bucket from the previous release, due for purging.
    store
        .open("pondo-v1")
        .await
        .map_err(|e| PondoError::cache_with_source("seeding stale bucket", e))?;

    let (worker, mut events) = ServiceWorker::new(config, store.clone(), net.clone())
        .map_err(|e| PondoError::lifecycle_with_source("constructing worker", e))?;

    worker.clients().write().await.add(Client::new(
        "tab-main",
        Url::parse("https://pondo.app/").map_err(|e| PondoError::config(e.to_string()))?,
    ));

    let timing = PhaseTiming::new();
    let mut checks: Vec<(&str, bool)> = Vec::new();

    // Install: the whole shell manifest, atomically.
    let start = Instant::now();
    worker
        .dispatch(LifecycleEvent::Install)
        .await
        .map_err(|e| PondoError::lifecycle_with_source("install", e))?;
    timing.record("install", start.elapsed());

    let shell_keys = store
        .keys("pondo-v2")
        .await
        .map_err(|e| PondoError::cache_with_source("listing shell", e))?;
    checks.push(("shell_cached", shell_keys.len() == 5));

    // Activate: stale buckets purged, clients claimed.
    let start = Instant::now();
    worker
        .dispatch(LifecycleEvent::Activate)
        .await
        .map_err(|e| PondoError::lifecycle_with_source("activate", e))?;
    timing.record("activate", start.elapsed());

    let buckets = store
        .bucket_names()
        .await
        .map_err(|e| PondoError::cache_with_source("listing buckets", e))?;
    checks.push(("single_bucket", buckets == vec!["pondo-v2".to_string()]));

    // Online navigation comes straight from the network.
    let start = Instant::now();
    let outcome = worker
        .handle_fetch(FetchEvent::navigation(get("https://pondo.app/")?))
        .await
        .map_err(|e| PondoError::network_with_source("online navigation", e))?;
    timing.record("navigation_online", start.elapsed());
    checks.push(("navigation_online", body_text(&outcome).contains("pondo shell")));

    // Runtime resource: miss fills the cache, hit answers instantly and
    // revalidates behind the response.
    let week = "https://pondo.app/summary/week.json";
    let start = Instant::now();
    let outcome = worker
        .handle_fetch(FetchEvent::subresource(get(week)?))
        .await
        .map_err(|e| PondoError::network_with_source("runtime miss", e))?;
    timing.record("runtime_miss", start.elapsed());
    checks.push(("runtime_miss", body_text(&outcome).contains("1200")));

    net.route(week, 200, r#"{"income":1300,"expense":450}"#);
    let start = Instant::now();
    let outcome = worker
        .handle_fetch(FetchEvent::subresource(get(week)?))
        .await
        .map_err(|e| PondoError::network_with_source("runtime hit", e))?;
    timing.record("runtime_hit", start.elapsed());
    checks.push(("runtime_hit_stale", body_text(&outcome).contains("1200")));

    let revalidated = next_revalidation(&mut events).await;
    checks.push((
        "revalidated",
        matches!(revalidated, Some((ref url, true)) if url == week),
    ));

    // Backend/auth traffic is invisible to the worker.
    let outcome = worker
        .handle_fetch(FetchEvent::subresource(get(
            "https://pondo-db.supabase.co/rest/v1/entries",
        )?))
        .await
        .map_err(|e| PondoError::network_with_source("excluded fetch", e))?;
    checks.push(("excluded_pass_through", outcome.response().is_none()));

    // Offline: navigations land on the cached fallback page.
    net.set_offline(true);
    let start = Instant::now();
    let outcome = worker
        .handle_fetch(FetchEvent::navigation(get("https://pondo.app/summary")?))
        .await
        .map_err(|e| PondoError::network_with_source("offline navigation", e))?;
    timing.record("navigation_offline", start.elapsed());
    checks.push((
        "navigation_offline_fallback",
        body_text(&outcome).contains("you are offline"),
    ));

    let passed = checks.iter().all(|(_, ok)| *ok);
    let summary = json!({
        "worker": {
            "version": worker.version(),
            "state": format!("{:?}", worker.state().await),
        },
        "buckets": buckets,
        "checks": checks
            .iter()
            .map(|(name, ok)| json!({ "name": name, "ok": ok }))
            .collect::<Vec<_>>(),
        "timings_ms": timing.summary(),
        "passed": passed,
    });

    println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
    info!(passed, "Smoke session complete");

    if passed {
        Ok(())
    } else {
        Err(PondoError::internal("smoke checks failed"))
    }
}
