//! HTTP front end: ARK redirects plus views of the registry the redirects are derived from.
//!
//! ```text
//! GET /ark:[/]NAAN/name[/qualifier]  -> 3xx redirect to the registry target
//! GET /naan_registry_cache           -> registry document as downloaded
//! GET /ark_root_resolver_map         -> what -> target, most specific first
//! ```

use std::{
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::Value;
use tokio::{net::TcpListener, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    identifier::Ark,
    registry::{self, Loaded, RegistryDocument, RegistrySettings},
    resolver::{ResolveError, ResolverMap},
};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub registry: RegistrySettings,
}

/// The registry and the resolver map derived from it, swapped as one unit on refresh.
#[derive(Debug)]
struct Snapshot {
    document: RegistryDocument,
    map: ResolverMap,
}

impl Snapshot {
    fn new(document: RegistryDocument) -> Self {
        let map = ResolverMap::from_records(document.records());
        Snapshot { document, map }
    }
}

#[derive(Clone)]
pub struct AppState {
    snapshot: Arc<RwLock<Arc<Snapshot>>>,
}

impl AppState {
    pub fn new(document: RegistryDocument) -> Self {
        let snapshot = Snapshot::new(document);
        if snapshot.map.is_empty() {
            warn!("NAAN registry has no usable records, every ARK will be unresolvable");
        }
        info!(entries = snapshot.map.len(), "ARK root resolver map built");
        AppState {
            snapshot: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, document: RegistryDocument) {
        let snapshot = Arc::new(Snapshot::new(document));
        info!(entries = snapshot.map.len(), "ARK root resolver map updated");
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ErrorResponse {
        code: code.to_string(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/naan_registry_cache", get(get_registry_cache))
        .route("/ark_root_resolver_map", get(get_resolver_map))
        // `ark:` is glued to the identifier, so it cannot be expressed as a route pattern.
        .fallback(handle_request)
        .with_state(state)
}

async fn get_registry_cache(State(state): State<AppState>) -> Json<Value> {
    Json(state.current().document.raw().clone())
}

async fn get_resolver_map(State(state): State<AppState>) -> Json<ResolverMap> {
    Json(state.current().map.clone())
}

async fn handle_request(State(state): State<AppState>, uri: Uri) -> Response {
    if !uri.path().starts_with("/ark:") {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no route for {}", uri.path()),
        );
    }
    handle_ark(&state, uri.path())
}

fn handle_ark(state: &AppState, path: &str) -> Response {
    debug!(path, "Handling ARK identifier");

    let decoded = match percent_decode_str(path).decode_utf8() {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(path, error = %e, "ARK path is not valid UTF-8");
            return error_response(StatusCode::BAD_REQUEST, "invalid_encoding", e.to_string());
        }
    };

    let ark = match Ark::parse(&decoded) {
        Ok(ark) => ark,
        Err(e) => {
            warn!(path, error = %e, "Rejected ARK identifier");
            return error_response(StatusCode::BAD_REQUEST, e.code(), e.to_string());
        }
    };
    debug!(
        naan = ark.naan(),
        name = ark.name(),
        qualifier = ?ark.qualifier(),
        legacy = ark.is_legacy(),
        "Parsed ARK"
    );

    let snapshot = state.current();
    match snapshot.map.resolve(&ark) {
        Ok(resolution) => {
            info!(
                ark = %ark,
                what = %resolution.what,
                target = %resolution.target.url,
                location = %resolution.location,
                "Matched ARK"
            );
            let status = StatusCode::from_u16(resolution.status).unwrap_or(StatusCode::FOUND);
            (
                status,
                [(header::LOCATION, resolution.location.to_string())],
            )
                .into_response()
        }
        Err(e @ ResolveError::NoMatch(_)) => {
            warn!(ark = %ark, "No NAAN registry entry for ARK");
            error_response(StatusCode::NOT_FOUND, e.code(), e.to_string())
        }
        Err(e @ ResolveError::DotSegment(_)) => {
            warn!(ark = %ark, "Rejected ARK with dot segment");
            error_response(StatusCode::BAD_REQUEST, e.code(), e.to_string())
        }
        Err(e @ ResolveError::InvalidTarget { .. }) => {
            error!(ark = %ark, error = %e, "Registry target is unusable");
            error_response(StatusCode::BAD_GATEWAY, e.code(), e.to_string())
        }
    }
}

/// Load the registry on a blocking thread; the cache does file IO and a synchronous download.
async fn load_registry(settings: RegistrySettings) -> anyhow::Result<Loaded> {
    tokio::task::spawn_blocking(move || registry::ensure_up_to_date(&settings))
        .await
        .context("registry loader task failed")?
}

/// Reload the registry every `max_age`, keeping the old snapshot when a reload fails.
async fn refresh_periodically(state: AppState, mut settings: RegistrySettings) {
    settings.force_download = false;
    let period = settings.max_age;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        match load_registry(settings.clone()).await {
            Ok(loaded) => {
                debug!(source = ?loaded.source, "NAAN registry refreshed");
                state.replace(loaded.document);
            }
            Err(e) => error!(error = %format!("{e:#}"), "NAAN registry refresh failed"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        // Without a signal handler, run until killed.
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

pub async fn serve(config: ServeConfig) -> anyhow::Result<()> {
    // Refuse to start without a registry.
    let loaded = load_registry(config.registry.clone())
        .await
        .context("could not load the NAAN registry")?;
    info!(source = ?loaded.source, file = ?loaded.file, "NAAN registry loaded");
    let state = AppState::new(loaded.document);

    let refresher = tokio::spawn(refresh_periodically(state.clone(), config.registry));

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %listener.local_addr()?, "ARK root resolver listening");

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    refresher.abort();
    let _ = refresher.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> RegistryDocument {
        RegistryDocument::from_value(json!({
            "data": [
                {
                    "what": "12148",
                    "target": { "url": "https://gallica.bnf.fr/ark:/${content}", "http_code": 302 }
                },
                {
                    "what": "13030/c7",
                    "target": { "url": "https://cdlib.example.org/${content}", "http_code": 301 }
                },
                {
                    "what": "99166",
                    "target": { "url": "not a url ${content}", "http_code": 302 }
                }
            ]
        }))
        .unwrap()
    }

    async fn get(state: &AppState, path: &str) -> Response {
        let uri: Uri = path.parse().unwrap();
        handle_request(State(state.clone()), uri).await
    }

    async fn json_body(res: Response) -> Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn location(res: &Response) -> &str {
        res.headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap()
    }

    #[tokio::test]
    async fn modern_and_legacy_arks_redirect_identically() {
        let state = AppState::new(document());
        let modern = get(&state, "/ark:12148/btv1b8449691v/f29").await;
        let legacy = get(&state, "/ark:/12148/btv1b8449691v/f29").await;

        assert_eq!(modern.status(), StatusCode::FOUND);
        assert_eq!(legacy.status(), StatusCode::FOUND);
        assert_eq!(
            location(&modern),
            "https://gallica.bnf.fr/ark:/12148/btv1b8449691v/f29"
        );
        assert_eq!(location(&modern), location(&legacy));
    }

    #[tokio::test]
    async fn shoulder_target_and_status_are_used() {
        let state = AppState::new(document());
        let res = get(&state, "/ark:/13030/c7xyz").await;
        assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(location(&res), "https://cdlib.example.org/13030/c7xyz");

        // Same NAAN outside the shoulder has no entry.
        let res = get(&state, "/ark:/13030/zz").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(res).await["code"], "no_match");
    }

    #[tokio::test]
    async fn percent_encoded_path_is_decoded() {
        let state = AppState::new(document());
        let res = get(&state, "/ark:%2F12148/btv1b8449691v").await;
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(
            location(&res),
            "https://gallica.bnf.fr/ark:/12148/btv1b8449691v"
        );
    }

    #[tokio::test]
    async fn parse_errors_are_bad_requests() {
        let state = AppState::new(document());

        let res = get(&state, "/ark:abc/name").await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["code"], "invalid_authority");

        let res = get(&state, "/ark:/12148").await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["code"], "missing_name");
    }

    #[tokio::test]
    async fn unusable_target_is_bad_gateway() {
        let state = AppState::new(document());
        let res = get(&state, "/ark:99166/x").await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(res).await["code"], "invalid_target");
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let state = AppState::new(document());
        let res = get(&state, "/doi:10.1000/182").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(res).await["code"], "not_found");
    }

    #[tokio::test]
    async fn replace_swaps_the_resolver_map() {
        let state = AppState::new(document());
        state.replace(
            RegistryDocument::from_value(json!({
                "data": [{ "what": "12148", "target": { "url": "https://mirror.example/${content}" } }]
            }))
            .unwrap(),
        );
        let res = get(&state, "/ark:12148/x").await;
        assert_eq!(location(&res), "https://mirror.example/12148/x");
    }

    #[tokio::test]
    async fn encoded_specials_stay_in_the_location_path() {
        let state = AppState::new(document());

        let res = get(&state, "/ark:12148/x%23frag").await;
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(location(&res), "https://gallica.bnf.fr/ark:/12148/x%23frag");

        let res = get(&state, "/ark:12148/a%3Fb/f1").await;
        assert_eq!(location(&res), "https://gallica.bnf.fr/ark:/12148/a%3Fb/f1");

        let res = get(&state, "/ark:12148/../../admin").await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["code"], "dot_segment");
    }

    fn settings(
        dir: &std::path::Path,
        url: String,
        max_age: std::time::Duration,
    ) -> RegistrySettings {
        RegistrySettings {
            url,
            cache_dir: dir.to_path_buf(),
            max_age,
            force_download: false,
            timeout: std::time::Duration::from_secs(5),
        }
    }

    async fn spawn(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        addr
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_swaps_in_the_new_registry() {
        let updated = json!({
            "data": [{ "what": "12148", "target": { "url": "https://mirror.example/${content}" } }]
        });
        let registry = spawn(Router::new().route(
            "/naan_records.json",
            axum::routing::get(move || {
                let updated = updated.clone();
                async move { Json(updated) }
            }),
        ))
        .await;

        let state = AppState::new(document());
        let tmp = tempfile::TempDir::new().unwrap();
        let refresher = tokio::spawn(refresh_periodically(
            state.clone(),
            settings(
                tmp.path(),
                format!("http://{registry}/naan_records.json"),
                std::time::Duration::from_millis(200),
            ),
        ));

        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let res = get(&state, "/ark:12148/x").await;
            if location(&res) == "https://mirror.example/12148/x" {
                break;
            }
            assert!(Instant::now() < deadline, "registry was never refreshed");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        refresher.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_refresh_keeps_the_previous_registry() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let registry = spawn(Router::new().route(
            "/naan_records.json",
            axum::routing::get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { StatusCode::INTERNAL_SERVER_ERROR }
            }),
        ))
        .await;

        let state = AppState::new(document());
        let tmp = tempfile::TempDir::new().unwrap();
        let refresher = tokio::spawn(refresh_periodically(
            state.clone(),
            settings(
                tmp.path(),
                format!("http://{registry}/naan_records.json"),
                std::time::Duration::from_millis(100),
            ),
        ));

        // A second request means the first refresh has fully failed.
        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        while hits.load(Ordering::SeqCst) < 2 {
            assert!(Instant::now() < deadline, "registry was never polled");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        refresher.abort();

        let res = get(&state, "/ark:12148/x").await;
        assert_eq!(location(&res), "https://gallica.bnf.fr/ark:/12148/x");
    }

    #[tokio::test]
    async fn redirects_over_http() {
        let addr = spawn(router(AppState::new(document()))).await;

        let responses = tokio::task::spawn_blocking(move || {
            let config = ureq::Agent::config_builder()
                .max_redirects(0)
                .http_status_as_error(false)
                .build();
            let agent = ureq::Agent::new_with_config(config);
            ["/ark:/12148/btv1b8449691v/f29", "/ark:12148/x%23frag", "/ark:/99999/x"]
                .map(|path| {
                    let res = agent
                        .get(format!("http://{addr}{path}").as_str())
                        .call()
                        .unwrap();
                    let location = res
                        .headers()
                        .get("location")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    (res.status().as_u16(), location)
                })
        })
        .await
        .unwrap();

        assert_eq!(
            responses[0],
            (
                302,
                Some("https://gallica.bnf.fr/ark:/12148/btv1b8449691v/f29".to_string())
            )
        );
        assert_eq!(
            responses[1],
            (302, Some("https://gallica.bnf.fr/ark:/12148/x%23frag".to_string()))
        );
        assert_eq!(responses[2], (404, None));
    }

    #[tokio::test]
    async fn registry_views_over_http() {
        let state = AppState::new(document());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state)).await });

        let (map, cache) = tokio::task::spawn_blocking(move || {
            let read = |path: &str| -> Value {
                let body = ureq::get(format!("http://{addr}{path}").as_str())
                    .call()
                    .unwrap()
                    .body_mut()
                    .read_to_string()
                    .unwrap();
                serde_json::from_str(&body).unwrap()
            };
            (read("/ark_root_resolver_map"), read("/naan_registry_cache"))
        })
        .await
        .unwrap();

        let keys: Vec<_> = map.as_object().unwrap().keys().cloned().collect();
        assert!(keys.contains(&"13030/c7".to_string()));
        assert_eq!(map["12148"]["http_code"], 302);
        assert_eq!(cache, document().raw().clone());
    }
}
