//! Trimmed-down admin surface: a JSON snapshot of the counters described in
//! the external-interfaces stats (`crate::stats`), plus the raw Prometheus
//! text exposition. An API-key gated `ServeHttp` app on its own `Service`,
//! dispatching through a `matchit` router, without the etcd-backed resource
//! CRUD some admin APIs carry, since this proxy has no distributed config
//! store to administer.

use std::collections::HashMap;

use async_trait::async_trait;
use http::{header, Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::config::Admin;
use crate::proxy::plugin::cache::cache_entries;
use crate::stats;

#[derive(Serialize)]
struct StatsSnapshot {
    cache_entries: usize,
    cache_hits: i64,
    cache_misses: i64,
    cache_writes: i64,
}

fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        cache_entries: cache_entries(),
        cache_hits: stats::CACHE_HITS.get(),
        cache_misses: stats::CACHE_MISSES.get(),
        cache_writes: stats::CACHE_WRITES.get(),
    }
}

type HttpHandler = fn() -> Response<Vec<u8>>;

pub struct AdminHttpApp {
    config: Admin,
    router: Router<HashMap<Method, HttpHandler>>,
}

impl AdminHttpApp {
    pub fn new(cfg: &crate::config::Pingsix) -> Self {
        let mut router = Router::new();

        let mut stats_handlers: HashMap<Method, HttpHandler> = HashMap::new();
        stats_handlers.insert(Method::GET, stats_response);
        router
            .insert("/apisix/admin/stats", stats_handlers)
            .expect("Route insertion should not fail");

        let mut metrics_handlers: HashMap<Method, HttpHandler> = HashMap::new();
        metrics_handlers.insert(Method::GET, metrics_response);
        router
            .insert("/apisix/admin/metrics", metrics_handlers)
            .expect("Route insertion should not fail");

        Self {
            config: cfg.admin.clone().expect("Admin config must be present"),
            router,
        }
    }

    pub fn admin_http_service(cfg: &crate::config::Pingsix) -> Service<Self> {
        let app = Self::new(cfg);
        let addr = &app.config.address.to_string();
        let mut service = Service::new("Admin HTTP".to_string(), app);
        service.add_tcp(addr);
        service
    }
}

#[async_trait]
impl ServeHttp for AdminHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        if validate_api_key(http_session, &self.config.api_key).is_err() {
            return error_response(StatusCode::FORBIDDEN, "Invalid API key");
        }

        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        match self.router.at(&path) {
            Ok(Match { value, .. }) => match value.get(&method) {
                Some(handler) => handler(),
                None => error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
            },
            Err(_) => error_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

fn stats_response() -> Response<Vec<u8>> {
    let body = serde_json::to_vec(&snapshot()).unwrap_or_else(|e| {
        log::error!("Failed to serialize stats snapshot: {e}");
        b"{}".to_vec()
    });
    json_response(body)
}

fn metrics_response() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(stats::gather_text().into_bytes())
        .unwrap_or_else(|e| {
            log::error!("Failed to build metrics response: {e}");
            internal_error_response()
        })
}

fn json_response(body: Vec<u8>) -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap_or_else(|e| {
            log::error!("Failed to build stats response: {e}");
            internal_error_response()
        })
}

fn error_response(status: StatusCode, message: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .body(message.as_bytes().to_vec())
        .unwrap_or_else(|e| {
            log::error!("Failed to build error response: {e}");
            internal_error_response()
        })
}

fn internal_error_response() -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(b"Internal Server Error".to_vec())
        .unwrap()
}

fn validate_api_key(http_session: &ServerSession, api_key: &str) -> Result<(), ()> {
    match http_session.get_header("x-api-key") {
        Some(key) if key.as_bytes() == api_key.as_bytes() => Ok(()),
        _ => Err(()),
    }
}
