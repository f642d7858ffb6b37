//! Axum router setup.

use crate::config::RelayConfig;
use crate::handlers::{vault, AppState};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::storage::VaultStore;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS,
};
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(store: VaultStore, config: &RelayConfig) -> Router {
    let state = AppState {
        store,
        max_blob_bytes: config.max_blob_bytes,
    };
    let limiter = RateLimiter::new(config.rate_limit_per_minute);

    let api = Router::new()
        .route("/v1/init", post(vault::init))
        .route("/v1/meta", get(vault::meta))
        .route("/v1/get", get(vault::get))
        .route("/v1/put", post(vault::put))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    Router::new()
        .merge(api)
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Browser clients call the relay cross-origin. Every response, errors
/// included, carries the same fixed CORS headers; preflights end here.
async fn cors(request: Request<Body>, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, if-match"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("x-stoct-etag, x-stoct-v, x-stoct-kdf"),
    );
    response
}
