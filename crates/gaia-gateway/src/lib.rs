//! The HTTP boundary: two thin `axum` router compositions, one per
//! binary, sharing the same state-injection and layering shape. Route
//! handlers extract, call into the relevant component, and map the
//! typed result to JSON — no business logic lives here.

#![forbid(unsafe_code)]

pub mod cognition;
pub mod orchestrator;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Wraps a built router with the CORS and request-tracing layers every
/// binary in this workspace applies the same way.
pub fn with_standard_layers(router: Router) -> Router {
    router.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}
