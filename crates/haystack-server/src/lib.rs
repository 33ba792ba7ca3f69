//! Haystack Server - HTTP front end for the haystack dispatcher
//!
//! REST endpoints for every protocol operation over an in-memory record
//! store, plus an SSE stream per watch.
//!
//! # Example
//!
//! ```ignore
//! use haystack_server::{ServerCore, build_router};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let core = Arc::new(ServerCore::new());
//!     core.commit(vec![haystack::dict! { "id" => haystack::Ref::new("ahu1").unwrap() }])
//!         .await
//!         .unwrap();
//!     let _sweeper = core.spawn_lease_sweeper(std::time::Duration::from_secs(10));
//!
//!     let router = build_router(core);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod core;
pub mod error;
pub mod http;
pub mod loader;
pub mod sse;
pub mod state;

// Re-exports for convenience
pub use core::ServerCore;
pub use error::AppError;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use utoipa::OpenApi;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        http::about,
        http::ops,
        http::formats,
        http::read,
        http::watch_sub,
        http::watch_unsub,
        http::watch_poll,
        http::watches,
        http::his_read,
        http::his_write,
        http::point_write,
        http::point_write_array,
        http::invoke_action,
        http::commit,
        sse::watch_stream,
    ),
    components(schemas(
        state::GridJson,
        state::DictJson,
        state::ErrorResponse,
        state::OkResponse,
        state::CommitResponse,
        state::WatchesResponse,
        state::WatchInfo,
    ))
)]
struct ApiDoc;

pub fn openapi_spec() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

/// Build the axum router with all endpoints
pub fn build_router(core: Arc<ServerCore>) -> Router {
    Router::new()
        .route("/about", get(http::about))
        .route("/ops", get(http::ops))
        .route("/formats", get(http::formats))
        .route("/read", post(http::read))
        .route("/watchSub", post(http::watch_sub))
        .route("/watchUnsub", post(http::watch_unsub))
        .route("/watchPoll", post(http::watch_poll))
        .route("/watches", get(http::watches))
        .route("/watchStream", get(sse::watch_stream))
        .route("/hisRead", post(http::his_read))
        .route("/hisWrite", post(http::his_write))
        .route("/pointWrite", post(http::point_write))
        .route("/pointWriteArray", post(http::point_write_array))
        .route("/invokeAction", post(http::invoke_action))
        .route("/commit", post(http::commit))
        .with_state(core)
}

/// Build the router with OpenAPI documentation endpoint
pub fn build_router_with_docs(core: Arc<ServerCore>) -> Router {
    use utoipa_swagger_ui::SwaggerUi;

    build_router(core)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi_spec()))
}
