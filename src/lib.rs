//! Conversation and message core of a messaging backend, with the HTTP
//! surface that fronts it.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod queries;
pub mod store;
#[cfg(test)]
mod test_util;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::store::Store;

/// Builds the HTTP surface. A request that exceeds `request_timeout` is
/// dropped, which rolls back any transaction it had open.
pub fn app(store: Store, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/api/account/logout", post(handlers::logout))
        .route("/api/users/search", post(handlers::search_users))
        .route("/api/users/:id", get(handlers::get_user))
        .route("/api/conversations", get(handlers::list_conversations))
        .route(
            "/api/conversations/:id",
            get(handlers::get_conversation).post(handlers::get_or_create_direct_conversation),
        )
        .route(
            "/api/conversations/:id/messages",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route("/api/conversations/:id/read", post(handlers::mark_as_read))
        .route("/api/conversations/:id/unread", get(handlers::unread_count))
        .route_layer(middleware::from_fn_with_state(
            store.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/account/create", post(handlers::create_account))
        .route("/api/account/login", post(handlers::login))
        .merge(protected)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(store)
}
