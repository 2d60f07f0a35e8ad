//! # Grocer
//!
//! Shared family shopping-list service.
//!
//! A list of products with representative photos, kept either locally (one
//! device, JSON files on disk) or shared across a "family" of devices through
//! a Redis-backed document store. The interesting part is the sync bridge:
//! local edits apply optimistically and are pushed remotely after a short
//! debounce so edit bursts coalesce into one write, while a subscription
//! mirrors everyone else's writes back in. Families are joined by short code;
//! the member count is adjusted atomically and the shared document is deleted
//! when the last member leaves.
//!
//! Image search and OCR list extraction are plain HTTP calls to external
//! services; nothing about them is engineered here.
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//! Run against a local Redis.
//! ```sh
//! GROCER_REDIS_URL=redis://127.0.0.1:6379 cargo run
//! ```
use std::time::Duration;

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{delete, get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod family;
pub mod images;
pub mod models;
pub mod routes;
pub mod state;
pub mod store;
pub mod sync;

use routes::{
    add_batch_handler, add_item_handler, clear_handler, create_family_handler,
    delete_item_handler, extract_handler, family_handler, favorites_handler, join_family_handler,
    leave_family_handler, list_events_handler, list_handler, search_images_handler,
    settings_handler, toggle_favorite_handler, toggle_item_handler, update_settings_handler,
};
use state::AppState;

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route("/list", get(list_handler).delete(clear_handler))
        .route("/list/items", post(add_item_handler))
        .route("/list/items/batch", post(add_batch_handler))
        .route("/list/items/{id}/toggle", post(toggle_item_handler))
        .route("/list/items/{id}", delete(delete_item_handler))
        .route("/list/events", get(list_events_handler))
        .route("/favorites", get(favorites_handler))
        .route("/favorites/toggle", post(toggle_favorite_handler))
        .route("/family", get(family_handler).post(create_family_handler))
        .route("/family/join", post(join_family_handler))
        .route("/family/leave", post(leave_family_handler))
        .route(
            "/settings",
            get(settings_handler).put(update_settings_handler),
        )
        .route("/images/search", get(search_images_handler))
        .route("/extract", post(extract_handler))
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    println!("Server shutting down...");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
