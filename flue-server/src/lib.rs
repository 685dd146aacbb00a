pub mod auth;
pub mod config;
pub mod handlers;
pub mod protocol;
pub mod session;
pub mod transport;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use flue_core::{BatchScheduler, SharedModel};

use crate::auth::Credentials;

// Application state containing the preloaded model and the accepted credentials.
pub struct AppState {
    pub credentials: Credentials,
    pub scheduler: BatchScheduler,
}

impl AppState {
    pub fn new(credentials: Credentials, model: SharedModel) -> Self {
        Self {
            credentials,
            scheduler: BatchScheduler::new(model),
        }
    }
}

/// Streaming routes authenticate in-band; synchronous routes use HTTP Basic.
pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);

    let streaming = Router::new()
        .route("/text_to_image", get(handlers::text_to_image))
        .route("/image_to_image", get(handlers::image_to_image))
        .route("/inpainting", get(handlers::inpainting))
        .route("/gobig", get(handlers::large_upscale));

    let synchronous = Router::new()
        .route("/upscale", post(handlers::upscale))
        .route("/ping", get(handlers::ping))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_basic_auth,
        ));

    streaming.merge(synchronous).with_state(state)
}
