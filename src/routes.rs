// routes.rs
use axum::{
    routing::{get, post},
    Router,
};
use http::{header, HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::handlers;
use crate::state::AppState;

pub fn create_routes(state: AppState) -> Router {
    let cors = cors_layer(state.config.cors_origin.as_deref());

    Router::new()
        .route("/poll", post(handlers::create_poll))
        .route(
            "/poll/{id}",
            get(handlers::get_poll)
                .put(handlers::update_poll)
                .delete(handlers::delete_poll),
        )
        .route("/poll/{id}/vote", post(handlers::vote))
        .route("/poll/{id}/live", get(handlers::live_updates))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    match origin.map(str::parse::<HeaderValue>) {
        Some(Ok(origin)) => layer.allow_origin(origin),
        Some(Err(_)) => {
            warn!("CORS_ORIGIN is not a valid header value, allowing any origin");
            layer.allow_origin(Any)
        }
        None => layer.allow_origin(Any),
    }
}
