// handlers.rs
use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequest, FromRequestParts, Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use http::HeaderMap;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::live::Notice;
use crate::models::{CreatePollRequest, UpdatePollRequest, VoteRequest};
use crate::services;
use crate::snapshot::Snapshot;
use crate::state::AppState;

/// JSON request body whose rejections answer with the usual error body.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct Body<T>(pub T);

/// Path parameters, rejected the same way.
#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(AppError))]
pub struct Param<T>(pub T);

/// Create a poll. A valid bearer token makes its holder the owner.
pub async fn create_poll(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Body(payload): Body<CreatePollRequest>,
) -> AppResult<Json<Value>> {
    let owner = state.identity.resolve(&headers, peer).user_id;
    let poll = services::create_poll(&state, payload.validate(owner)?).await?;

    Ok(Json(json!({ "success": true, "operation": "create", "poll_id": poll.id })))
}

/// Current aggregated state of a poll
pub async fn get_poll(
    State(state): State<AppState>,
    Param(poll_id): Param<i64>,
) -> AppResult<Json<Snapshot>> {
    Ok(Json(services::current_snapshot(&state, poll_id).await?))
}

pub async fn update_poll(
    State(state): State<AppState>,
    Param(poll_id): Param<i64>,
    Body(payload): Body<UpdatePollRequest>,
) -> AppResult<Json<Value>> {
    services::update_poll(&state, poll_id, payload.validate()?).await?;

    Ok(Json(json!({ "success": true, "operation": "update", "poll_id": poll_id })))
}

pub async fn delete_poll(
    State(state): State<AppState>,
    Param(poll_id): Param<i64>,
) -> AppResult<Json<Value>> {
    services::delete_poll(&state, poll_id).await?;

    Ok(Json(json!({ "success": true, "operation": "delete", "poll_id": poll_id })))
}

/// Vote for an option
pub async fn vote(
    State(state): State<AppState>,
    Param(poll_id): Param<i64>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Body(payload): Body<VoteRequest>,
) -> AppResult<Json<Value>> {
    let identity = state.identity.resolve(&headers, peer);
    services::submit_vote(&state, poll_id, &payload.option, &identity).await?;

    Ok(Json(json!({ "success": true, "operation": "vote", "poll_id": poll_id })))
}

/// Server-sent stream of snapshots for one poll.
pub async fn live_updates(
    State(state): State<AppState>,
    Param(poll_id): Param<i64>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.live.connect(poll_id).await;
    debug!(poll_id = subscription.poll_id(), subscription = %subscription.id(), "live stream opened");

    let stream = subscription.map(move |notice| {
        if notice.is_terminal() {
            debug!(poll_id, ?notice, "closing live stream");
        }
        Ok(notice_event(notice))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.live.keep_alive)
            .text("keep-alive"),
    )
}

fn notice_event(notice: Notice) -> Event {
    match notice {
        Notice::Snapshot(snapshot) => Event::default()
            .event("snapshot")
            .json_data(snapshot.as_ref())
            .unwrap_or_else(|e| error_event(&format!("Snapshot could not be encoded: {e}"))),
        Notice::Timeout => Event::default().event("timeout").data(
            json!({ "timeout": true, "details": "Connection closed after idle timeout." }).to_string(),
        ),
        Notice::Error(details) => error_event(&details),
        Notice::Shutdown => Event::default().event("shutdown").data(
            json!({ "shutdown": true, "details": "Server is shutting down." }).to_string(),
        ),
    }
}

fn error_event(details: &str) -> Event {
    Event::default()
        .event("error")
        .data(json!({ "error": true, "details": details }).to_string())
}
