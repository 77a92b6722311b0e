// Control and status endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    Json,
};
use chorus_core::protocol::Update;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};

use crate::event_stream::UpdateEvent;
use crate::BridgeState;

/// `POST /update`: speech requests and clears go through the dispatcher;
/// whatever it lets through is fanned out to SSE subscribers.
pub async fn update_handler(
    State(state): State<BridgeState>,
    Json(update): Json<Update>,
) -> impl IntoResponse {
    debug!(target: "bridge", kind = %update.kind, "Update received");
    let passthrough = state
        .dispatcher
        .intercept(&update.kind, update.data.clone())
        .await;

    let mut subscribers = 0;
    if passthrough {
        subscribers = state
            .updates
            .broadcast(UpdateEvent::new(update.kind, update.data));
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "broadcast": passthrough,
            "subscribers": subscribers,
        })),
    )
}

/// SSE stream of pass-through updates
pub async fn sse_handler(
    State(state): State<BridgeState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    info!(target: "bridge", subscribers = state.updates.subscriber_count() + 1, "New SSE client connected");

    let rx = state.updates.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(update) => match serde_json::to_string(&update) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(e) => {
                warn!(target: "bridge", error = %e, "Failed to serialize update");
                None
            }
        },
        Err(e) => {
            warn!(target: "bridge", error = %e, "SSE client lagging; updates skipped");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn active_avatars_handler(State(state): State<BridgeState>) -> impl IntoResponse {
    let avatars: Vec<String> = state.registry.list_distinct_avatars().into_iter().collect();
    Json(json!({ "avatars": avatars }))
}

pub async fn speech_status_handler(State(state): State<BridgeState>) -> impl IntoResponse {
    Json(state.dispatcher.status().await)
}
