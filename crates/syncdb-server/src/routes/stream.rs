//! Server-Sent Events subscription endpoint.
//!
//! Each connection becomes one hub session. Every frame is written as an
//! `event: message` whose data is the JSON notification. The session is
//! dropped, and so unregistered, when the client disconnects.

use std::convert::Infallible;

use axum::{
    extract::State,
    http::header::{CONNECTION, TRANSFER_ENCODING},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::get,
    Router,
};
use futures::StreamExt;

use crate::error::Result;
use crate::state::AppState;

/// SSE event name carrying notifications.
pub const MESSAGE_EVENT: &str = "message";

/// Stream routes. Authentication is layered on by the router.
pub fn routes() -> Router<AppState> {
    Router::new().route("/stream", get(stream_changes))
}

async fn stream_changes(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let session = state.hub.subscribe()?;
    tracing::info!(session_id = session.id(), "subscriber connected");

    let events = session
        .into_stream()
        .map(|frame| Ok::<_, Infallible>(Event::default().event(MESSAGE_EVENT).data(frame)));

    Ok((
        [(CONNECTION, "keep-alive"), (TRANSFER_ENCODING, "chunked")],
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}
