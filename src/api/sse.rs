//! Server-Sent Events rendering of a running turn

use crate::runtime::{ActiveTurn, ChatEvent};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

/// Stream a turn's events to the client.
///
/// The turn's cancellation token is tied to the response body: if the client
/// disconnects, the body is dropped and the turn is cancelled. The body ends
/// right after the terminal event.
pub fn sse_stream(turn: ActiveTurn) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = Some(turn.cancel.drop_guard());

    let events = stream::unfold((turn.events, guard), |(mut rx, guard)| async move {
        // Guard already released means the terminal event went out
        let guard = guard?;
        let event = rx.recv().await?;
        let next = if event.is_terminal() {
            // The turn is over; nothing left to cancel
            let _ = guard.disarm();
            None
        } else {
            Some(guard)
        };
        Some((Ok(chat_event_to_axum(&event)), (rx, next)))
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn event_parts(event: &ChatEvent) -> (&'static str, serde_json::Value) {
    match event {
        ChatEvent::Session { session_id } => ("session", json!({ "sessionID": session_id })),
        ChatEvent::Message { content } => ("message", json!({ "content": content })),
        ChatEvent::Status { status } => ("status", json!({ "status": status })),
        ChatEvent::Error { error } => ("error", json!({ "error": error })),
        ChatEvent::Done => ("done", json!({})),
    }
}

fn chat_event_to_axum(event: &ChatEvent) -> Event {
    let (event_type, data) = event_parts(event);
    Event::default().event(event_type).data(data.to_string())
}
