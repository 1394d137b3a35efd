//! Server-Sent Events feed of a run's event log.
//!
//! A subscriber receives the stored history first and then live events, in
//! `seq` order. Each SSE frame carries the event `seq` as its id and the
//! event type as its name.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};

use super::api::{ApiError, SharedState, parse_run_id};
use crate::run::RunEvent;

pub(crate) async fn stream_run_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let events = state.service.stream_events(run_id).await?;

    let stream = async_stream::stream! {
        let mut events = std::pin::pin!(events);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => yield Ok(to_sse_event(&event)),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Event stream failed");
                    yield Ok(Event::default().event("error").data(e.to_string()));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &RunEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        tracing::warn!(seq = event.seq, error = %e, "Failed to serialize run event");
        "{}".to_string()
    });
    Event::default()
        .id(event.seq.to_string())
        .event(event.event_type.as_str())
        .data(data)
}
