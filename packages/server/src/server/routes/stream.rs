//! SSE streaming endpoint for job lifecycle events.
//!
//! GET /api/pipelines/{pipeline_id}/events?types=job:completed,job:failed
//!
//! Subscribes to the event hub for one pipeline and forwards events as SSE.
//! Per-pipeline publication order is preserved; a slow client loses its own
//! oldest events and receives a `lagged` notification with the missed
//! count. Heartbeats keep the connection alive; client disconnect drops the
//! subscription cleanly.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::common::validation::is_valid_pipeline_id;
use crate::kernel::event_hub::EventFilter;
use crate::server::app::AppState;
use crate::server::error::{ApiError, ApiResult};

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event types (`job:completed,job:failed`).
    pub types: Option<String>,
}

/// SSE handler — subscribes to the pipeline's event topic and streams
/// events until the client disconnects.
pub async fn pipeline_events(
    State(state): State<AppState>,
    Path(pipeline_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if !is_valid_pipeline_id(&pipeline_id) {
        return Err(ApiError::field(
            "pipeline_id",
            "must match [A-Za-z0-9_-]{1,64}",
        ));
    }
    if !state.registry.is_registered(&pipeline_id) {
        return Err(ApiError::UnknownPipeline {
            pipeline_id,
            known: state.registry.known_pipelines(),
        });
    }

    let event_types = query.types.as_deref().map(|raw| {
        raw.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
    });

    let subscription = state
        .events
        .subscribe(EventFilter {
            pipeline_id: Some(pipeline_id),
            event_types,
        })
        .await;
    let (receiver, filter, dropped, guard) = subscription.into_parts();

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let events = BroadcastStream::new(receiver).filter_map(move |result| {
        // The guard lives as long as the stream; dropping it (client
        // disconnect) clears the subscription's status entry.
        let _keep_alive = &guard;
        let item = match result {
            Ok(event) => {
                if filter.matches(&event) {
                    Event::default()
                        .event(event.event_type())
                        .json_data(&event)
                        .ok()
                        .map(Ok)
                } else {
                    None
                }
            }
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(missed)) => {
                dropped.fetch_add(missed, Ordering::SeqCst);
                Event::default()
                    .event("lagged")
                    .json_data(&serde_json::json!({ "missed": missed }))
                    .ok()
                    .map(Ok)
            }
        };
        async move { item }
    });

    Ok(Sse::new(connected.chain(events)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}
