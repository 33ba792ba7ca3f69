//! SSE watch stream handler

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use utoipa::IntoParams;

use crate::core::ServerCore;

#[derive(Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct WatchStreamParams {
    /// Watch to stream; must already have an id from `watchSub`
    pub watch_id: String,
}

enum Step {
    Emit(Event),
    Skip,
    /// Final event; the stream ends after it
    Last(Event),
}

/// Stream a watch's changes via SSE
///
/// Events:
/// - `refresh` immediately, with every subscribed record
/// - `changes` after each server-side mutation that touched the watch
/// - `error` once the watch is closed or unknown, then the stream ends
///
/// Each event's data is a Haystack JSON grid.
#[utoipa::path(
    get,
    path = "/watchStream",
    params(WatchStreamParams),
    responses(
        (status = 200, description = "SSE stream of watch grids")
    )
)]
pub async fn watch_stream(
    State(core): State<Arc<ServerCore>>,
    Query(params): Query<WatchStreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let watch_id = params.watch_id;
    info!("GET /watchStream: {}", watch_id);
    debug!("SSE watch stream started for {}", watch_id);

    let state = StreamState {
        updates: BroadcastStream::new(core.subscribe_updates()),
        core,
        watch_id,
        refresh: true,
        done: false,
    };
    let event_stream = stream::unfold(state, |mut s| async move {
        loop {
            if s.done {
                return None;
            }
            if !s.refresh {
                // lagged receivers still just mean "poll again"
                s.updates.next().await?;
            }
            let refresh = std::mem::take(&mut s.refresh);
            match poll_step(&s.core, s.watch_id.clone(), refresh).await {
                Step::Emit(event) => return Some((event, s)),
                Step::Skip => continue,
                Step::Last(event) => {
                    s.done = true;
                    return Some((event, s));
                }
            }
        }
    });

    Sse::new(event_stream.map(Ok)).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}

struct StreamState {
    core: Arc<ServerCore>,
    watch_id: String,
    updates: BroadcastStream<()>,
    /// Next poll is the initial refresh
    refresh: bool,
    done: bool,
}

async fn poll_step(core: &ServerCore, watch_id: String, refresh: bool) -> Step {
    let name = if refresh { "refresh" } else { "changes" };
    match core.watch_poll(watch_id, refresh).await {
        Ok(grid) if grid.is_empty() && !refresh => Step::Skip,
        Ok(grid) => match serde_json::to_string(&grid) {
            Ok(data) => {
                debug!("SSE {}: {} rows", name, grid.len());
                Step::Emit(Event::default().event(name).data(data))
            }
            Err(e) => Step::Last(Event::default().event("error").data(e.to_string())),
        },
        Err(e) => {
            warn!("SSE watch stream ending: {}", e);
            Step::Last(Event::default().event("error").data(e.to_string()))
        }
    }
}
