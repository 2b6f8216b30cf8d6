use crate::error::ApiError;
use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::stream::Stream;
use planforge_events::{SubscriberFilter, Subscription};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct SubscribeQuery {
    pub from_seq: Option<u64>,
}

fn sse_stream(subscription: Subscription) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    futures_util::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse = match SseEvent::default()
            .event(event.kind.to_string())
            .id(event.seq.to_string())
            .json_data(&event)
        {
            Ok(sse) => sse,
            Err(_) => SseEvent::default().comment("serialization failure"),
        };
        Some((Ok(sse), subscription))
    })
}

/// Live stream of one job's events, optionally replaying history from a
/// sequence number. Keep-alives flow every 15 s.
pub async fn subscribe_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<SubscribeQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    state.store.get_job(id).await?;
    let subscription = state
        .bus
        .subscribe(SubscriberFilter::Job(id), query.from_seq)
        .await?;
    Ok(Sse::new(sse_stream(subscription)).keep_alive(keep_alive()))
}

/// Live stream of every job's events.
pub async fn subscribe_all(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let subscription = state.bus.subscribe(SubscriberFilter::All, None).await?;
    Ok(Sse::new(sse_stream(subscription)).keep_alive(keep_alive()))
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}
