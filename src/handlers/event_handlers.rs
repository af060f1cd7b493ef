//! `GET /events` - server-sent events carrying the caller's notifications.

use crate::{handlers::Owner, services::{notify::Notification, state::AppState}};
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, stream};
use std::convert::Infallible;
use tokio::sync::broadcast::{Receiver, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

pub async fn events(
    State(state): State<AppState>,
    owner: Owner,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(owner = %owner.0, "event stream opened");
    let rx = state.notifications.subscribe();
    let stream = owner_events(rx, owner.0)
        .take_until(state.shutdown.clone().cancelled_owned());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Notifications for `owner_id` only, as SSE events. Ends when the hub closes.
fn owner_events(
    rx: Receiver<Notification>,
    owner_id: Uuid,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notification) if notification.owner_id == owner_id => {
                    let event = Event::default()
                        .event("notification")
                        .json_data(&notification)
                        .unwrap_or_else(|_| Event::default().data(notification.message.as_str()));
                    return Some((Ok(event), rx));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(owner = %owner_id, skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
