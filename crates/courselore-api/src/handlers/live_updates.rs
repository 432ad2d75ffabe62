//! Live-update event stream.
//!
//! `GET /live-updates?scope=course:{course}` or
//! `?scope=conversation:{course}/{conversation}` opens a server-sent event
//! stream. The first event, `connected`, carries the connection id the page
//! echoes back in the `Live-Connection` header of its own writes; every
//! later `refresh` event tells the page to re-fetch.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;

use courselore_core::defaults::LIVE_UPDATE_KEEPALIVE_SECS;
use courselore_core::{policy, ConnectionId, LiveScope, LiveUpdate, LiveUpdateDispatcher};

use crate::{ApiError, AppState, CurrentUser};

#[derive(Debug, Deserialize)]
pub struct LiveUpdatesQuery {
    pub scope: String,
}

/// Scope as written in the query string, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeRef {
    Course(String),
    Conversation { course: String, conversation: String },
}

impl ScopeRef {
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, rest) = raw.split_once(':')?;
        match kind {
            "course" if is_reference(rest) => Some(Self::Course(rest.to_string())),
            "conversation" => {
                let (course, conversation) = rest.split_once('/')?;
                (is_reference(course) && is_reference(conversation)).then(|| {
                    Self::Conversation {
                        course: course.to_string(),
                        conversation: conversation.to_string(),
                    }
                })
            }
            _ => None,
        }
    }

    fn course(&self) -> &str {
        match self {
            Self::Course(course) | Self::Conversation { course, .. } => course,
        }
    }
}

fn is_reference(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Unsubscribes when the response stream is dropped.
struct SubscriptionGuard {
    live: LiveUpdateDispatcher,
    scope: LiveScope,
    id: ConnectionId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let live = self.live.clone();
        let (scope, id) = (self.scope, self.id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { live.unsubscribe(scope, id).await });
        }
    }
}

fn refresh_event(update: &LiveUpdate) -> Option<Event> {
    let json = serde_json::to_string(update).ok()?;
    Some(
        Event::default()
            .event("refresh")
            .id(update.event_id.to_string())
            .data(json),
    )
}

pub async fn live_updates(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<LiveUpdatesQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let scope_ref = ScopeRef::parse(&query.scope)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid scope: {}", query.scope)))?;

    let (course, enrollment) = state.enrollment(user, scope_ref.course()).await?;
    let scope = match &scope_ref {
        ScopeRef::Course(_) => LiveScope::Course {
            course_id: course.id,
        },
        ScopeRef::Conversation { conversation, .. } => {
            let conversation = state.conversation(&course, conversation).await?;
            policy::ensure_conversation_access(&conversation, &enrollment)?;
            LiveScope::Conversation {
                course_id: course.id,
                conversation_id: conversation.id,
            }
        }
    };

    let subscription = state.live.subscribe(scope).await;
    let connected = Event::default()
        .event("connected")
        .data(subscription.id.to_string());
    let guard = SubscriptionGuard {
        live: state.live.clone(),
        scope,
        id: subscription.id,
    };

    let updates = UnboundedReceiverStream::new(subscription.receiver).filter_map(move |update| {
        let _connection = &guard;
        refresh_event(&update).map(Ok)
    });
    let stream = tokio_stream::once(Ok(connected)).chain(updates);

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(LIVE_UPDATE_KEEPALIVE_SECS))
            .text("keepalive"),
    ))
}
