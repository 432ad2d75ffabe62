//! Live-update dispatcher.
//!
//! Open browser connections subscribe to a [`LiveScope`] (a course, or one
//! conversation in it). After a write, handlers call
//! [`LiveUpdateDispatcher::notify`]; once the debounce window closes, every
//! subscriber covered by the scope receives a lightweight [`LiveUpdate`]
//! telling it to re-fetch, except the connection that caused the change.
//!
//! Delivery is fire-and-forget. Subscribers whose receiving half has been
//! dropped are pruned on the next broadcast that reaches them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::defaults::LIVE_UPDATE_DEBOUNCE_MS;

/// Request header carrying the id of the live connection that issued a write.
pub const LIVE_CONNECTION_HEADER: &str = "live-connection";

/// Resource granularity a connection watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveScope {
    Course {
        course_id: i64,
    },
    Conversation {
        course_id: i64,
        conversation_id: i64,
    },
}

impl LiveScope {
    pub fn course_id(&self) -> i64 {
        match self {
            Self::Course { course_id } | Self::Conversation { course_id, .. } => *course_id,
        }
    }

    /// Whether a change to `self` must refresh a connection subscribed to
    /// `subscribed`.
    ///
    /// A course-wide change reaches every page of the course; a conversation
    /// change reaches that conversation and the course-level pages listing it.
    pub fn covers(&self, subscribed: &LiveScope) -> bool {
        match self {
            Self::Course { course_id } => subscribed.course_id() == *course_id,
            Self::Conversation { course_id, .. } => {
                subscribed == self
                    || *subscribed
                        == Self::Course {
                            course_id: *course_id,
                        }
            }
        }
    }
}

/// Identifies one open live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConnectionId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// "Something changed, re-fetch" signal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveUpdate {
    pub event_id: Uuid,
    pub scope: LiveScope,
    pub occurred_at: DateTime<Utc>,
}

/// Receiving side of one connection's subscription.
pub struct LiveSubscription {
    pub id: ConnectionId,
    pub scope: LiveScope,
    pub receiver: UnboundedReceiver<LiveUpdate>,
}

struct Subscriber {
    id: ConnectionId,
    sender: UnboundedSender<LiveUpdate>,
}

struct Inner {
    subscribers: RwLock<HashMap<LiveScope, Vec<Subscriber>>>,
    /// Scopes with a refresh waiting out the debounce window, mapped to the
    /// connection to skip (None once writes from different origins coalesce).
    pending: Mutex<HashMap<LiveScope, Option<ConnectionId>>>,
    debounce: Duration,
}

/// Publish/subscribe registry keyed by [`LiveScope`].
#[derive(Clone)]
pub struct LiveUpdateDispatcher {
    inner: Arc<Inner>,
}

impl Default for LiveUpdateDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_millis(LIVE_UPDATE_DEBOUNCE_MS))
    }
}

impl LiveUpdateDispatcher {
    pub fn new(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                debounce,
            }),
        }
    }

    /// Create from environment (`LIVE_UPDATE_DEBOUNCE_MS`).
    pub fn from_env() -> Self {
        let debounce_ms = std::env::var("LIVE_UPDATE_DEBOUNCE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(LIVE_UPDATE_DEBOUNCE_MS);
        Self::new(Duration::from_millis(debounce_ms))
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Register a new connection on `scope`.
    pub async fn subscribe(&self, scope: LiveScope) -> LiveSubscription {
        let (sender, receiver) = unbounded_channel();
        let id = ConnectionId::new();

        let mut guard = self.inner.subscribers.write().await;
        let subscribers = guard.entry(scope).or_default();
        subscribers.push(Subscriber { id, sender });

        tracing::debug!(
            subsystem = "live",
            component = "dispatcher",
            connection_id = %id,
            ?scope,
            subscriber_count = subscribers.len(),
            "Live connection subscribed"
        );

        LiveSubscription {
            id,
            scope,
            receiver,
        }
    }

    /// Remove a connection; called when its stream closes.
    pub async fn unsubscribe(&self, scope: LiveScope, id: ConnectionId) {
        let mut guard = self.inner.subscribers.write().await;
        if let Some(subscribers) = guard.get_mut(&scope) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                guard.remove(&scope);
            }
        }
        tracing::debug!(
            subsystem = "live",
            component = "dispatcher",
            connection_id = %id,
            ?scope,
            "Live connection unsubscribed"
        );
    }

    /// Schedule a refresh of `scope` after the debounce window.
    ///
    /// Calls for the same scope inside one window coalesce into a single
    /// refresh. The originating connection is skipped only if every coalesced
    /// write came from it.
    pub async fn notify(&self, scope: LiveScope, origin: Option<ConnectionId>) {
        {
            let mut pending = self.inner.pending.lock().await;
            if let Some(exclude) = pending.get_mut(&scope) {
                if *exclude != origin {
                    *exclude = None;
                }
                return;
            }
            pending.insert(scope, origin);
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(dispatcher.inner.debounce).await;
            let exclude = dispatcher
                .inner
                .pending
                .lock()
                .await
                .remove(&scope)
                .flatten();
            dispatcher.broadcast(scope, exclude).await;
        });
    }

    /// Send a refresh to every covered subscriber right away.
    ///
    /// Returns the number of connections reached.
    pub async fn broadcast(&self, scope: LiveScope, exclude: Option<ConnectionId>) -> usize {
        let update = LiveUpdate {
            event_id: Uuid::now_v7(),
            scope,
            occurred_at: Utc::now(),
        };

        let mut delivered = 0;
        let mut pruned = 0;
        let mut guard = self.inner.subscribers.write().await;
        for (subscribed, subscribers) in guard.iter_mut() {
            if !scope.covers(subscribed) {
                continue;
            }
            let before = subscribers.len();
            subscribers.retain(|subscriber| {
                if Some(subscriber.id) == exclude {
                    return true;
                }
                let alive = subscriber.sender.send(update.clone()).is_ok();
                if alive {
                    delivered += 1;
                }
                alive
            });
            pruned += before - subscribers.len();
        }
        guard.retain(|_, subscribers| !subscribers.is_empty());

        tracing::debug!(
            subsystem = "live",
            component = "dispatcher",
            ?scope,
            delivered,
            pruned,
            "Live update broadcast"
        );
        delivered
    }

    /// Number of open connections on exactly `scope`.
    pub async fn subscriber_count(&self, scope: LiveScope) -> usize {
        let guard = self.inner.subscribers.read().await;
        guard.get(&scope).map(Vec::len).unwrap_or(0)
    }
}
