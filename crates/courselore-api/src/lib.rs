//! # courselore-api
//!
//! HTTP surface for Courselore's message pipeline.
//!
//! This crate provides:
//! - Message endpoints (post, edit, delete, likes, endorsements, readings, views)
//! - Conversation creation
//! - The live-update event stream
//!
//! Every write that produces or changes message content schedules a
//! notification job, and every write refreshes the open pages watching the
//! affected conversation.

pub mod error;
pub mod extract;
pub mod handlers;

use axum::routing::{get, patch, post};
use axum::Router;
use chrono::Utc;
use tower_http::trace::TraceLayer;

use courselore_core::{
    ConnectionId, Conversation, Course, Enrollment, LiveScope, LiveUpdateDispatcher,
};
use courselore_db::Database;
use courselore_jobs::NotificationConfig;

pub use error::ApiError;
pub use extract::{CurrentUser, LiveOrigin, USER_HEADER};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub live: LiveUpdateDispatcher,
    pub notifications: NotificationConfig,
}

impl AppState {
    pub fn new(
        db: Database,
        live: LiveUpdateDispatcher,
        notifications: NotificationConfig,
    ) -> Self {
        Self {
            db,
            live,
            notifications,
        }
    }

    /// The course named by `reference` and the caller's enrollment in it.
    ///
    /// A course the caller is not enrolled in is reported as not found.
    pub async fn enrollment(
        &self,
        user: CurrentUser,
        reference: &str,
    ) -> Result<(Course, Enrollment), ApiError> {
        let course = self
            .db
            .courses
            .get_course_by_reference(reference)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("course {reference}")))?;
        let enrollment = self
            .db
            .courses
            .get_enrollment_for_user(course.id, user.0)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("course {reference}")))?;
        Ok((course, enrollment))
    }

    pub async fn conversation(
        &self,
        course: &Course,
        reference: &str,
    ) -> Result<Conversation, ApiError> {
        self.db
            .courses
            .get_conversation(course.id, reference)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("conversation {reference}")))
    }

    /// Schedule (or push back) the notification job for a message.
    pub async fn schedule_notification(&self, message_id: i64) -> Result<(), ApiError> {
        self.db
            .jobs
            .enqueue_notification(
                message_id,
                Utc::now(),
                self.notifications.delay(),
                self.notifications.expiry(),
            )
            .await?;
        Ok(())
    }

    /// Refresh every open page watching `conversation`, except the caller's.
    pub async fn refresh(&self, conversation: &Conversation, origin: Option<ConnectionId>) {
        self.live
            .notify(
                LiveScope::Conversation {
                    course_id: conversation.course_id,
                    conversation_id: conversation.id,
                },
                origin,
            )
            .await;
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    use handlers::{live_updates, messages};

    const MESSAGE: &str = "/courses/:course/conversations/:conversation/messages/:message";

    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/courses/:course/conversations",
            post(messages::create_conversation),
        )
        .route(
            "/courses/:course/conversations/:conversation/messages",
            post(messages::post_message),
        )
        .route(
            MESSAGE,
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route(
            &format!("{MESSAGE}/likes"),
            post(messages::like).delete(messages::unlike),
        )
        .route(
            &format!("{MESSAGE}/endorsements"),
            post(messages::endorse).delete(messages::unendorse),
        )
        .route(&format!("{MESSAGE}/readings"), post(messages::mark_read))
        .route(&format!("{MESSAGE}/views"), get(messages::views))
        .route("/live-updates", get(live_updates::live_updates))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
