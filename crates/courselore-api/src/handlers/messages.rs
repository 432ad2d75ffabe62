//! Message and conversation endpoints.
//!
//! Handlers resolve the caller's enrollment from the course reference in the
//! path, delegate the mutation to the message store, then schedule
//! notification work and refresh live pages as the write requires.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use courselore_core::{
    ConversationCreated, CreateConversationRequest, EditMessageRequest, LiveScope, Message,
    MessagePosted, PostMessageRequest, Reading,
};

use crate::{ApiError, AppState, CurrentUser, LiveOrigin};

#[derive(Debug, Deserialize)]
pub struct ConversationPath {
    pub course: String,
    pub conversation: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagePath {
    pub course: String,
    pub conversation: String,
    pub message: String,
}

/// Open a conversation with its first message.
pub async fn create_conversation(
    State(state): State<AppState>,
    user: CurrentUser,
    LiveOrigin(origin): LiveOrigin,
    Path(course): Path<String>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<ConversationCreated>), ApiError> {
    let (course, enrollment) = state.enrollment(user, &course).await?;
    let created = state
        .db
        .messages
        .create_conversation(course.id, &enrollment, &req, Utc::now())
        .await?;

    state.schedule_notification(created.message_id).await?;
    state
        .live
        .notify(
            LiveScope::Course {
                course_id: course.id,
            },
            origin,
        )
        .await;

    debug!(
        subsystem = "api",
        op = "create_conversation",
        conversation_id = created.conversation_id,
        enrollment_id = enrollment.id,
        "Conversation created"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

/// Post into a conversation. Chat posts may be appended to the author's
/// previous message; the response says which happened.
pub async fn post_message(
    State(state): State<AppState>,
    user: CurrentUser,
    LiveOrigin(origin): LiveOrigin,
    Path(path): Path<ConversationPath>,
    Json(req): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<MessagePosted>), ApiError> {
    let (course, enrollment) = state.enrollment(user, &path.course).await?;
    let conversation = state.conversation(&course, &path.conversation).await?;
    let posted = state
        .db
        .messages
        .post(conversation.id, &enrollment, &req, Utc::now())
        .await?;

    state.schedule_notification(posted.message_id).await?;
    state.refresh(&conversation, origin).await;

    debug!(
        subsystem = "api",
        op = "post_message",
        conversation_id = conversation.id,
        message_id = posted.message_id,
        appended = posted.appended,
        "Message posted"
    );
    Ok((StatusCode::CREATED, Json(posted)))
}

pub async fn edit_message(
    State(state): State<AppState>,
    user: CurrentUser,
    LiveOrigin(origin): LiveOrigin,
    Path(path): Path<MessagePath>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<Message>, ApiError> {
    let (course, enrollment) = state.enrollment(user, &path.course).await?;
    let conversation = state.conversation(&course, &path.conversation).await?;
    let message = state
        .db
        .messages
        .edit(conversation.id, &path.message, &enrollment, &req, Utc::now())
        .await?;

    if req.content.is_some() {
        state.schedule_notification(message.id).await?;
    }
    state.refresh(&conversation, origin).await;
    Ok(Json(message))
}

/// Staff-only.
pub async fn delete_message(
    State(state): State<AppState>,
    user: CurrentUser,
    LiveOrigin(origin): LiveOrigin,
    Path(path): Path<MessagePath>,
) -> Result<StatusCode, ApiError> {
    let (course, enrollment) = state.enrollment(user, &path.course).await?;
    let conversation = state.conversation(&course, &path.conversation).await?;
    state
        .db
        .messages
        .delete(conversation.id, &path.message, &enrollment)
        .await?;

    state.refresh(&conversation, origin).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, Copy)]
enum Toggle {
    Like,
    Unlike,
    Endorse,
    Unendorse,
}

async fn toggle(
    state: &AppState,
    user: CurrentUser,
    origin: LiveOrigin,
    path: MessagePath,
    action: Toggle,
) -> Result<StatusCode, ApiError> {
    let (course, enrollment) = state.enrollment(user, &path.course).await?;
    let conversation = state.conversation(&course, &path.conversation).await?;
    let messages = &state.db.messages;
    let now = Utc::now();
    let reference = path.message.as_str();

    match action {
        Toggle::Like => messages.like(conversation.id, reference, &enrollment, now).await?,
        Toggle::Unlike => {
            messages
                .unlike(conversation.id, reference, &enrollment, now)
                .await?
        }
        Toggle::Endorse => {
            messages
                .endorse(conversation.id, reference, &enrollment, now)
                .await?
        }
        Toggle::Unendorse => {
            messages
                .unendorse(conversation.id, reference, &enrollment, now)
                .await?
        }
    }

    state.refresh(&conversation, origin.0).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn like(
    State(state): State<AppState>,
    user: CurrentUser,
    origin: LiveOrigin,
    Path(path): Path<MessagePath>,
) -> Result<StatusCode, ApiError> {
    toggle(&state, user, origin, path, Toggle::Like).await
}

pub async fn unlike(
    State(state): State<AppState>,
    user: CurrentUser,
    origin: LiveOrigin,
    Path(path): Path<MessagePath>,
) -> Result<StatusCode, ApiError> {
    toggle(&state, user, origin, path, Toggle::Unlike).await
}

pub async fn endorse(
    State(state): State<AppState>,
    user: CurrentUser,
    origin: LiveOrigin,
    Path(path): Path<MessagePath>,
) -> Result<StatusCode, ApiError> {
    toggle(&state, user, origin, path, Toggle::Endorse).await
}

pub async fn unendorse(
    State(state): State<AppState>,
    user: CurrentUser,
    origin: LiveOrigin,
    Path(path): Path<MessagePath>,
) -> Result<StatusCode, ApiError> {
    toggle(&state, user, origin, path, Toggle::Unendorse).await
}

/// Record that the caller has seen a message.
pub async fn mark_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(path): Path<MessagePath>,
) -> Result<StatusCode, ApiError> {
    let (course, enrollment) = state.enrollment(user, &path.course).await?;
    let conversation = state.conversation(&course, &path.conversation).await?;
    state
        .db
        .messages
        .mark_read(conversation.id, &path.message, &enrollment, Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// "Seen by" list. Staff-only; anyone else gets a 404.
pub async fn views(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(path): Path<MessagePath>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let (course, enrollment) = state.enrollment(user, &path.course).await?;
    let conversation = state.conversation(&course, &path.conversation).await?;
    let readings = state
        .db
        .messages
        .readers(conversation.id, &path.message, &enrollment)
        .await?;
    Ok(Json(readings))
}
