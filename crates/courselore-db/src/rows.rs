//! Row decoding shared by the repositories.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use courselore_core::{
    Conversation, Enrollment, Error, MaybeEnrollment, Message, NotificationPreferences, Result,
    User,
};

/// Columns of an enrollment joined as `e` with its user joined as `u`.
///
/// Used with `LEFT JOIN` so that a removed enrollment decodes as
/// [`MaybeEnrollment::NoLongerEnrolled`].
pub(crate) const ENROLLMENT_COLUMNS: &str = "e.id AS enrollment_id, \
    e.course_id AS enrollment_course_id, \
    e.reference AS enrollment_reference, \
    e.course_role AS enrollment_course_role, \
    u.id AS user_id, \
    u.email AS user_email, \
    u.email_verified_at AS user_email_verified_at, \
    u.name AS user_name, \
    u.email_notifications_for_all_messages AS user_all_messages, \
    u.email_notifications_for_mentions AS user_mentions, \
    u.email_notifications_for_participated_conversations AS user_participated_conversations, \
    u.email_notifications_for_started_conversations AS user_started_conversations";

pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.created_at, m.updated_at, m.conversation_id, \
    m.reference, m.anonymous_at, m.answer_at, m.content_source, m.content_preprocessed, \
    m.content_search";

pub(crate) const CONVERSATION_COLUMNS: &str = "c.id, c.created_at, c.updated_at, c.course_id, \
    c.reference, c.anonymous_at, c.type, c.participants, c.title, c.announcement_at, \
    c.resolved_at, c.next_message_reference";

pub(crate) fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("user_id")?,
        email: row.try_get("user_email")?,
        email_verified_at: row.try_get("user_email_verified_at")?,
        name: row.try_get("user_name")?,
        preferences: NotificationPreferences {
            all_messages: row.try_get("user_all_messages")?,
            mentions: row.try_get("user_mentions")?,
            participated_conversations: row.try_get("user_participated_conversations")?,
            started_conversations: row.try_get("user_started_conversations")?,
        },
    })
}

/// Decode the [`ENROLLMENT_COLUMNS`] of a row, if the enrollment still exists.
pub(crate) fn enrollment_from_row(row: &SqliteRow) -> Result<Option<Enrollment>> {
    let id: Option<i64> = row.try_get("enrollment_id")?;
    let Some(id) = id else {
        return Ok(None);
    };
    let course_role: String = row.try_get("enrollment_course_role")?;
    Ok(Some(Enrollment {
        id,
        user: user_from_row(row)?,
        course_id: row.try_get("enrollment_course_id")?,
        reference: row.try_get("enrollment_reference")?,
        course_role: course_role.parse().map_err(Error::Internal)?,
    }))
}

pub(crate) fn maybe_enrollment_from_row(row: &SqliteRow) -> Result<MaybeEnrollment> {
    enrollment_from_row(row).map(MaybeEnrollment::from)
}

/// Decode [`MESSAGE_COLUMNS`] plus the author's [`ENROLLMENT_COLUMNS`].
pub(crate) fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        conversation_id: row.try_get("conversation_id")?,
        reference: row.try_get("reference")?,
        author: maybe_enrollment_from_row(row)?,
        anonymous_at: row.try_get("anonymous_at")?,
        answer_at: row.try_get("answer_at")?,
        content_source: row.try_get("content_source")?,
        content_preprocessed: row.try_get("content_preprocessed")?,
        content_search: row.try_get("content_search")?,
    })
}

/// Decode [`CONVERSATION_COLUMNS`] plus the author's [`ENROLLMENT_COLUMNS`].
///
/// Selected participants are loaded separately.
pub(crate) fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let conversation_type: String = row.try_get("type")?;
    let participants: String = row.try_get("participants")?;
    let next_message_reference: i64 = row.try_get("next_message_reference")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        course_id: row.try_get("course_id")?,
        reference: row.try_get("reference")?,
        author: maybe_enrollment_from_row(row)?,
        anonymous_at: row.try_get("anonymous_at")?,
        conversation_type: conversation_type.parse().map_err(Error::Internal)?,
        participants: participants.parse().map_err(Error::Internal)?,
        selected_participants: Vec::new(),
        title: row.try_get("title")?,
        announcement_at: row.try_get("announcement_at")?,
        resolved_at: row.try_get("resolved_at")?,
        next_message_reference,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
