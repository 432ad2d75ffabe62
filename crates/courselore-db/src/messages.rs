//! Message store.
//!
//! Every mutation runs in one transaction that re-reads the conversation and
//! message rows, asks [`courselore_core::policy`] whether the change is
//! allowed, and only then writes. Conversation bookkeeping (`updated_at`,
//! `resolved_at`, `next_message_reference`) is written in the same
//! transaction as the message change it belongs to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, Transaction};
use tracing::{debug, info};

use courselore_core::defaults::CHAT_MERGE_SEPARATOR;
use courselore_core::policy::{self, Resolution};
use courselore_core::{
    ContentProcessor, Conversation, ConversationCreated, CreateConversationRequest,
    EditMessageRequest, Enrollment, Error, MaybeEnrollment, Message, MessagePosted,
    PostMessageRequest, Reading, Result, FIRST_MESSAGE_REFERENCE,
};

use crate::courses::get_conversation_tx;
use crate::pool::begin_write;
use crate::rows::{
    maybe_enrollment_from_row, message_from_row, ENROLLMENT_COLUMNS, MESSAGE_COLUMNS,
};

/// Join-table rows toggled by a single enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Toggle {
    Like,
    Endorsement,
}

impl Toggle {
    fn table(self) -> &'static str {
        match self {
            Self::Like => "likes",
            Self::Endorsement => "endorsements",
        }
    }
}

/// SQLite implementation of the message store.
#[derive(Clone)]
pub struct SqliteMessageRepository {
    pool: Pool<Sqlite>,
    processor: Arc<dyn ContentProcessor>,
}

impl SqliteMessageRepository {
    pub fn new(pool: Pool<Sqlite>, processor: Arc<dyn ContentProcessor>) -> Self {
        Self { pool, processor }
    }

    /// The content processor used for new and edited content.
    pub fn processor(&self) -> Arc<dyn ContentProcessor> {
        self.processor.clone()
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub async fn get_message(
        &self,
        conversation_id: i64,
        reference: &str,
    ) -> Result<Option<Message>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let message = get_message_tx(&mut tx, conversation_id, reference).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(message)
    }

    pub async fn get_message_by_id(&self, id: i64) -> Result<Option<Message>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let message = get_message_by_id_tx(&mut tx, id).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(message)
    }

    /// All messages of a conversation in reference order.
    pub async fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}, {ENROLLMENT_COLUMNS}
             FROM messages m
             LEFT JOIN enrollments e ON e.id = m.author_enrollment_id
             LEFT JOIN users u ON u.id = e.user_id
             WHERE m.conversation_id = ?
             ORDER BY m.id"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(message_from_row).collect()
    }

    /// Enrollments that liked a message, oldest first.
    pub async fn likes(&self, message_id: i64) -> Result<Vec<MaybeEnrollment>> {
        self.toggled_by(Toggle::Like, message_id).await
    }

    /// Enrollments that endorsed a message, oldest first.
    pub async fn endorsements(&self, message_id: i64) -> Result<Vec<MaybeEnrollment>> {
        self.toggled_by(Toggle::Endorsement, message_id).await
    }

    async fn toggled_by(&self, toggle: Toggle, message_id: i64) -> Result<Vec<MaybeEnrollment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS}
             FROM {table} t
             LEFT JOIN enrollments e ON e.id = t.enrollment_id
             LEFT JOIN users u ON u.id = e.user_id
             WHERE t.message_id = ?
             ORDER BY t.id",
            table = toggle.table()
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(maybe_enrollment_from_row).collect()
    }

    /// "Seen by" list of a message. Staff only.
    pub async fn readers(
        &self,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
    ) -> Result<Vec<Reading>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let (_, message) = load_tx(&mut tx, conversation_id, reference, enrollment).await?;
        policy::ensure_staff(enrollment, &format!("message {}", message.reference))?;

        let rows = sqlx::query(&format!(
            "SELECT r.id AS reading_id, r.created_at AS reading_created_at, r.message_id,
                    {ENROLLMENT_COLUMNS}
             FROM readings r
             LEFT JOIN enrollments e ON e.id = r.enrollment_id
             LEFT JOIN users u ON u.id = e.user_id
             WHERE r.message_id = ?
             ORDER BY r.created_at, r.id"
        ))
        .bind(message.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        rows.iter()
            .map(|row| -> Result<Reading> {
                Ok(Reading {
                    id: row.try_get("reading_id")?,
                    created_at: row.try_get("reading_created_at")?,
                    message_id: row.try_get("message_id")?,
                    enrollment: maybe_enrollment_from_row(row)?,
                })
            })
            .collect()
    }

    // =========================================================================
    // CONVERSATION CREATION
    // =========================================================================

    /// Open a conversation together with its first message.
    pub async fn create_conversation(
        &self,
        course_id: i64,
        enrollment: &Enrollment,
        req: &CreateConversationRequest,
        now: DateTime<Utc>,
    ) -> Result<ConversationCreated> {
        if enrollment.course_id != course_id {
            return Err(Error::not_found(format!("course {course_id}")));
        }
        policy::check_create_conversation(enrollment, req)?;
        let processed = self.processor.process(&req.content)?;

        let mut tx = begin_write(&self.pool).await?;

        let mut selected = Vec::with_capacity(req.selected_participants.len());
        for reference in &req.selected_participants {
            let id: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM enrollments WHERE course_id = ? AND reference = ?",
            )
            .bind(course_id)
            .bind(reference)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;
            selected.push(id.ok_or_else(|| {
                Error::invalid(format!("unknown participant {reference}"))
            })?);
        }
        let selected = policy::selected_audience(req.participants, enrollment, selected);

        let reference: i64 = sqlx::query_scalar(
            "UPDATE courses SET next_conversation_reference = next_conversation_reference + 1
             WHERE id = ?
             RETURNING next_conversation_reference - 1",
        )
        .bind(course_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::not_found(format!("course {course_id}")))?;
        let reference = reference.to_string();

        let anonymous_at = req.is_anonymous.then_some(now);
        let conversation_id: i64 = sqlx::query_scalar(
            "INSERT INTO conversations (created_at, course_id, reference, author_enrollment_id,
                 anonymous_at, type, participants, title, announcement_at, next_message_reference)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 2)
             RETURNING id",
        )
        .bind(now)
        .bind(course_id)
        .bind(&reference)
        .bind(enrollment.id)
        .bind(anonymous_at)
        .bind(req.conversation_type.to_string())
        .bind(req.participants.to_string())
        .bind(req.title.trim())
        .bind(req.is_announcement.then_some(now))
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for enrollment_id in &selected {
            sqlx::query(
                "INSERT INTO conversation_selected_participants
                     (created_at, conversation_id, enrollment_id)
                 VALUES (?, ?, ?)",
            )
            .bind(now)
            .bind(conversation_id)
            .bind(*enrollment_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        let message_id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (created_at, conversation_id, reference, author_enrollment_id,
                 anonymous_at, content_source, content_preprocessed, content_search)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(now)
        .bind(conversation_id)
        .bind(FIRST_MESSAGE_REFERENCE)
        .bind(enrollment.id)
        .bind(anonymous_at)
        .bind(&req.content)
        .bind(&processed.html)
        .bind(&processed.search)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        mark_read_tx(&mut tx, message_id, enrollment.id, now).await?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "messages",
            op = "create_conversation",
            conversation_id,
            message_id,
            enrollment_id = enrollment.id,
            conversation_type = %req.conversation_type,
            participants = %req.participants,
            "Conversation created"
        );

        Ok(ConversationCreated {
            conversation_id,
            reference,
            message_id,
        })
    }

    // =========================================================================
    // POST / EDIT / DELETE
    // =========================================================================

    /// Post into a conversation, appending to the author's previous chat
    /// message when the merge rule applies.
    pub async fn post(
        &self,
        conversation_id: i64,
        enrollment: &Enrollment,
        req: &PostMessageRequest,
        now: DateTime<Utc>,
    ) -> Result<MessagePosted> {
        let mut tx = begin_write(&self.pool).await?;

        let conversation = get_conversation_tx(&mut tx, conversation_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("conversation {conversation_id}")))?;
        policy::check_post(&conversation, enrollment, req)?;

        let previous = latest_message_tx(&mut tx, conversation.id).await?;
        let posted = match previous {
            Some(previous)
                if policy::should_append(&conversation, Some(&previous), enrollment, req, now) =>
            {
                self.append_tx(&mut tx, &previous, enrollment, &req.content, now)
                    .await?
            }
            _ => {
                self.insert_tx(&mut tx, &conversation, enrollment, req, now)
                    .await?
            }
        };

        let resolved_at = match policy::resolution_after_post(&conversation, enrollment, req) {
            Resolution::Resolve => Some(now),
            Resolution::Unresolve => None,
            Resolution::Unchanged => conversation.resolved_at,
        };
        sqlx::query("UPDATE conversations SET updated_at = ?, resolved_at = ? WHERE id = ?")
            .bind(now)
            .bind(resolved_at)
            .bind(conversation.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "messages",
            op = "post",
            conversation_id,
            message_id = posted.message_id,
            enrollment_id = enrollment.id,
            appended = posted.appended,
            "Message posted"
        );
        Ok(posted)
    }

    async fn insert_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        conversation: &Conversation,
        enrollment: &Enrollment,
        req: &PostMessageRequest,
        now: DateTime<Utc>,
    ) -> Result<MessagePosted> {
        let processed = self.processor.process(&req.content)?;

        let reference: i64 = sqlx::query_scalar(
            "UPDATE conversations SET next_message_reference = next_message_reference + 1
             WHERE id = ?
             RETURNING next_message_reference - 1",
        )
        .bind(conversation.id)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::Database)?;
        let reference = reference.to_string();

        let message_id: i64 = sqlx::query_scalar(
            "INSERT INTO messages (created_at, conversation_id, reference, author_enrollment_id,
                 anonymous_at, answer_at, content_source, content_preprocessed, content_search)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(now)
        .bind(conversation.id)
        .bind(&reference)
        .bind(enrollment.id)
        .bind(req.is_anonymous.then_some(now))
        .bind(req.is_answer.then_some(now))
        .bind(&req.content)
        .bind(&processed.html)
        .bind(&processed.search)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::Database)?;

        mark_read_tx(tx, message_id, enrollment.id, now).await?;

        Ok(MessagePosted {
            message_id,
            reference,
            appended: false,
        })
    }

    async fn append_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        previous: &Message,
        enrollment: &Enrollment,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<MessagePosted> {
        let source = format!(
            "{}{}{}",
            previous.content_source, CHAT_MERGE_SEPARATOR, content
        );
        let processed = self.processor.process(&source)?;

        sqlx::query(
            "UPDATE messages
             SET content_source = ?, content_preprocessed = ?, content_search = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&source)
        .bind(&processed.html)
        .bind(&processed.search)
        .bind(now)
        .bind(previous.id)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        // Everyone but the author must re-read the amended message.
        let cleared = sqlx::query(
            "DELETE FROM readings
             WHERE message_id = ? AND (enrollment_id IS NULL OR enrollment_id != ?)",
        )
        .bind(previous.id)
        .bind(enrollment.id)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        debug!(
            subsystem = "database",
            component = "messages",
            message_id = previous.id,
            readings_cleared = cleared,
            "Appended to previous chat message"
        );

        Ok(MessagePosted {
            message_id: previous.id,
            reference: previous.reference.clone(),
            appended: true,
        })
    }

    /// Apply a patch to an existing message and return the updated row.
    pub async fn edit(
        &self,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
        req: &EditMessageRequest,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let mut tx = begin_write(&self.pool).await?;
        let (conversation, message) =
            load_tx(&mut tx, conversation_id, reference, enrollment).await?;
        policy::check_edit(&conversation, &message, enrollment, req)?;

        if let Some(is_answer) = req.is_answer {
            sqlx::query("UPDATE messages SET answer_at = ? WHERE id = ?")
                .bind(is_answer.then_some(now))
                .bind(message.id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        if let Some(is_anonymous) = req.is_anonymous {
            let anonymous_at = is_anonymous.then_some(now);
            sqlx::query("UPDATE messages SET anonymous_at = ? WHERE id = ?")
                .bind(anonymous_at)
                .bind(message.id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            if policy::propagates_anonymity(&conversation, &message) {
                sqlx::query("UPDATE conversations SET anonymous_at = ? WHERE id = ?")
                    .bind(anonymous_at)
                    .bind(conversation.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
            }
        }

        if let Some(content) = &req.content {
            let processed = self.processor.process(content)?;
            sqlx::query(
                "UPDATE messages
                 SET content_source = ?, content_preprocessed = ?, content_search = ?,
                     updated_at = ?
                 WHERE id = ?",
            )
            .bind(content)
            .bind(&processed.html)
            .bind(&processed.search)
            .bind(now)
            .bind(message.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(conversation.id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        let updated = get_message_by_id_tx(&mut tx, message.id)
            .await?
            .ok_or_else(|| Error::Internal(format!("message {} vanished", message.id)))?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "messages",
            op = "edit",
            conversation_id,
            message_id = message.id,
            enrollment_id = enrollment.id,
            content_changed = req.content.is_some(),
            "Message edited"
        );
        Ok(updated)
    }

    /// Delete a message. Staff only; readings, likes, endorsements, ledger
    /// rows and pending jobs go with it.
    pub async fn delete(
        &self,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
    ) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        let (_, message) = load_tx(&mut tx, conversation_id, reference, enrollment).await?;
        policy::ensure_staff(enrollment, &format!("message {}", message.reference))?;

        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "messages",
            op = "delete",
            conversation_id,
            message_id = message.id,
            enrollment_id = enrollment.id,
            "Message deleted"
        );
        Ok(())
    }

    // =========================================================================
    // LIKES / ENDORSEMENTS / READINGS
    // =========================================================================

    pub async fn like(
        &self,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.toggle(Toggle::Like, conversation_id, reference, enrollment, true, now)
            .await
    }

    pub async fn unlike(
        &self,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.toggle(Toggle::Like, conversation_id, reference, enrollment, false, now)
            .await
    }

    /// Endorse an answer. The first endorsement resolves the question.
    pub async fn endorse(
        &self,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.toggle(
            Toggle::Endorsement,
            conversation_id,
            reference,
            enrollment,
            true,
            now,
        )
        .await
    }

    pub async fn unendorse(
        &self,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.toggle(
            Toggle::Endorsement,
            conversation_id,
            reference,
            enrollment,
            false,
            now,
        )
        .await
    }

    async fn toggle(
        &self,
        toggle: Toggle,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
        adding: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        let (conversation, message) =
            load_tx(&mut tx, conversation_id, reference, enrollment).await?;

        let holds: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE message_id = ? AND enrollment_id = ?)",
            toggle.table()
        ))
        .bind(message.id)
        .bind(enrollment.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        match toggle {
            Toggle::Like => policy::check_like(holds, adding)?,
            Toggle::Endorsement => {
                policy::check_endorsement(&conversation, &message, enrollment, holds, adding)?
            }
        }

        if adding {
            sqlx::query(&format!(
                "INSERT INTO {} (created_at, message_id, enrollment_id) VALUES (?, ?, ?)",
                toggle.table()
            ))
            .bind(now)
            .bind(message.id)
            .bind(enrollment.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            if toggle == Toggle::Endorsement && conversation.resolved_at.is_none() {
                sqlx::query("UPDATE conversations SET resolved_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(conversation.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
            }
        } else {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE message_id = ? AND enrollment_id = ?",
                toggle.table()
            ))
            .bind(message.id)
            .bind(enrollment.id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "messages",
            op = toggle.table(),
            message_id = message.id,
            enrollment_id = enrollment.id,
            adding,
            "Toggled"
        );
        Ok(())
    }

    /// Record that `enrollment` has read a message.
    ///
    /// Also accounts for the enrollment in the notification ledger, so a
    /// reader is never emailed about what they have already seen. Returns
    /// `false` if the message had already been read.
    pub async fn mark_read(
        &self,
        conversation_id: i64,
        reference: &str,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = begin_write(&self.pool).await?;
        let (_, message) = load_tx(&mut tx, conversation_id, reference, enrollment).await?;
        let inserted = mark_read_tx(&mut tx, message.id, enrollment.id, now).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(inserted)
    }
}

// =============================================================================
// TRANSACTION-SCOPED HELPERS
// =============================================================================

pub(crate) async fn get_message_by_id_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
) -> Result<Option<Message>> {
    let row = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS}, {ENROLLMENT_COLUMNS}
         FROM messages m
         LEFT JOIN enrollments e ON e.id = m.author_enrollment_id
         LEFT JOIN users u ON u.id = e.user_id
         WHERE m.id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)?;

    row.as_ref().map(message_from_row).transpose()
}

async fn get_message_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: i64,
    reference: &str,
) -> Result<Option<Message>> {
    let row = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS}, {ENROLLMENT_COLUMNS}
         FROM messages m
         LEFT JOIN enrollments e ON e.id = m.author_enrollment_id
         LEFT JOIN users u ON u.id = e.user_id
         WHERE m.conversation_id = ? AND m.reference = ?"
    ))
    .bind(conversation_id)
    .bind(reference)
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)?;

    row.as_ref().map(message_from_row).transpose()
}

async fn latest_message_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: i64,
) -> Result<Option<Message>> {
    let row = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS}, {ENROLLMENT_COLUMNS}
         FROM messages m
         LEFT JOIN enrollments e ON e.id = m.author_enrollment_id
         LEFT JOIN users u ON u.id = e.user_id
         WHERE m.conversation_id = ?
         ORDER BY m.id DESC
         LIMIT 1"
    ))
    .bind(conversation_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)?;

    row.as_ref().map(message_from_row).transpose()
}

/// Load a conversation and one of its messages, as seen by `enrollment`.
async fn load_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: i64,
    reference: &str,
    enrollment: &Enrollment,
) -> Result<(Conversation, Message)> {
    let conversation = get_conversation_tx(tx, conversation_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("conversation {conversation_id}")))?;
    policy::ensure_conversation_access(&conversation, enrollment)?;
    let message = get_message_tx(tx, conversation.id, reference)
        .await?
        .ok_or_else(|| Error::not_found(format!("message {reference}")))?;
    Ok((conversation, message))
}

/// Insert a reading and a ledger row; both are no-ops if present.
async fn mark_read_tx(
    tx: &mut Transaction<'_, Sqlite>,
    message_id: i64,
    enrollment_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let inserted = sqlx::query(
        "INSERT INTO readings (created_at, message_id, enrollment_id) VALUES (?, ?, ?)
         ON CONFLICT (message_id, enrollment_id) DO NOTHING",
    )
    .bind(now)
    .bind(message_id)
    .bind(enrollment_id)
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?
    .rows_affected()
        > 0;

    sqlx::query(
        "INSERT INTO notification_deliveries (created_at, message_id, enrollment_id)
         VALUES (?, ?, ?)
         ON CONFLICT (message_id, enrollment_id) DO NOTHING",
    )
    .bind(now)
    .bind(message_id)
    .bind(enrollment_id)
    .execute(&mut **tx)
    .await
    .map_err(Error::Database)?;

    Ok(inserted)
}
