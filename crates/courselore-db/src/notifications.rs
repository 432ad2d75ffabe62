//! Notification eligibility engine.
//!
//! Computes which enrollments must be emailed about a message and records
//! them in the delivery ledger. Recording a delivery and queueing its email
//! happen in one transaction, and the ledger's uniqueness makes repeated
//! runs for the same message harmless.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Row, Sqlite, Transaction};
use tokio::sync::Notify;
use tracing::{debug, info};

use courselore_core::{
    Conversation, Enrollment, Error, MailOptions, Mention, Message, NotificationDelivery, Result,
};

use crate::jobs::insert_send_email_tx;
use crate::pool::begin_write;
use crate::recipient_filter::{bind_params, candidates_query, RecipientQueryBuilder};
use crate::rows::enrollment_from_row;

/// SQLite implementation of the notification engine.
#[derive(Clone)]
pub struct SqliteNotificationRepository {
    pool: Pool<Sqlite>,
    /// Shared with the job repository; nudged when emails are queued.
    notify: Arc<Notify>,
}

impl SqliteNotificationRepository {
    pub fn new(pool: Pool<Sqlite>, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Every enrollment in the conversation's participation scope, before any
    /// ledger, verification or preference filtering.
    pub async fn candidates(&self, conversation: &Conversation) -> Result<Vec<Enrollment>> {
        let (sql, params) = candidates_query(conversation);
        let rows = bind_params(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut enrollments = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(enrollment) = enrollment_from_row(row)? {
                enrollments.push(enrollment);
            }
        }
        Ok(enrollments)
    }

    /// Enrollments that must be emailed about `message` right now.
    pub async fn recipients(
        &self,
        conversation: &Conversation,
        message: &Message,
        mentions: &BTreeSet<Mention>,
    ) -> Result<Vec<Enrollment>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let recipients = recipients_tx(&mut tx, conversation, message, mentions).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(recipients)
    }

    /// Record a delivery and queue an email for every current recipient.
    ///
    /// `compose` renders the email for one recipient. Returns the enrollment
    /// ids that were newly accounted for.
    pub async fn deliver<F>(
        &self,
        conversation: &Conversation,
        message: &Message,
        mentions: &BTreeSet<Mention>,
        now: DateTime<Utc>,
        send_email_expiry: Duration,
        compose: F,
    ) -> Result<Vec<i64>>
    where
        F: Fn(&Enrollment) -> Result<MailOptions>,
    {
        let mut tx = begin_write(&self.pool).await?;
        let recipients = recipients_tx(&mut tx, conversation, message, mentions).await?;

        let mut delivered = Vec::with_capacity(recipients.len());
        for enrollment in &recipients {
            let recorded: Option<i64> = sqlx::query_scalar(
                "INSERT INTO notification_deliveries (created_at, message_id, enrollment_id)
                 VALUES (?, ?, ?)
                 ON CONFLICT (message_id, enrollment_id) DO NOTHING
                 RETURNING id",
            )
            .bind(now)
            .bind(message.id)
            .bind(enrollment.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;
            if recorded.is_none() {
                continue;
            }

            let mail = compose(enrollment)?;
            let job_id = insert_send_email_tx(&mut tx, &mail, now, send_email_expiry).await?;
            debug!(
                subsystem = "notifications",
                component = "engine",
                message_id = message.id,
                enrollment_id = enrollment.id,
                job_id,
                "Notification email queued"
            );
            delivered.push(enrollment.id);
        }

        tx.commit().await.map_err(Error::Database)?;

        if !delivered.is_empty() {
            self.notify.notify_one();
        }
        info!(
            subsystem = "notifications",
            component = "engine",
            op = "deliver",
            message_id = message.id,
            conversation_id = conversation.id,
            recipient_count = delivered.len(),
            "Notifications recorded"
        );
        Ok(delivered)
    }

    /// Ledger rows for a message.
    pub async fn deliveries(&self, message_id: i64) -> Result<Vec<NotificationDelivery>> {
        let rows = sqlx::query(
            "SELECT id, created_at, message_id, enrollment_id
             FROM notification_deliveries
             WHERE message_id = ?
             ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter()
            .map(|row| -> Result<NotificationDelivery> {
                Ok(NotificationDelivery {
                    id: row.try_get("id")?,
                    created_at: row.try_get("created_at")?,
                    message_id: row.try_get("message_id")?,
                    enrollment_id: row.try_get("enrollment_id")?,
                })
            })
            .collect()
    }
}

async fn recipients_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation: &Conversation,
    message: &Message,
    mentions: &BTreeSet<Mention>,
) -> Result<Vec<Enrollment>> {
    let (sql, params) = RecipientQueryBuilder::new(conversation, message, mentions).build();
    let rows = bind_params(sqlx::query(&sql), params)
        .fetch_all(&mut **tx)
        .await
        .map_err(Error::Database)?;

    let mut recipients = Vec::with_capacity(rows.len());
    for row in &rows {
        if let Some(enrollment) = enrollment_from_row(row)? {
            recipients.push(enrollment);
        }
    }
    Ok(recipients)
}
