//! Job queue repository.
//!
//! Two tables share the same mechanics: a row is pending while `started_at`
//! is NULL, claimed once it is set, and deleted on completion or expiry.
//! Claims that outlive the claim timeout are released back to pending.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite, Transaction};
use tokio::sync::Notify;
use tracing::debug;

use courselore_core::{
    EmailNotificationMessageJob, Error, Job, JobKind, MailOptions, Result, SendEmailJob,
};

use crate::pool::begin_write;

/// Outcome of one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimedOutJobs {
    /// Claims handed back to pending.
    pub released: Vec<i64>,
    /// Notification jobs deleted because a pending job covers their message.
    pub superseded: Vec<i64>,
}

/// SQLite implementation of the job queues.
#[derive(Clone)]
pub struct SqliteJobRepository {
    pool: Pool<Sqlite>,
    /// Notify handle for waking the worker when work is queued.
    notify: Arc<Notify>,
}

impl SqliteJobRepository {
    /// Create a new repository with its own notify handle.
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a new repository sharing an existing notify handle.
    pub fn with_notify(pool: Pool<Sqlite>, notify: Arc<Notify>) -> Self {
        Self { pool, notify }
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn parse_send_email_row(row: &SqliteRow) -> Result<SendEmailJob> {
        let mail_options: String = row.try_get("mail_options")?;
        Ok(SendEmailJob {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            start_at: row.try_get("start_at")?,
            expires_at: row.try_get("expires_at")?,
            started_at: row.try_get("started_at")?,
            mail_options: serde_json::from_str(&mail_options)?,
        })
    }

    fn parse_notification_row(row: &SqliteRow) -> Result<EmailNotificationMessageJob> {
        Ok(EmailNotificationMessageJob {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            start_at: row.try_get("start_at")?,
            expires_at: row.try_get("expires_at")?,
            started_at: row.try_get("started_at")?,
            message_id: row.try_get("message_id")?,
        })
    }

    fn parse_job_row(kind: JobKind, row: &SqliteRow) -> Result<Job> {
        Ok(match kind {
            JobKind::SendEmail => Job::SendEmail(Self::parse_send_email_row(row)?),
            JobKind::EmailNotificationMessage => {
                Job::EmailNotificationMessage(Self::parse_notification_row(row)?)
            }
        })
    }

    fn columns(kind: JobKind) -> &'static str {
        match kind {
            JobKind::SendEmail => "id, created_at, start_at, expires_at, started_at, mail_options",
            JobKind::EmailNotificationMessage => {
                "id, created_at, start_at, expires_at, started_at, message_id"
            }
        }
    }

    // =========================================================================
    // ENQUEUE
    // =========================================================================

    /// Schedule notification work for a message.
    ///
    /// If a pending job already exists for the message its `start_at` and
    /// `expires_at` are pushed back instead, so rapid successive edits
    /// collapse into one job. Returns the job id.
    pub async fn enqueue_notification(
        &self,
        message_id: i64,
        now: DateTime<Utc>,
        delay: Duration,
        expiry: Duration,
    ) -> Result<i64> {
        let start_at = now + delay;
        let expires_at = start_at + expiry;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO email_notification_message_jobs
                 (created_at, start_at, expires_at, message_id)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (message_id) WHERE started_at IS NULL
             DO UPDATE SET start_at = excluded.start_at, expires_at = excluded.expires_at
             RETURNING id",
        )
        .bind(now)
        .bind(start_at)
        .bind(expires_at)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "jobs",
            component = "queue",
            op = "enqueue",
            job_kind = %JobKind::EmailNotificationMessage,
            job_id = id,
            message_id,
            "Notification job scheduled"
        );
        self.notify.notify_one();
        Ok(id)
    }

    /// Queue one outbound email, due immediately.
    pub async fn enqueue_send_email(
        &self,
        mail: &MailOptions,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<i64> {
        let mut tx = begin_write(&self.pool).await?;
        let id = insert_send_email_tx(&mut tx, mail, now, expiry).await?;
        tx.commit().await.map_err(Error::Database)?;
        self.notify.notify_one();
        Ok(id)
    }

    // =========================================================================
    // WORKER OPERATIONS
    // =========================================================================

    /// Delete jobs whose `expires_at` has passed. Returns their ids.
    pub async fn expire(&self, kind: JobKind, now: DateTime<Utc>) -> Result<Vec<i64>> {
        sqlx::query_scalar(&format!(
            "DELETE FROM {} WHERE expires_at < ? RETURNING id",
            kind.table()
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    /// Release claims older than `timeout` back to pending.
    ///
    /// A timed-out notification job whose message already has a newer pending
    /// job is dropped instead; the pending one covers the same work.
    pub async fn release_timed_out(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<TimedOutJobs> {
        let cutoff = now - timeout;
        let mut tx = begin_write(&self.pool).await?;

        let mut superseded = Vec::new();
        if kind == JobKind::EmailNotificationMessage {
            superseded = sqlx::query_scalar(
                "DELETE FROM email_notification_message_jobs
                 WHERE started_at < ?
                   AND message_id IN (SELECT message_id FROM email_notification_message_jobs
                                      WHERE started_at IS NULL)
                 RETURNING id",
            )
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        let released: Vec<i64> = sqlx::query_scalar(&format!(
            "UPDATE {} SET started_at = NULL WHERE started_at < ? RETURNING id",
            kind.table()
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(TimedOutJobs {
            released,
            superseded,
        })
    }

    /// Claim the earliest due job of `kind`.
    ///
    /// The claim is a single conditional `UPDATE ... RETURNING`: of several
    /// workers racing for the same row exactly one sees it come back.
    pub async fn claim_next(&self, kind: JobKind, now: DateTime<Utc>) -> Result<Option<Job>> {
        let table = kind.table();
        let row = sqlx::query(&format!(
            "UPDATE {table}
             SET started_at = ?
             WHERE id = (
                 SELECT id FROM {table}
                 WHERE started_at IS NULL AND start_at <= ? AND expires_at >= ?
                 ORDER BY start_at, id
                 LIMIT 1
             )
               AND started_at IS NULL
             RETURNING {}",
            Self::columns(kind)
        ))
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref()
            .map(|row| Self::parse_job_row(kind, row))
            .transpose()
    }

    /// Remove a finished job.
    pub async fn complete(&self, kind: JobKind, id: i64) -> Result<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    pub async fn get(&self, kind: JobKind, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            Self::columns(kind),
            kind.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref()
            .map(|row| Self::parse_job_row(kind, row))
            .transpose()
    }

    /// Number of rows of `kind`, claimed or not.
    pub async fn count(&self, kind: JobKind) -> Result<i64> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", kind.table()))
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }

    /// Number of unclaimed rows of `kind`.
    pub async fn pending_count(&self, kind: JobKind) -> Result<i64> {
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE started_at IS NULL",
            kind.table()
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)
    }

    /// Notification jobs for a message, oldest first.
    pub async fn notification_jobs_for_message(
        &self,
        message_id: i64,
    ) -> Result<Vec<EmailNotificationMessageJob>> {
        let rows = sqlx::query(
            "SELECT id, created_at, start_at, expires_at, started_at, message_id
             FROM email_notification_message_jobs
             WHERE message_id = ?
             ORDER BY id",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_notification_row).collect()
    }

    /// Queued outbound emails, oldest first.
    pub async fn list_send_email(&self) -> Result<Vec<SendEmailJob>> {
        let rows = sqlx::query(
            "SELECT id, created_at, start_at, expires_at, started_at, mail_options
             FROM send_email_jobs
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_send_email_row).collect()
    }
}

/// Insert a send-email job inside an existing transaction.
pub(crate) async fn insert_send_email_tx(
    tx: &mut Transaction<'_, Sqlite>,
    mail: &MailOptions,
    now: DateTime<Utc>,
    expiry: Duration,
) -> Result<i64> {
    let mail_options = serde_json::to_string(mail)?;
    sqlx::query_scalar(
        "INSERT INTO send_email_jobs (created_at, start_at, expires_at, mail_options)
         VALUES (?, ?, ?, ?)
         RETURNING id",
    )
    .bind(now)
    .bind(now)
    .bind(now + expiry)
    .bind(mail_options)
    .fetch_one(&mut **tx)
    .await
    .map_err(Error::Database)
}
