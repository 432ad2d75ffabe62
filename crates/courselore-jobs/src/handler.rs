//! Job handlers for each job kind.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use courselore_core::defaults::{
    NOTIFICATION_JOB_DELAY_SECS, NOTIFICATION_JOB_EXPIRY_SECS, SEND_EMAIL_JOB_EXPIRY_SECS,
};
use courselore_core::{Error, Job, JobKind, Mailer, Result};
use courselore_db::Database;

use crate::email::EmailRenderer;

/// Context provided to job handlers.
pub struct JobContext {
    /// The claimed job.
    pub job: Job,
    /// Clock reading the worker claimed the job at.
    pub now: DateTime<Utc>,
}

impl JobContext {
    pub fn new(job: Job, now: DateTime<Utc>) -> Self {
        Self { job, now }
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Done; the job row can be deleted.
    Success,
    /// Failed; the claim stays until the timeout sweep releases it.
    Failed(String),
}

impl From<Result<()>> for JobResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The queue this handler drains.
    fn kind(&self) -> JobKind;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    fn can_handle(&self, kind: JobKind) -> bool {
        self.kind() == kind
    }
}

/// Notification timing.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Delay before a notification job is due; edits inside it coalesce.
    pub delay_secs: i64,
    /// Lifetime of a notification job after its start time.
    pub expiry_secs: i64,
    /// Lifetime of each queued email.
    pub send_email_expiry_secs: i64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            delay_secs: NOTIFICATION_JOB_DELAY_SECS,
            expiry_secs: NOTIFICATION_JOB_EXPIRY_SECS,
            send_email_expiry_secs: SEND_EMAIL_JOB_EXPIRY_SECS,
        }
    }
}

impl NotificationConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `NOTIFICATION_JOB_DELAY_SECS` | `300` | Delay before notifying |
    /// | `NOTIFICATION_JOB_EXPIRY_SECS` | `18000` | Give up after this long |
    /// | `SEND_EMAIL_JOB_EXPIRY_SECS` | `1200` | Drop undelivered emails after this long |
    pub fn from_env() -> Self {
        let read = |name: &str, default: i64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v >= 0)
                .unwrap_or(default)
        };
        Self {
            delay_secs: read("NOTIFICATION_JOB_DELAY_SECS", NOTIFICATION_JOB_DELAY_SECS),
            expiry_secs: read("NOTIFICATION_JOB_EXPIRY_SECS", NOTIFICATION_JOB_EXPIRY_SECS),
            send_email_expiry_secs: read("SEND_EMAIL_JOB_EXPIRY_SECS", SEND_EMAIL_JOB_EXPIRY_SECS),
        }
    }

    pub fn with_delay(mut self, secs: i64) -> Self {
        self.delay_secs = secs;
        self
    }

    pub fn with_expiry(mut self, secs: i64) -> Self {
        self.expiry_secs = secs;
        self
    }

    pub fn with_send_email_expiry(mut self, secs: i64) -> Self {
        self.send_email_expiry_secs = secs;
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::seconds(self.delay_secs)
    }

    pub fn expiry(&self) -> Duration {
        Duration::seconds(self.expiry_secs)
    }

    pub fn send_email_expiry(&self) -> Duration {
        Duration::seconds(self.send_email_expiry_secs)
    }
}

/// Works out who must hear about a message and queues their emails.
pub struct NotificationHandler {
    db: Database,
    renderer: EmailRenderer,
    config: NotificationConfig,
}

impl NotificationHandler {
    pub fn new(db: Database, renderer: EmailRenderer, config: NotificationConfig) -> Self {
        Self {
            db,
            renderer,
            config,
        }
    }

    async fn notify(&self, message_id: i64, now: DateTime<Utc>) -> Result<()> {
        // A deleted message takes its pending jobs with it; a job claimed
        // before the delete has nothing left to do.
        let Some(message) = self.db.messages.get_message_by_id(message_id).await? else {
            debug!(message_id, "Message no longer exists, nothing to notify");
            return Ok(());
        };
        let conversation = self
            .db
            .courses
            .get_conversation_by_id(message.conversation_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("conversation {}", message.conversation_id)))?;
        let course = self
            .db
            .courses
            .get_course(conversation.course_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("course {}", conversation.course_id)))?;

        let mentions = self
            .db
            .messages
            .processor()
            .process(&message.content_source)?
            .mentions;

        self.db
            .notifications
            .deliver(
                &conversation,
                &message,
                &mentions,
                now,
                self.config.send_email_expiry(),
                |recipient| Ok(self.renderer.render(&course, &conversation, &message, recipient)),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    fn kind(&self) -> JobKind {
        JobKind::EmailNotificationMessage
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match ctx.job {
            Job::EmailNotificationMessage(job) => self.notify(job.message_id, ctx.now).await.into(),
            other => JobResult::Failed(format!("unexpected {} job", other.kind())),
        }
    }
}

/// Hands queued emails to the mail sender.
pub struct SendEmailHandler {
    mailer: Arc<dyn Mailer>,
}

impl SendEmailHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for SendEmailHandler {
    fn kind(&self) -> JobKind {
        JobKind::SendEmail
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match ctx.job {
            Job::SendEmail(job) => self.mailer.send(&job.mail_options).await.into(),
            other => JobResult::Failed(format!("unexpected {} job", other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courselore_core::{MailOptions, SendEmailJob};

    use crate::mailer::LogMailer;

    fn send_email_job() -> Job {
        let now = Utc::now();
        Job::SendEmail(SendEmailJob {
            id: 1,
            created_at: now,
            start_at: now,
            expires_at: now + Duration::minutes(20),
            started_at: Some(now),
            mail_options: MailOptions {
                to: "ada@example.edu".to_string(),
                subject: "Hello".to_string(),
                html: "<p>Hello</p>".to_string(),
                in_reply_to: None,
                references: None,
            },
        })
    }

    #[test]
    fn test_job_result_from_result() {
        assert_eq!(JobResult::from(Ok(())), JobResult::Success);
        assert_eq!(
            JobResult::from(Err(Error::Mail("relay down".to_string()))),
            JobResult::Failed("Mail error: relay down".to_string())
        );
    }

    #[test]
    fn test_notification_config_defaults_and_builders() {
        let config = NotificationConfig::default();
        assert_eq!(config.delay(), Duration::minutes(5));
        assert_eq!(config.expiry(), Duration::hours(5));
        assert_eq!(config.send_email_expiry(), Duration::minutes(20));

        let config = config.with_delay(0).with_expiry(60).with_send_email_expiry(30);
        assert_eq!(config.delay(), Duration::zero());
        assert_eq!(config.expiry(), Duration::seconds(60));
        assert_eq!(config.send_email_expiry(), Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_send_email_handler_delivers() {
        let mailer = LogMailer::new();
        let handler = SendEmailHandler::new(Arc::new(mailer.clone()));
        assert!(handler.can_handle(JobKind::SendEmail));
        assert!(!handler.can_handle(JobKind::EmailNotificationMessage));

        let result = handler
            .execute(JobContext::new(send_email_job(), Utc::now()))
            .await;
        assert_eq!(result, JobResult::Success);
        assert_eq!(mailer.sent().await[0].to, "ada@example.edu");
    }
}
