//! Outbound mail senders.
//!
//! [`SmtpMailer`] delivers through an SMTP relay. [`LogMailer`] only logs
//! and keeps what it was asked to send, for development and tests.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tokio::sync::Mutex;
use tracing::{info, warn};

use courselore_core::defaults::{MAIL_FROM, SMTP_PORT};
use courselore_core::{Error, MailOptions, Mailer, Result};

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

impl SmtpConfig {
    /// Read relay settings from the environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SMTP_HOST` | (none) | Relay host; unset means no SMTP |
    /// | `SMTP_PORT` | `587` | Relay port (STARTTLS) |
    /// | `SMTP_USERNAME` | (none) | Login |
    /// | `SMTP_PASSWORD` | (none) | Password |
    /// | `MAIL_FROM` | `Courselore <notifications@courselore.org>` | Sender |
    ///
    /// Returns `None` when `SMTP_HOST` is unset or empty.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST")
            .ok()
            .filter(|h| !h.trim().is_empty())?;
        let port = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(SMTP_PORT);

        Some(Self {
            host,
            port,
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
            from: std::env::var("MAIL_FROM").unwrap_or_else(|_| MAIL_FROM.to_string()),
        })
    }
}

/// Delivers through an SMTP relay with STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| Error::Config(format!("invalid MAIL_FROM address: {e}")))?;

        let builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| Error::Config(format!("failed to configure SMTP transport: {e}")))?
            .port(config.port);
        let builder = match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                builder.credentials(Credentials::new(username.clone(), password.clone()))
            }
            _ => builder,
        };

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn build_message(&self, mail: &MailOptions) -> Result<Message> {
        let to = mail
            .to
            .parse::<Mailbox>()
            .map_err(|e| Error::Mail(format!("invalid recipient {}: {e}", mail.to)))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.clone())
            .header(header::ContentType::TEXT_HTML);
        if let Some(in_reply_to) = &mail.in_reply_to {
            builder = builder.in_reply_to(in_reply_to.clone());
        }
        if let Some(references) = &mail.references {
            builder = builder.references(references.clone());
        }

        builder
            .body(mail.html.clone())
            .map_err(|e| Error::Mail(format!("failed to build email: {e}")))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, mail: &MailOptions) -> Result<()> {
        let message = self.build_message(mail)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| Error::Mail(format!("SMTP delivery failed: {e}")))?;
        info!(
            subsystem = "mail",
            component = "smtp",
            subject = %mail.subject,
            "Email sent"
        );
        Ok(())
    }
}

/// Logs instead of sending and remembers every email.
#[derive(Default, Clone)]
pub struct LogMailer {
    sent: Arc<Mutex<Vec<MailOptions>>>,
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, oldest first.
    pub async fn sent(&self) -> Vec<MailOptions> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, mail: &MailOptions) -> Result<()> {
        info!(
            subsystem = "mail",
            component = "log",
            to = %mail.to,
            subject = %mail.subject,
            "Email not sent (no SMTP relay configured)"
        );
        self.sent.lock().await.push(mail.clone());
        Ok(())
    }
}

/// SMTP when `SMTP_HOST` is set, otherwise the logging sender.
pub fn mailer_from_env() -> Result<Arc<dyn Mailer>> {
    match SmtpConfig::from_env() {
        Some(config) => {
            info!(host = %config.host, port = config.port, "Using SMTP mailer");
            Ok(Arc::new(SmtpMailer::new(&config)?))
        }
        None => {
            warn!("SMTP_HOST not set; outbound email will only be logged");
            Ok(Arc::new(LogMailer::new()))
        }
    }
}
