//! # courselore-jobs
//!
//! Background job processing for Courselore.
//!
//! This crate provides:
//! - The worker loop draining the notification and outbound email queues
//! - Handlers turning a message into recipient emails, and emails into mail
//! - SMTP and logging mail senders
//! - A scheduler owning the worker's start/wake/shutdown lifecycle
//!
//! ## Example
//!
//! ```ignore
//! use courselore_jobs::{
//!     mailer_from_env, EmailRenderer, NotificationConfig, NotificationHandler, Scheduler,
//!     SendEmailHandler, WorkerBuilder, WorkerConfig,
//! };
//! use courselore_db::Database;
//!
//! let db = Database::connect("sqlite://courselore.db").await?;
//!
//! let worker = WorkerBuilder::new(db.clone())
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(NotificationHandler::new(
//!         db.clone(),
//!         EmailRenderer::from_env(),
//!         NotificationConfig::from_env(),
//!     ))
//!     .with_handler(SendEmailHandler::new(mailer_from_env()?))
//!     .build()
//!     .await;
//!
//! let mut scheduler = Scheduler::new(worker);
//! scheduler.start()?;
//! // ...
//! scheduler.shutdown().await?;
//! ```

pub mod email;
pub mod handler;
pub mod mailer;
pub mod scheduler;
pub mod worker;

// Re-export core types
pub use courselore_core::*;

pub use email::EmailRenderer;
pub use handler::{
    JobContext, JobHandler, JobResult, NotificationConfig, NotificationHandler, SendEmailHandler,
};
pub use mailer::{mailer_from_env, LogMailer, SmtpConfig, SmtpMailer};
pub use scheduler::Scheduler;
pub use worker::{CycleStats, JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
