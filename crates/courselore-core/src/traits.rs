//! Seams to external collaborators.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{MailOptions, ProcessedContent};

/// Turns raw message source into sanitized HTML, a search string and the set
/// of mentions it contains.
///
/// Implementations must be deterministic for a given source: the notification
/// worker re-processes stored source to recover mentions.
pub trait ContentProcessor: Send + Sync {
    fn process(&self, source: &str) -> Result<ProcessedContent>;
}

/// Performs actual delivery of one outbound email.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn send(&self, mail: &MailOptions) -> Result<()>;
}
