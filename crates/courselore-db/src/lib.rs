//! # courselore-db
//!
//! Embedded SQLite store for Courselore.
//!
//! This crate provides:
//! - Connection pool management
//! - Schema migrations
//! - The course directory the message pipeline reads from
//! - The message store (post, chat append, edit, delete, likes, endorsements)
//! - The notification eligibility engine and its delivery ledger
//! - The durable job queues
//!
//! ## Example
//!
//! ```rust,ignore
//! use courselore_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("sqlite://courselore.db").await?;
//!     db.migrate().await?;
//!
//!     let course = db.courses.get_course_by_reference("1001").await?;
//!     println!("{:?}", course);
//!     Ok(())
//! }
//! ```

pub mod courses;
pub mod jobs;
pub mod messages;
pub mod notifications;
pub mod pool;
pub mod recipient_filter;
mod rows;

// Test fixtures for integration tests
pub mod test_fixtures;

use std::sync::Arc;

use tokio::sync::Notify;

// Re-export core types
pub use courselore_core::*;

pub use courses::{NewUser, SqliteCourseRepository};
pub use jobs::{SqliteJobRepository, TimedOutJobs};
pub use messages::SqliteMessageRepository;
pub use notifications::SqliteNotificationRepository;
pub use pool::{begin_write, create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use recipient_filter::{QueryParam, RecipientQueryBuilder};

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Sqlite>,
    /// Users, courses, enrollments, conversations.
    pub courses: SqliteCourseRepository,
    /// Messages and their social state.
    pub messages: SqliteMessageRepository,
    /// Recipient computation and delivery ledger.
    pub notifications: SqliteNotificationRepository,
    /// Job queues for background processing.
    pub jobs: SqliteJobRepository,
}

impl Database {
    /// Create a new Database instance using the basic content processor.
    pub fn new(pool: sqlx::Pool<sqlx::Sqlite>) -> Self {
        Self::with_processor(pool, Arc::new(BasicContentProcessor::new()))
    }

    /// Create a new Database instance with a custom content processor.
    pub fn with_processor(
        pool: sqlx::Pool<sqlx::Sqlite>,
        processor: Arc<dyn ContentProcessor>,
    ) -> Self {
        let notify = Arc::new(Notify::new());
        Self {
            courses: SqliteCourseRepository::new(pool.clone()),
            messages: SqliteMessageRepository::new(pool.clone(), processor),
            notifications: SqliteNotificationRepository::new(pool.clone(), notify.clone()),
            jobs: SqliteJobRepository::with_notify(pool.clone(), notify),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Sqlite> {
        &self.pool
    }
}
