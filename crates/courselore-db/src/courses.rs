//! Course directory: users, courses, enrollments and conversations.
//!
//! This is the context the message pipeline reads from. Authentication and
//! the settings screens that normally write these rows live elsewhere; the
//! write operations here exist for bootstrapping and tests.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, Transaction};
use tracing::debug;

use courselore_core::{
    Conversation, Course, CourseRole, Enrollment, Error, NotificationPreferences, Result, User,
};

use crate::rows::{
    conversation_from_row, enrollment_from_row, user_from_row, CONVERSATION_COLUMNS,
    ENROLLMENT_COLUMNS,
};

/// Data for a new user account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub preferences: NotificationPreferences,
}

impl NewUser {
    /// A verified user with the recommended notification preferences.
    pub fn new(email: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            email_verified_at: Some(now),
            preferences: NotificationPreferences::recommended(),
        }
    }

    pub fn unverified(mut self) -> Self {
        self.email_verified_at = None;
        self
    }

    pub fn with_preferences(mut self, preferences: NotificationPreferences) -> Self {
        self.preferences = preferences;
        self
    }
}

/// SQLite implementation of the course directory.
#[derive(Clone)]
pub struct SqliteCourseRepository {
    pool: Pool<Sqlite>,
}

impl SqliteCourseRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    // =========================================================================
    // USERS
    // =========================================================================

    pub async fn create_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<User> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (created_at, email, email_verified_at, name,
                 email_notifications_for_all_messages,
                 email_notifications_for_mentions,
                 email_notifications_for_participated_conversations,
                 email_notifications_for_started_conversations)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(now)
        .bind(&user.email)
        .bind(user.email_verified_at)
        .bind(&user.name)
        .bind(user.preferences.all_messages)
        .bind(user.preferences.mentions)
        .bind(user.preferences.participated_conversations)
        .bind(user.preferences.started_conversations)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(subsystem = "database", component = "courses", user_id = id, "Created user");
        Ok(User {
            id,
            email: user.email,
            email_verified_at: user.email_verified_at,
            name: user.name,
            preferences: user.preferences,
        })
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT u.id AS user_id, u.email AS user_email,
                    u.email_verified_at AS user_email_verified_at, u.name AS user_name,
                    u.email_notifications_for_all_messages AS user_all_messages,
                    u.email_notifications_for_mentions AS user_mentions,
                    u.email_notifications_for_participated_conversations AS user_participated_conversations,
                    u.email_notifications_for_started_conversations AS user_started_conversations
             FROM users u WHERE u.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn verify_email(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE users SET email_verified_at = ? WHERE id = ?")
            .bind(now)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("user {user_id}")));
        }
        Ok(())
    }

    pub async fn update_notification_preferences(
        &self,
        user_id: i64,
        preferences: NotificationPreferences,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET
                 email_notifications_for_all_messages = ?,
                 email_notifications_for_mentions = ?,
                 email_notifications_for_participated_conversations = ?,
                 email_notifications_for_started_conversations = ?
             WHERE id = ?",
        )
        .bind(preferences.all_messages)
        .bind(preferences.mentions)
        .bind(preferences.participated_conversations)
        .bind(preferences.started_conversations)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("user {user_id}")));
        }
        Ok(())
    }

    // =========================================================================
    // COURSES
    // =========================================================================

    pub async fn create_course(
        &self,
        reference: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Course> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO courses (created_at, reference, name) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(now)
        .bind(reference)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Course {
            id,
            reference: reference.to_string(),
            name: name.to_string(),
            next_conversation_reference: 1,
        })
    }

    pub async fn get_course(&self, id: i64) -> Result<Option<Course>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let course = get_course_tx(&mut tx, id).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(course)
    }

    pub async fn get_course_by_reference(&self, reference: &str) -> Result<Option<Course>> {
        let row = sqlx::query(
            "SELECT id, reference, name, next_conversation_reference
             FROM courses WHERE reference = ?",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(course_from_row).transpose()
    }

    // =========================================================================
    // ENROLLMENTS
    // =========================================================================

    pub async fn enroll(
        &self,
        user_id: i64,
        course_id: i64,
        reference: &str,
        course_role: CourseRole,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO enrollments (created_at, user_id, course_id, reference, course_role)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(now)
        .bind(user_id)
        .bind(course_id)
        .bind(reference)
        .bind(course_role.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        self.get_enrollment(id)
            .await?
            .ok_or_else(|| Error::Internal(format!("enrollment {id} vanished after insert")))
    }

    /// Remove an enrollment. Rows it authored survive with a tombstoned author.
    pub async fn remove_enrollment(&self, enrollment_id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM enrollments WHERE id = ?")
            .bind(enrollment_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("enrollment {enrollment_id}")));
        }
        debug!(
            subsystem = "database",
            component = "courses",
            enrollment_id,
            "Removed enrollment"
        );
        Ok(())
    }

    pub async fn get_enrollment(&self, id: i64) -> Result<Option<Enrollment>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let enrollment = get_enrollment_tx(&mut tx, id).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(enrollment)
    }

    pub async fn get_enrollment_by_reference(
        &self,
        course_id: i64,
        reference: &str,
    ) -> Result<Option<Enrollment>> {
        let row = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS}
             FROM enrollments e JOIN users u ON u.id = e.user_id
             WHERE e.course_id = ? AND e.reference = ?"
        ))
        .bind(course_id)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(match row {
            Some(row) => enrollment_from_row(&row)?,
            None => None,
        })
    }

    /// The enrollment of `user_id` in `course_id`, if any.
    pub async fn get_enrollment_for_user(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<Enrollment>> {
        let row = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS}
             FROM enrollments e JOIN users u ON u.id = e.user_id
             WHERE e.course_id = ? AND e.user_id = ?"
        ))
        .bind(course_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(match row {
            Some(row) => enrollment_from_row(&row)?,
            None => None,
        })
    }

    pub async fn list_enrollments(&self, course_id: i64) -> Result<Vec<Enrollment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS}
             FROM enrollments e JOIN users u ON u.id = e.user_id
             WHERE e.course_id = ?
             ORDER BY e.id"
        ))
        .bind(course_id)
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

    // =========================================================================
    // CONVERSATIONS
    // =========================================================================

    pub async fn get_conversation(
        &self,
        course_id: i64,
        reference: &str,
    ) -> Result<Option<Conversation>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let conversation = get_conversation_by_reference_tx(&mut tx, course_id, reference).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(conversation)
    }

    pub async fn get_conversation_by_id(&self, id: i64) -> Result<Option<Conversation>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let conversation = get_conversation_tx(&mut tx, id).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(conversation)
    }

    pub async fn selected_participants(&self, conversation_id: i64) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let selected = selected_participants_tx(&mut tx, conversation_id).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(selected)
    }
}

// =============================================================================
// TRANSACTION-SCOPED READS (shared with the message store and notifications)
// =============================================================================

fn course_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Course> {
    Ok(Course {
        id: row.try_get("id")?,
        reference: row.try_get("reference")?,
        name: row.try_get("name")?,
        next_conversation_reference: row.try_get("next_conversation_reference")?,
    })
}

pub(crate) async fn get_course_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
) -> Result<Option<Course>> {
    let row = sqlx::query(
        "SELECT id, reference, name, next_conversation_reference FROM courses WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)?;

    row.as_ref().map(course_from_row).transpose()
}

pub(crate) async fn get_enrollment_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
) -> Result<Option<Enrollment>> {
    let row = sqlx::query(&format!(
        "SELECT {ENROLLMENT_COLUMNS}
         FROM enrollments e JOIN users u ON u.id = e.user_id
         WHERE e.id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)?;

    Ok(match row {
        Some(row) => enrollment_from_row(&row)?,
        None => None,
    })
}

pub(crate) async fn selected_participants_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: i64,
) -> Result<Vec<i64>> {
    sqlx::query_scalar(
        "SELECT enrollment_id FROM conversation_selected_participants
         WHERE conversation_id = ?
         ORDER BY enrollment_id",
    )
    .bind(conversation_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(Error::Database)
}

pub(crate) async fn get_conversation_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
) -> Result<Option<Conversation>> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS}, {ENROLLMENT_COLUMNS}
         FROM conversations c
         LEFT JOIN enrollments e ON e.id = c.author_enrollment_id
         LEFT JOIN users u ON u.id = e.user_id
         WHERE c.id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(Error::Database)?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut conversation = conversation_from_row(&row)?;
    conversation.selected_participants = selected_participants_tx(tx, conversation.id).await?;
    Ok(Some(conversation))
}

pub(crate) async fn get_conversation_by_reference_tx(
    tx: &mut Transaction<'_, Sqlite>,
    course_id: i64,
    reference: &str,
) -> Result<Option<Conversation>> {
    let id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM conversations WHERE course_id = ? AND reference = ?")
            .bind(course_id)
            .bind(reference)
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;

    match id {
        Some(id) => get_conversation_tx(tx, id).await,
        None => Ok(None),
    }
}
