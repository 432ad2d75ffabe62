//! Test fixtures for database integration tests.
//!
//! Every [`TestDatabase`] is a fresh in-memory SQLite database with the
//! migrations applied, so tests never share state and need no cleanup.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courselore_db::test_fixtures::TestDatabase;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let test_db = TestDatabase::new().await;
//!     let fixture = test_db.course_fixture().await;
//!     let conversation = test_db
//!         .conversation(&fixture.student, ConversationType::Question)
//!         .await;
//!     // Run your tests...
//! }
//! ```

use chrono::{DateTime, Utc};

use courselore_core::{
    Conversation, ConversationParticipants, ConversationType, Course, CourseRole,
    CreateConversationRequest, Enrollment, NotificationPreferences,
};

use crate::{Database, NewUser};

/// In-memory database URL used by tests.
pub const TEST_DATABASE_URL: &str = "sqlite::memory:";

/// A migrated in-memory database.
pub struct TestDatabase {
    pub db: Database,
}

/// A course with one staff member and two students.
pub struct CourseFixture {
    pub course: Course,
    pub staff: Enrollment,
    pub student: Enrollment,
    pub other_student: Enrollment,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let db = Database::connect(TEST_DATABASE_URL)
            .await
            .expect("Failed to open in-memory database");
        db.migrate().await.expect("Failed to run migrations");
        Self { db }
    }

    /// A migrated database at `url`, for tests that need a real file and a
    /// multi-connection pool.
    pub async fn open(url: &str) -> Self {
        let db = Database::connect(url)
            .await
            .expect("Failed to open database");
        db.migrate().await.expect("Failed to run migrations");
        Self { db }
    }

    /// Create a course with a staff member and two students, all with
    /// verified emails and recommended preferences.
    pub async fn course_fixture(&self) -> CourseFixture {
        let now = Utc::now();
        let course = self
            .db
            .courses
            .create_course("1001", "Principles of Programming Languages", now)
            .await
            .expect("Failed to create course");

        let preferences = NotificationPreferences::recommended();
        let staff = self
            .enroll(&course, "staff", "1", CourseRole::Staff, preferences)
            .await;
        let student = self
            .enroll(&course, "student", "2", CourseRole::Student, preferences)
            .await;
        let other_student = self
            .enroll(&course, "other", "3", CourseRole::Student, preferences)
            .await;

        CourseFixture {
            course,
            staff,
            student,
            other_student,
        }
    }

    /// Create a verified user and enroll them.
    pub async fn enroll(
        &self,
        course: &Course,
        name: &str,
        reference: &str,
        role: CourseRole,
        preferences: NotificationPreferences,
    ) -> Enrollment {
        let now = Utc::now();
        let user = self
            .db
            .courses
            .create_user(
                NewUser::new(format!("{name}@example.edu"), name, now).with_preferences(preferences),
                now,
            )
            .await
            .expect("Failed to create user");
        self.db
            .courses
            .enroll(user.id, course.id, reference, role, now)
            .await
            .expect("Failed to enroll user")
    }

    /// Open an `everyone` conversation authored by `author`.
    pub async fn conversation(&self, author: &Enrollment, kind: ConversationType) -> Conversation {
        self.conversation_with(author, create_request(kind), Utc::now())
            .await
    }

    /// Open a conversation from an explicit request.
    pub async fn conversation_with(
        &self,
        author: &Enrollment,
        req: CreateConversationRequest,
        now: DateTime<Utc>,
    ) -> Conversation {
        let created = self
            .db
            .messages
            .create_conversation(author.course_id, author, &req, now)
            .await
            .expect("Failed to create conversation");
        self.db
            .courses
            .get_conversation_by_id(created.conversation_id)
            .await
            .expect("Failed to load conversation")
            .expect("Conversation missing after insert")
    }
}

/// A minimal `everyone` conversation request.
pub fn create_request(kind: ConversationType) -> CreateConversationRequest {
    CreateConversationRequest {
        conversation_type: kind,
        participants: ConversationParticipants::Everyone,
        selected_participants: vec![],
        title: "Homework 3".to_string(),
        content: "How do I start?".to_string(),
        is_anonymous: false,
        is_announcement: false,
    }
}
