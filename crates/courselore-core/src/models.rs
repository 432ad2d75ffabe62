//! Core data models for Courselore.
//!
//! These types are shared across all Courselore crates and represent the
//! course-discussion domain: enrollments, conversations, messages and the
//! background jobs that turn new messages into notification emails.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

// =============================================================================
// PEOPLE
// =============================================================================

/// Role an enrollment carries inside its course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseRole {
    Staff,
    Student,
}

impl std::fmt::Display for CourseRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staff => write!(f, "staff"),
            Self::Student => write!(f, "student"),
        }
    }
}

impl std::str::FromStr for CourseRole {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "staff" => Ok(Self::Staff),
            "student" => Ok(Self::Student),
            _ => Err(format!("Invalid course role: {}", s)),
        }
    }
}

/// Per-user email notification switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    /// Email every message the user can see.
    pub all_messages: bool,
    /// Email messages that mention the user (directly or through a group).
    pub mentions: bool,
    /// Email messages in conversations the user has posted in.
    pub participated_conversations: bool,
    /// Email messages in conversations the user started.
    pub started_conversations: bool,
}

impl NotificationPreferences {
    /// Preferences of a freshly signed-up user.
    pub fn recommended() -> Self {
        Self {
            all_messages: false,
            mentions: true,
            participated_conversations: true,
            started_conversations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub name: String,
    pub preferences: NotificationPreferences,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub reference: String,
    pub name: String,
    pub next_conversation_reference: i64,
}

/// A user's role-bearing membership in one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: i64,
    pub user: User,
    pub course_id: i64,
    pub reference: String,
    pub course_role: CourseRole,
}

impl Enrollment {
    pub fn is_staff(&self) -> bool {
        self.course_role == CourseRole::Staff
    }
}

/// An enrollment that may have been removed since it was referenced.
///
/// Messages, conversations and readings outlive the enrollment that produced
/// them; when the enrollment row is gone the reference becomes
/// [`MaybeEnrollment::NoLongerEnrolled`] instead of disappearing.
#[derive(Debug, Clone, PartialEq)]
pub enum MaybeEnrollment {
    Enrolled(Enrollment),
    NoLongerEnrolled,
}

impl MaybeEnrollment {
    pub fn enrolled(&self) -> Option<&Enrollment> {
        match self {
            Self::Enrolled(enrollment) => Some(enrollment),
            Self::NoLongerEnrolled => None,
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.enrolled().map(|e| e.id)
    }

    /// Whether this still refers to the given enrollment.
    pub fn is(&self, enrollment: &Enrollment) -> bool {
        self.id() == Some(enrollment.id)
    }

    pub fn is_staff(&self) -> bool {
        self.enrolled().is_some_and(Enrollment::is_staff)
    }
}

impl From<Option<Enrollment>> for MaybeEnrollment {
    fn from(value: Option<Enrollment>) -> Self {
        match value {
            Some(enrollment) => Self::Enrolled(enrollment),
            None => Self::NoLongerEnrolled,
        }
    }
}

impl Serialize for MaybeEnrollment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Enrolled(enrollment) => enrollment.serialize(serializer),
            Self::NoLongerEnrolled => serializer.serialize_str("no-longer-enrolled"),
        }
    }
}

// =============================================================================
// CONVERSATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Question,
    Note,
    Chat,
}

impl std::fmt::Display for ConversationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Question => write!(f, "question"),
            Self::Note => write!(f, "note"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

impl std::str::FromStr for ConversationType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "question" => Ok(Self::Question),
            "note" => Ok(Self::Note),
            "chat" => Ok(Self::Chat),
            _ => Err(format!("Invalid conversation type: {}", s)),
        }
    }
}

/// Who can see (and be notified about) a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationParticipants {
    Everyone,
    Staff,
    SelectedPeople,
}

impl std::fmt::Display for ConversationParticipants {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Everyone => write!(f, "everyone"),
            Self::Staff => write!(f, "staff"),
            Self::SelectedPeople => write!(f, "selected-people"),
        }
    }
}

impl std::str::FromStr for ConversationParticipants {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "everyone" => Ok(Self::Everyone),
            "staff" => Ok(Self::Staff),
            "selected-people" => Ok(Self::SelectedPeople),
            _ => Err(format!("Invalid conversation participants: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub course_id: i64,
    pub reference: String,
    pub author: MaybeEnrollment,
    pub anonymous_at: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participants: ConversationParticipants,
    /// Enrollment ids listed explicitly as participants.
    pub selected_participants: Vec<i64>,
    pub title: String,
    pub announcement_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub next_message_reference: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn is_question(&self) -> bool {
        self.conversation_type == ConversationType::Question
    }

    pub fn is_chat(&self) -> bool {
        self.conversation_type == ConversationType::Chat
    }

    pub fn is_announcement(&self) -> bool {
        self.announcement_at.is_some()
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Reference of the message that opens every conversation.
pub const FIRST_MESSAGE_REFERENCE: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub conversation_id: i64,
    pub reference: String,
    pub author: MaybeEnrollment,
    pub anonymous_at: Option<DateTime<Utc>>,
    pub answer_at: Option<DateTime<Utc>>,
    pub content_source: String,
    pub content_preprocessed: String,
    pub content_search: String,
}

impl Message {
    pub fn is_first(&self) -> bool {
        self.reference == FIRST_MESSAGE_REFERENCE
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous_at.is_some()
    }

    pub fn is_answer(&self) -> bool {
        self.answer_at.is_some()
    }
}

/// One row of the "seen by" list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub message_id: i64,
    pub enrollment: MaybeEnrollment,
}

/// Ledger entry: this enrollment has been accounted for on this message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationDelivery {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub message_id: i64,
    pub enrollment_id: i64,
}

/// Body of a `POST .../messages` request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub content: String,
    #[serde(default)]
    pub is_answer: bool,
    #[serde(default)]
    pub is_anonymous: bool,
}

/// Body of a `PATCH .../messages/:message` request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageRequest {
    pub content: Option<String>,
    pub is_answer: Option<bool>,
    pub is_anonymous: Option<bool>,
}

impl EditMessageRequest {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.is_answer.is_none() && self.is_anonymous.is_none()
    }
}

/// Result of posting into a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePosted {
    pub message_id: i64,
    pub reference: String,
    /// True when the post was appended to the author's previous chat message.
    pub appended: bool,
}

/// Body of a `POST /courses/:course/conversations` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub participants: ConversationParticipants,
    /// Enrollment references of explicitly selected participants.
    #[serde(default)]
    pub selected_participants: Vec<String>,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub is_announcement: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationCreated {
    pub conversation_id: i64,
    pub reference: String,
    pub message_id: i64,
}

// =============================================================================
// CONTENT
// =============================================================================

/// A parsed `@mention` inside message content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mention {
    Everyone,
    Staff,
    Students,
    /// Reference of a specific enrollment.
    Enrollment(String),
}

impl Mention {
    /// Parse a mention token (without the leading `@`).
    ///
    /// Enrollment mentions are written `reference--display-name`; only the
    /// reference part is kept.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "" => None,
            "everyone" => Some(Self::Everyone),
            "staff" => Some(Self::Staff),
            "students" => Some(Self::Students),
            _ => {
                let reference = token.split("--").next().unwrap_or(token);
                if reference.is_empty() || !reference.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return None;
                }
                Some(Self::Enrollment(reference.to_string()))
            }
        }
    }
}

/// Output of the content processor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedContent {
    /// Sanitized HTML.
    pub html: String,
    /// Plain text for full-text search.
    pub search: String,
    pub mentions: BTreeSet<Mention>,
}

// =============================================================================
// JOBS
// =============================================================================

/// The two job queues sharing the same claim/expire/release mechanics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Compose and deliver one email.
    SendEmail,
    /// Compute the recipients of one message and enqueue their emails.
    EmailNotificationMessage,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::EmailNotificationMessage, JobKind::SendEmail];

    /// Backing table.
    pub fn table(self) -> &'static str {
        match self {
            Self::SendEmail => "send_email_jobs",
            Self::EmailNotificationMessage => "email_notification_message_jobs",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendEmail => write!(f, "send_email"),
            Self::EmailNotificationMessage => write!(f, "email_notification_message"),
        }
    }
}

/// Headers and body of one outbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailOptions {
    pub to: String,
    pub subject: String,
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendEmailJob {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub start_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub mail_options: MailOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailNotificationMessageJob {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub start_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub message_id: i64,
}

/// A job claimed by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    SendEmail(SendEmailJob),
    EmailNotificationMessage(EmailNotificationMessageJob),
}

impl Job {
    pub fn id(&self) -> i64 {
        match self {
            Self::SendEmail(job) => job.id,
            Self::EmailNotificationMessage(job) => job.id,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::SendEmail(_) => JobKind::SendEmail,
            Self::EmailNotificationMessage(_) => JobKind::EmailNotificationMessage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment(id: i64, role: CourseRole) -> Enrollment {
        Enrollment {
            id,
            user: User {
                id,
                email: format!("user{id}@example.edu"),
                email_verified_at: None,
                name: format!("User {id}"),
                preferences: NotificationPreferences::default(),
            },
            course_id: 1,
            reference: format!("{id}00"),
            course_role: role,
        }
    }

    #[test]
    fn test_course_role_round_trip_strings() {
        assert_eq!("staff".parse::<CourseRole>().unwrap(), CourseRole::Staff);
        assert_eq!(CourseRole::Student.to_string(), "student");
        assert!("teacher".parse::<CourseRole>().is_err());
    }

    #[test]
    fn test_participants_kebab_case() {
        assert_eq!(
            "selected-people".parse::<ConversationParticipants>().unwrap(),
            ConversationParticipants::SelectedPeople
        );
        let json = serde_json::to_string(&ConversationParticipants::SelectedPeople).unwrap();
        assert_eq!(json, r#""selected-people""#);
    }

    #[test]
    fn test_maybe_enrollment_tombstone() {
        let tombstone = MaybeEnrollment::NoLongerEnrolled;
        assert_eq!(tombstone.id(), None);
        assert!(!tombstone.is_staff());
        assert_eq!(
            serde_json::to_string(&tombstone).unwrap(),
            r#""no-longer-enrolled""#
        );
    }

    #[test]
    fn test_maybe_enrollment_is() {
        let staff = enrollment(1, CourseRole::Staff);
        let other = enrollment(2, CourseRole::Student);
        let author = MaybeEnrollment::Enrolled(staff.clone());
        assert!(author.is(&staff));
        assert!(!author.is(&other));
        assert!(author.is_staff());
        assert_eq!(MaybeEnrollment::from(None), MaybeEnrollment::NoLongerEnrolled);
    }

    #[test]
    fn test_mention_parse() {
        assert_eq!(Mention::parse("everyone"), Some(Mention::Everyone));
        assert_eq!(Mention::parse("staff"), Some(Mention::Staff));
        assert_eq!(Mention::parse("students"), Some(Mention::Students));
        assert_eq!(
            Mention::parse("4821--ada-lovelace"),
            Some(Mention::Enrollment("4821".to_string()))
        );
        assert_eq!(Mention::parse(""), None);
        assert_eq!(Mention::parse("--nobody"), None);
    }

    #[test]
    fn test_edit_request_is_empty() {
        assert!(EditMessageRequest::default().is_empty());
        let req = EditMessageRequest {
            is_answer: Some(true),
            ..Default::default()
        };
        assert!(!req.is_empty());
    }

    #[test]
    fn test_post_request_defaults() {
        let req: PostMessageRequest = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert!(!req.is_answer);
        assert!(!req.is_anonymous);
    }

    #[test]
    fn test_mail_options_optional_headers_skipped() {
        let mail = MailOptions {
            to: "a@example.edu".to_string(),
            subject: "s".to_string(),
            html: "<p>h</p>".to_string(),
            in_reply_to: None,
            references: None,
        };
        let json = serde_json::to_string(&mail).unwrap();
        assert!(!json.contains("inReplyTo"));
        let back: MailOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mail);
    }

    #[test]
    fn test_job_kind_tables() {
        assert_eq!(JobKind::SendEmail.table(), "send_email_jobs");
        assert_eq!(
            JobKind::EmailNotificationMessage.to_string(),
            "email_notification_message"
        );
    }
}
