//! Notification eligibility and the delivery ledger.
//!
//! Each test posts into a fresh course and checks who the engine selects,
//! then runs delivery to check the ledger and the queued emails.

use chrono::{Duration, Utc};
use courselore_core::{
    extract_mentions, Conversation, ConversationParticipants, ConversationType, CourseRole,
    Enrollment, Error, JobKind, MailOptions, NotificationPreferences, PostMessageRequest,
};
use courselore_db::test_fixtures::{create_request, CourseFixture, TestDatabase};
use courselore_db::NewUser;

fn mail_for(enrollment: &Enrollment) -> courselore_core::Result<MailOptions> {
    Ok(MailOptions {
        to: enrollment.user.email.clone(),
        subject: "New message".to_string(),
        html: "<p>New message</p>".to_string(),
        in_reply_to: None,
        references: None,
    })
}

async fn post(
    test_db: &TestDatabase,
    conversation: &Conversation,
    author: &Enrollment,
    content: &str,
) -> String {
    let req = PostMessageRequest {
        content: content.to_string(),
        ..Default::default()
    };
    test_db
        .db
        .messages
        .post(conversation.id, author, &req, Utc::now())
        .await
        .expect("Failed to post message")
        .reference
}

/// Recipient ids for a message, reloading the conversation first.
async fn recipient_ids(test_db: &TestDatabase, conversation_id: i64, reference: &str) -> Vec<i64> {
    let conversation = test_db
        .db
        .courses
        .get_conversation_by_id(conversation_id)
        .await
        .unwrap()
        .unwrap();
    let message = test_db
        .db
        .messages
        .get_message(conversation_id, reference)
        .await
        .unwrap()
        .unwrap();
    let mentions = extract_mentions(&message.content_source);
    test_db
        .db
        .notifications
        .recipients(&conversation, &message, &mentions)
        .await
        .expect("Failed to compute recipients")
        .into_iter()
        .map(|enrollment| enrollment.id)
        .collect()
}

async fn deliver(test_db: &TestDatabase, conversation_id: i64, reference: &str) -> Vec<i64> {
    let conversation = test_db
        .db
        .courses
        .get_conversation_by_id(conversation_id)
        .await
        .unwrap()
        .unwrap();
    let message = test_db
        .db
        .messages
        .get_message(conversation_id, reference)
        .await
        .unwrap()
        .unwrap();
    let mentions = extract_mentions(&message.content_source);
    test_db
        .db
        .notifications
        .deliver(
            &conversation,
            &message,
            &mentions,
            Utc::now(),
            Duration::minutes(20),
            mail_for,
        )
        .await
        .expect("Failed to deliver notifications")
}

fn only(preferences: fn(&mut NotificationPreferences)) -> NotificationPreferences {
    let mut prefs = NotificationPreferences::default();
    preferences(&mut prefs);
    prefs
}

async fn enroll(
    test_db: &TestDatabase,
    f: &CourseFixture,
    name: &str,
    reference: &str,
    role: CourseRole,
    preferences: NotificationPreferences,
) -> Enrollment {
    test_db
        .enroll(&f.course, name, reference, role, preferences)
        .await
}

#[tokio::test]
async fn test_delivery_is_recorded_once() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let conversation = test_db.conversation(&f.student, ConversationType::Note).await;
    let reference = post(&test_db, &conversation, &f.other_student, "@everyone heads up").await;

    let first = deliver(&test_db, conversation.id, &reference).await;
    assert_eq!(first, vec![f.staff.id, f.student.id]);

    let second = deliver(&test_db, conversation.id, &reference).await;
    assert!(second.is_empty(), "second run must not notify anyone again");

    let message = test_db
        .db
        .messages
        .get_message(conversation.id, &reference)
        .await
        .unwrap()
        .unwrap();
    let deliveries = test_db.db.notifications.deliveries(message.id).await.unwrap();
    let mut accounted: Vec<i64> = deliveries.iter().map(|d| d.enrollment_id).collect();
    accounted.sort_unstable();
    // The author is accounted for when the message is posted.
    assert_eq!(accounted, vec![f.staff.id, f.student.id, f.other_student.id]);

    let emails = test_db.db.jobs.list_send_email().await.unwrap();
    assert_eq!(emails.len(), 2);
    assert_eq!(emails[0].mail_options.to, "staff@example.edu");
    assert_eq!(emails[1].mail_options.to, "student@example.edu");
}

#[tokio::test]
async fn test_author_is_never_a_recipient() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let everything = NotificationPreferences {
        all_messages: true,
        ..NotificationPreferences::recommended()
    };
    test_db
        .db
        .courses
        .update_notification_preferences(f.staff.user.id, everything)
        .await
        .unwrap();

    let conversation = test_db.conversation(&f.staff, ConversationType::Note).await;
    let reference = post(&test_db, &conversation, &f.staff, "@staff reminder").await;

    let recipients = recipient_ids(&test_db, conversation.id, &reference).await;
    assert!(!recipients.contains(&f.staff.id));
}

#[tokio::test]
async fn test_staff_mention_reaches_staff_only() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let mentions_only = only(|p| p.mentions = true);
    let ta = enroll(&test_db, &f, "ta", "4", CourseRole::Staff, mentions_only).await;
    let quiet_student = enroll(&test_db, &f, "quiet", "5", CourseRole::Student, mentions_only).await;

    let conversation = test_db
        .conversation(&f.student, ConversationType::Question)
        .await;
    let reference = post(&test_db, &conversation, &f.other_student, "@staff can you check?").await;

    let recipients = recipient_ids(&test_db, conversation.id, &reference).await;
    assert!(recipients.contains(&ta.id));
    assert!(recipients.contains(&f.staff.id));
    assert!(!recipients.contains(&quiet_student.id));
    // Started the conversation.
    assert!(recipients.contains(&f.student.id));
}

#[tokio::test]
async fn test_students_mention_reaches_students_only() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let mentions_only = only(|p| p.mentions = true);
    let ta = enroll(&test_db, &f, "ta", "4", CourseRole::Staff, mentions_only).await;
    let listener = enroll(&test_db, &f, "listener", "5", CourseRole::Student, mentions_only).await;

    let conversation = test_db.conversation(&f.staff, ConversationType::Note).await;
    let reference = post(&test_db, &conversation, &f.staff, "@students office hours moved").await;

    let recipients = recipient_ids(&test_db, conversation.id, &reference).await;
    assert!(recipients.contains(&listener.id));
    assert!(!recipients.contains(&ta.id));
    assert!(!recipients.contains(&f.staff.id));
}

#[tokio::test]
async fn test_enrollment_mention_by_reference() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let mentions_only = only(|p| p.mentions = true);
    let named = enroll(&test_db, &f, "named", "4", CourseRole::Student, mentions_only).await;
    let unnamed = enroll(&test_db, &f, "unnamed", "5", CourseRole::Student, mentions_only).await;

    let conversation = test_db.conversation(&f.staff, ConversationType::Note).await;
    let reference = post(
        &test_db,
        &conversation,
        &f.staff,
        "@4--named see this, but not `@5` in code",
    )
    .await;

    let recipients = recipient_ids(&test_db, conversation.id, &reference).await;
    assert!(recipients.contains(&named.id));
    assert!(!recipients.contains(&unnamed.id));
}

#[tokio::test]
async fn test_selected_people_bound_the_audience() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let everything = only(|p| p.all_messages = true);
    let outsider = enroll(&test_db, &f, "outsider", "4", CourseRole::Student, everything).await;

    let mut req = create_request(ConversationType::Note);
    req.participants = ConversationParticipants::SelectedPeople;
    req.selected_participants = vec![f.other_student.reference.clone()];
    let conversation = test_db.conversation_with(&f.student, req, Utc::now()).await;

    let reference = post(&test_db, &conversation, &f.other_student, "@everyone ping").await;

    let candidates: Vec<i64> = test_db
        .db
        .notifications
        .candidates(&conversation)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(candidates, vec![f.student.id, f.other_student.id]);

    let recipients = recipient_ids(&test_db, conversation.id, &reference).await;
    assert_eq!(recipients, vec![f.student.id]);
    assert!(!recipients.contains(&f.staff.id));
    assert!(!recipients.contains(&outsider.id));
}

#[tokio::test]
async fn test_staff_conversation_excludes_other_students() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    test_db
        .db
        .courses
        .update_notification_preferences(f.other_student.user.id, only(|p| p.all_messages = true))
        .await
        .unwrap();

    let mut req = create_request(ConversationType::Question);
    req.participants = ConversationParticipants::Staff;
    let conversation = test_db.conversation_with(&f.student, req, Utc::now()).await;
    let reference = post(&test_db, &conversation, &f.staff, "@everyone replying here").await;

    let recipients = recipient_ids(&test_db, conversation.id, &reference).await;
    assert_eq!(recipients, vec![f.student.id]);
}

#[tokio::test]
async fn test_unverified_email_is_skipped_until_verified() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let now = Utc::now();
    let user = test_db
        .db
        .courses
        .create_user(
            NewUser::new("pending@example.edu", "pending", now)
                .unverified()
                .with_preferences(only(|p| p.all_messages = true)),
            now,
        )
        .await
        .unwrap();
    let pending = test_db
        .db
        .courses
        .enroll(user.id, f.course.id, "4", CourseRole::Student, now)
        .await
        .unwrap();

    let conversation = test_db.conversation(&f.staff, ConversationType::Note).await;
    let reference = post(&test_db, &conversation, &f.staff, "Office hours moved").await;

    let before = recipient_ids(&test_db, conversation.id, &reference).await;
    assert!(!before.contains(&pending.id));

    test_db.db.courses.verify_email(user.id, Utc::now()).await.unwrap();
    let after = recipient_ids(&test_db, conversation.id, &reference).await;
    assert!(after.contains(&pending.id));
}

#[tokio::test]
async fn test_participated_and_started_preferences() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let bystander = enroll(
        &test_db,
        &f,
        "bystander",
        "4",
        CourseRole::Student,
        NotificationPreferences::recommended(),
    )
    .await;

    let conversation = test_db
        .conversation(&f.student, ConversationType::Question)
        .await;
    post(&test_db, &conversation, &f.other_student, "Same problem").await;
    let reference = post(&test_db, &conversation, &f.staff, "Look at lecture 4").await;

    let recipients = recipient_ids(&test_db, conversation.id, &reference).await;
    assert_eq!(recipients, vec![f.student.id, f.other_student.id]);
    assert!(!recipients.contains(&bystander.id));

    test_db
        .db
        .courses
        .update_notification_preferences(f.other_student.user.id, only(|p| p.mentions = true))
        .await
        .unwrap();
    let recipients = recipient_ids(&test_db, conversation.id, &reference).await;
    assert_eq!(recipients, vec![f.student.id]);
}

#[tokio::test]
async fn test_announcement_ignores_preferences_for_first_message() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let silent = enroll(
        &test_db,
        &f,
        "silent",
        "4",
        CourseRole::Student,
        NotificationPreferences::default(),
    )
    .await;

    let mut req = create_request(ConversationType::Note);
    req.is_announcement = true;
    req.title = "Midterm logistics".to_string();
    let conversation = test_db.conversation_with(&f.staff, req, Utc::now()).await;
    assert!(conversation.is_announcement());

    let first = recipient_ids(&test_db, conversation.id, "1").await;
    assert_eq!(first, vec![f.student.id, f.other_student.id, silent.id]);

    let reply = post(&test_db, &conversation, &f.student, "Thanks!").await;
    let recipients = recipient_ids(&test_db, conversation.id, &reply).await;
    assert!(!recipients.contains(&silent.id));
    assert!(recipients.contains(&f.staff.id));
}

#[tokio::test]
async fn test_compose_failure_rolls_back_delivery() {
    let test_db = TestDatabase::new().await;
    let f = test_db.course_fixture().await;
    let conversation = test_db.conversation(&f.student, ConversationType::Note).await;
    let reference = post(&test_db, &conversation, &f.other_student, "@everyone hello").await;

    let message = test_db
        .db
        .messages
        .get_message(conversation.id, &reference)
        .await
        .unwrap()
        .unwrap();
    let mentions = extract_mentions(&message.content_source);
    let result = test_db
        .db
        .notifications
        .deliver(
            &conversation,
            &message,
            &mentions,
            Utc::now(),
            Duration::minutes(20),
            |_| Err(Error::Mail("template missing".to_string())),
        )
        .await;
    assert!(result.is_err());

    // Only the author's row from posting remains.
    let deliveries = test_db.db.notifications.deliveries(message.id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].enrollment_id, f.other_student.id);
    assert_eq!(test_db.db.jobs.count(JobKind::SendEmail).await.unwrap(), 0);
}
