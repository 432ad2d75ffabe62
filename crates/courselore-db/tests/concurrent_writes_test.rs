//! Concurrent writers against a file-backed database with a pooled
//! connection set.
//!
//! The in-memory fixtures run on a single connection, so they serialize every
//! transaction and cannot show lock contention between writers.

use std::collections::HashSet;

use chrono::Utc;
use courselore_core::{
    ConversationType, CourseRole, NotificationPreferences, PostMessageRequest,
};
use courselore_db::test_fixtures::TestDatabase;
use tempfile::TempDir;

const WRITERS: usize = 16;

async fn file_database() -> (TempDir, TestDatabase) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("courselore.db").display());
    let test_db = TestDatabase::open(&url).await;
    (dir, test_db)
}

fn post(content: String) -> PostMessageRequest {
    PostMessageRequest {
        content,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_posts_all_commit_with_distinct_references() {
    let (_dir, test_db) = file_database().await;
    let f = test_db.course_fixture().await;
    let conversation = test_db.conversation(&f.student, ConversationType::Note).await;

    let mut tasks = Vec::with_capacity(WRITERS);
    for i in 0..WRITERS {
        let db = test_db.db.clone();
        let author = if i % 2 == 0 {
            f.student.clone()
        } else {
            f.other_student.clone()
        };
        let conversation_id = conversation.id;
        tasks.push(tokio::spawn(async move {
            db.messages
                .post(conversation_id, &author, &post(format!("Reply {i}")), Utc::now())
                .await
        }));
    }

    let mut references = HashSet::new();
    for task in tasks {
        let posted = task
            .await
            .expect("writer task panicked")
            .expect("concurrent post should commit");
        assert!(!posted.appended);
        assert!(references.insert(posted.reference));
    }

    let expected: HashSet<String> = (2..=WRITERS as i64 + 1).map(|r| r.to_string()).collect();
    assert_eq!(references, expected);

    let reloaded = test_db
        .db
        .courses
        .get_conversation_by_id(conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.next_message_reference, WRITERS as i64 + 2);
    assert_eq!(
        test_db.db.messages.list_messages(conversation.id).await.unwrap().len(),
        WRITERS + 1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mixed_writes_all_commit() {
    let (_dir, test_db) = file_database().await;
    let f = test_db.course_fixture().await;
    let conversation = test_db.conversation(&f.student, ConversationType::Note).await;
    let conversation_id = conversation.id;

    let mut students = Vec::with_capacity(WRITERS);
    for i in 0..WRITERS {
        let student = test_db
            .enroll(
                &f.course,
                &format!("student{i}"),
                &format!("{}", 100 + i),
                CourseRole::Student,
                NotificationPreferences::recommended(),
            )
            .await;
        students.push(student);
    }

    let mut tasks = Vec::with_capacity(WRITERS);
    for (i, student) in students.into_iter().enumerate() {
        let db = test_db.db.clone();
        tasks.push(tokio::spawn(async move {
            let now = Utc::now();
            match i % 3 {
                0 => db
                    .messages
                    .post(conversation_id, &student, &post(format!("Reply {i}")), now)
                    .await
                    .map(|_| ()),
                1 => db
                    .messages
                    .mark_read(conversation_id, "1", &student, now)
                    .await
                    .map(|_| ()),
                _ => db.messages.like(conversation_id, "1", &student, now).await,
            }
        }));
    }

    for task in tasks {
        task.await
            .expect("writer task panicked")
            .expect("concurrent write should commit");
    }

    let count = |r: usize| (0..WRITERS).filter(|i| i % 3 == r).count();
    let messages = test_db.db.messages.list_messages(conversation_id).await.unwrap();
    assert_eq!(messages.len(), count(0) + 1);

    let first = &messages[0];
    assert_eq!(first.reference, "1");
    assert_eq!(
        test_db.db.messages.likes(first.id).await.unwrap().len(),
        count(2)
    );
}
