//! Authorization and validation rules for message mutations.
//!
//! Every function here is pure: the store loads current rows inside its
//! transaction, asks these rules whether the mutation is allowed, and only then
//! writes. Role and ownership failures are reported as [`Error::NotFound`];
//! state preconditions (empty content, illegal toggles) as
//! [`Error::InvalidInput`].

use chrono::{DateTime, Duration, Utc};

use crate::defaults::CHAT_MERGE_WINDOW_SECS;
use crate::error::{Error, Result};
use crate::models::{
    Conversation, ConversationParticipants, ConversationType, CreateConversationRequest,
    EditMessageRequest, Enrollment, Message, PostMessageRequest,
};

/// Whether `enrollment` is within the conversation's participation scope.
pub fn can_access_conversation(conversation: &Conversation, enrollment: &Enrollment) -> bool {
    if conversation.course_id != enrollment.course_id {
        return false;
    }
    let selected = conversation.selected_participants.contains(&enrollment.id);
    match conversation.participants {
        ConversationParticipants::Everyone => true,
        ConversationParticipants::Staff => enrollment.is_staff() || selected,
        ConversationParticipants::SelectedPeople => selected,
    }
}

pub fn ensure_conversation_access(
    conversation: &Conversation,
    enrollment: &Enrollment,
) -> Result<()> {
    if can_access_conversation(conversation, enrollment) {
        Ok(())
    } else {
        Err(Error::not_found(format!(
            "conversation {}",
            conversation.reference
        )))
    }
}

pub fn ensure_staff(enrollment: &Enrollment, what: &str) -> Result<()> {
    if enrollment.is_staff() {
        Ok(())
    } else {
        Err(Error::not_found(what))
    }
}

/// Reject content that is empty after trimming.
pub fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::invalid("content must not be empty"));
    }
    Ok(())
}

/// Preconditions for posting into an existing conversation.
pub fn check_post(
    conversation: &Conversation,
    enrollment: &Enrollment,
    req: &PostMessageRequest,
) -> Result<()> {
    ensure_conversation_access(conversation, enrollment)?;
    validate_content(&req.content)?;
    if req.is_answer && !conversation.is_question() {
        return Err(Error::invalid("only messages in questions can be answers"));
    }
    if req.is_anonymous && enrollment.is_staff() {
        return Err(Error::invalid("staff cannot post anonymously"));
    }
    Ok(())
}

/// Preconditions for opening a conversation.
pub fn check_create_conversation(
    enrollment: &Enrollment,
    req: &CreateConversationRequest,
) -> Result<()> {
    if req.title.trim().is_empty() {
        return Err(Error::invalid("title must not be empty"));
    }
    validate_content(&req.content)?;
    if req.is_anonymous && enrollment.is_staff() {
        return Err(Error::invalid("staff cannot post anonymously"));
    }
    if req.is_announcement {
        if !enrollment.is_staff() {
            return Err(Error::invalid("only staff can make announcements"));
        }
        if req.conversation_type != ConversationType::Note {
            return Err(Error::invalid("only notes can be announcements"));
        }
    }
    if req.participants == ConversationParticipants::SelectedPeople
        && req.selected_participants.is_empty()
    {
        return Err(Error::invalid("select at least one participant"));
    }
    Ok(())
}

/// Final list of explicitly selected enrollments for a new conversation.
///
/// `everyone` conversations carry no list. Otherwise the author is added
/// whenever the participation mode alone would not let them see their own
/// conversation.
pub fn selected_audience(
    participants: ConversationParticipants,
    author: &Enrollment,
    mut selected: Vec<i64>,
) -> Vec<i64> {
    if participants == ConversationParticipants::Everyone {
        return Vec::new();
    }
    let author_in_scope = participants == ConversationParticipants::Staff && author.is_staff();
    if !author_in_scope {
        selected.push(author.id);
    }
    selected.sort_unstable();
    selected.dedup();
    selected
}

/// Whether a chat post should be appended to the previous message instead of
/// inserted as a new one.
pub fn should_append(
    conversation: &Conversation,
    previous: Option<&Message>,
    enrollment: &Enrollment,
    req: &PostMessageRequest,
    now: DateTime<Utc>,
) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    conversation.is_chat()
        && previous.author.is(enrollment)
        && !previous.is_anonymous()
        && !req.is_anonymous
        && now - previous.created_at < Duration::seconds(CHAT_MERGE_WINDOW_SECS)
}

/// How a post changes a question's resolved state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolve,
    Unresolve,
    Unchanged,
}

pub fn resolution_after_post(
    conversation: &Conversation,
    enrollment: &Enrollment,
    req: &PostMessageRequest,
) -> Resolution {
    if !conversation.is_question() {
        return Resolution::Unchanged;
    }
    if enrollment.is_staff() && req.is_answer && conversation.resolved_at.is_none() {
        Resolution::Resolve
    } else if !enrollment.is_staff() && !req.is_answer && conversation.resolved_at.is_some() {
        Resolution::Unresolve
    } else {
        Resolution::Unchanged
    }
}

/// Staff, or the message's own still-enrolled author.
pub fn ensure_can_edit(message: &Message, enrollment: &Enrollment) -> Result<()> {
    if enrollment.is_staff() || message.author.is(enrollment) {
        Ok(())
    } else {
        Err(Error::not_found(format!("message {}", message.reference)))
    }
}

pub fn check_edit(
    conversation: &Conversation,
    message: &Message,
    enrollment: &Enrollment,
    req: &EditMessageRequest,
) -> Result<()> {
    ensure_conversation_access(conversation, enrollment)?;
    ensure_can_edit(message, enrollment)?;

    if req.is_empty() {
        return Err(Error::invalid("nothing to change"));
    }

    if let Some(is_answer) = req.is_answer {
        if message.is_first() || !conversation.is_question() {
            return Err(Error::invalid(
                "only replies in questions can be marked as answers",
            ));
        }
        if is_answer == message.is_answer() {
            return Err(Error::invalid(if is_answer {
                "message is already an answer"
            } else {
                "message is not an answer"
            }));
        }
    }

    if let Some(is_anonymous) = req.is_anonymous {
        if message.author.enrolled().is_none() {
            return Err(Error::invalid("author is no longer enrolled"));
        }
        if message.author.is_staff() {
            return Err(Error::invalid("staff messages cannot be anonymous"));
        }
        if is_anonymous == message.is_anonymous() {
            return Err(Error::invalid(if is_anonymous {
                "message is already anonymous"
            } else {
                "message is not anonymous"
            }));
        }
    }

    if let Some(content) = &req.content {
        validate_content(content)?;
    }

    Ok(())
}

/// Whether toggling anonymity on `message` must also toggle the conversation.
///
/// Only the first message carries the conversation's authorship, and only
/// while the conversation's recorded author is still the message's author.
pub fn propagates_anonymity(conversation: &Conversation, message: &Message) -> bool {
    message.is_first()
        && match (conversation.author.id(), message.author.id()) {
            (Some(conversation_author), Some(message_author)) => {
                conversation_author == message_author
            }
            _ => false,
        }
}

pub fn check_like(holds: bool, adding: bool) -> Result<()> {
    match (holds, adding) {
        (true, true) => Err(Error::invalid("message is already liked")),
        (false, false) => Err(Error::invalid("message is not liked")),
        _ => Ok(()),
    }
}

pub fn check_endorsement(
    conversation: &Conversation,
    message: &Message,
    enrollment: &Enrollment,
    holds: bool,
    adding: bool,
) -> Result<()> {
    ensure_staff(enrollment, &format!("message {}", message.reference))?;
    if !conversation.is_question() {
        return Err(Error::invalid("only answers in questions can be endorsed"));
    }
    if message.is_first() {
        return Err(Error::invalid("the question itself cannot be endorsed"));
    }
    if !message.is_answer() {
        return Err(Error::invalid("only answers can be endorsed"));
    }
    if message.author.is_staff() {
        return Err(Error::invalid("staff answers cannot be endorsed"));
    }
    match (holds, adding) {
        (true, true) => Err(Error::invalid("message is already endorsed")),
        (false, false) => Err(Error::invalid("message is not endorsed")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CourseRole, MaybeEnrollment, NotificationPreferences, User};

    fn enrollment(id: i64, role: CourseRole) -> Enrollment {
        Enrollment {
            id,
            user: User {
                id,
                email: format!("user{id}@example.edu"),
                email_verified_at: Some(Utc::now()),
                name: format!("User {id}"),
                preferences: NotificationPreferences::recommended(),
            },
            course_id: 1,
            reference: format!("{id}"),
            course_role: role,
        }
    }

    fn conversation(kind: ConversationType, author: &Enrollment) -> Conversation {
        Conversation {
            id: 10,
            course_id: 1,
            reference: "3".to_string(),
            author: MaybeEnrollment::Enrolled(author.clone()),
            anonymous_at: None,
            conversation_type: kind,
            participants: ConversationParticipants::Everyone,
            selected_participants: vec![],
            title: "Homework 2".to_string(),
            announcement_at: None,
            resolved_at: None,
            next_message_reference: 3,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn message(reference: &str, author: &Enrollment, created_at: DateTime<Utc>) -> Message {
        Message {
            id: reference.parse().unwrap(),
            created_at,
            updated_at: None,
            conversation_id: 10,
            reference: reference.to_string(),
            author: MaybeEnrollment::Enrolled(author.clone()),
            anonymous_at: None,
            answer_at: None,
            content_source: "hello".to_string(),
            content_preprocessed: "<p>hello</p>".to_string(),
            content_search: "hello".to_string(),
        }
    }

    fn post(content: &str) -> PostMessageRequest {
        PostMessageRequest {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_access_by_participation_scope() {
        let staff = enrollment(1, CourseRole::Staff);
        let student = enrollment(2, CourseRole::Student);
        let selected = enrollment(3, CourseRole::Student);
        let mut c = conversation(ConversationType::Note, &staff);
        c.selected_participants = vec![3];

        c.participants = ConversationParticipants::Everyone;
        assert!(can_access_conversation(&c, &student));

        c.participants = ConversationParticipants::Staff;
        assert!(can_access_conversation(&c, &staff));
        assert!(!can_access_conversation(&c, &student));
        assert!(can_access_conversation(&c, &selected));

        c.participants = ConversationParticipants::SelectedPeople;
        assert!(!can_access_conversation(&c, &staff));
        assert!(can_access_conversation(&c, &selected));
    }

    #[test]
    fn test_access_other_course_is_not_found() {
        let staff = enrollment(1, CourseRole::Staff);
        let mut outsider = enrollment(2, CourseRole::Staff);
        outsider.course_id = 99;
        let c = conversation(ConversationType::Note, &staff);
        let err = ensure_conversation_access(&c, &outsider).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_check_post_rejects_blank_content() {
        let student = enrollment(2, CourseRole::Student);
        let c = conversation(ConversationType::Question, &student);
        assert!(check_post(&c, &student, &post("  \n\t")).unwrap_err().is_validation());
    }

    #[test]
    fn test_check_post_answer_only_in_questions() {
        let student = enrollment(2, CourseRole::Student);
        let c = conversation(ConversationType::Note, &student);
        let mut req = post("answer");
        req.is_answer = true;
        assert!(check_post(&c, &student, &req).unwrap_err().is_validation());
    }

    #[test]
    fn test_check_post_staff_cannot_be_anonymous() {
        let staff = enrollment(1, CourseRole::Staff);
        let c = conversation(ConversationType::Note, &staff);
        let mut req = post("hi");
        req.is_anonymous = true;
        assert!(check_post(&c, &staff, &req).unwrap_err().is_validation());
    }

    #[test]
    fn test_should_append_inside_window() {
        let student = enrollment(2, CourseRole::Student);
        let c = conversation(ConversationType::Chat, &student);
        let t0 = Utc::now();
        let previous = message("2", &student, t0);

        let inside = t0 + Duration::seconds(4 * 60 + 59);
        assert!(should_append(&c, Some(&previous), &student, &post("more"), inside));

        let outside = t0 + Duration::seconds(5 * 60 + 1);
        assert!(!should_append(&c, Some(&previous), &student, &post("more"), outside));
    }

    #[test]
    fn test_should_append_requires_chat_same_author_and_no_anonymity() {
        let student = enrollment(2, CourseRole::Student);
        let other = enrollment(3, CourseRole::Student);
        let t0 = Utc::now();
        let now = t0 + Duration::seconds(10);
        let previous = message("2", &student, t0);

        let question = conversation(ConversationType::Question, &student);
        assert!(!should_append(&question, Some(&previous), &student, &post("x"), now));

        let chat = conversation(ConversationType::Chat, &student);
        assert!(!should_append(&chat, Some(&previous), &other, &post("x"), now));
        assert!(!should_append(&chat, None, &student, &post("x"), now));

        let mut anonymous_req = post("x");
        anonymous_req.is_anonymous = true;
        assert!(!should_append(&chat, Some(&previous), &student, &anonymous_req, now));

        let mut anonymous_previous = previous.clone();
        anonymous_previous.anonymous_at = Some(t0);
        assert!(!should_append(&chat, Some(&anonymous_previous), &student, &post("x"), now));
    }

    #[test]
    fn test_resolution_after_post() {
        let staff = enrollment(1, CourseRole::Staff);
        let student = enrollment(2, CourseRole::Student);
        let mut c = conversation(ConversationType::Question, &student);

        let mut answer = post("answer");
        answer.is_answer = true;
        assert_eq!(resolution_after_post(&c, &staff, &answer), Resolution::Resolve);
        assert_eq!(resolution_after_post(&c, &student, &post("?")), Resolution::Unchanged);

        c.resolved_at = Some(Utc::now());
        assert_eq!(resolution_after_post(&c, &staff, &answer), Resolution::Unchanged);
        assert_eq!(resolution_after_post(&c, &student, &post("?")), Resolution::Unresolve);
        assert_eq!(resolution_after_post(&c, &student, &answer), Resolution::Unchanged);
    }

    #[test]
    fn test_edit_authorization() {
        let staff = enrollment(1, CourseRole::Staff);
        let author = enrollment(2, CourseRole::Student);
        let stranger = enrollment(3, CourseRole::Student);
        let m = message("2", &author, Utc::now());

        assert!(ensure_can_edit(&m, &staff).is_ok());
        assert!(ensure_can_edit(&m, &author).is_ok());
        assert!(ensure_can_edit(&m, &stranger).unwrap_err().is_not_found());

        let mut orphan = m.clone();
        orphan.author = MaybeEnrollment::NoLongerEnrolled;
        assert!(ensure_can_edit(&orphan, &author).unwrap_err().is_not_found());
    }

    #[test]
    fn test_edit_answer_toggle_rules() {
        let student = enrollment(2, CourseRole::Student);
        let c = conversation(ConversationType::Question, &student);
        let first = message("1", &student, Utc::now());
        let reply = message("2", &student, Utc::now());
        let set = |v| EditMessageRequest {
            is_answer: Some(v),
            ..Default::default()
        };

        assert!(check_edit(&c, &first, &student, &set(true)).unwrap_err().is_validation());
        assert!(check_edit(&c, &reply, &student, &set(true)).is_ok());
        assert!(check_edit(&c, &reply, &student, &set(false)).unwrap_err().is_validation());

        let mut answered = reply.clone();
        answered.answer_at = Some(Utc::now());
        assert!(check_edit(&c, &answered, &student, &set(true)).unwrap_err().is_validation());
        assert!(check_edit(&c, &answered, &student, &set(false)).is_ok());

        let chat = conversation(ConversationType::Chat, &student);
        assert!(check_edit(&chat, &reply, &student, &set(true)).unwrap_err().is_validation());
    }

    #[test]
    fn test_edit_anonymity_rules() {
        let staff = enrollment(1, CourseRole::Staff);
        let student = enrollment(2, CourseRole::Student);
        let c = conversation(ConversationType::Note, &student);
        let set = |v| EditMessageRequest {
            is_anonymous: Some(v),
            ..Default::default()
        };

        let m = message("2", &student, Utc::now());
        assert!(check_edit(&c, &m, &student, &set(true)).is_ok());
        assert!(check_edit(&c, &m, &student, &set(false)).unwrap_err().is_validation());

        let staff_message = message("2", &staff, Utc::now());
        assert!(check_edit(&c, &staff_message, &staff, &set(true))
            .unwrap_err()
            .is_validation());

        let mut orphan = m.clone();
        orphan.author = MaybeEnrollment::NoLongerEnrolled;
        assert!(check_edit(&c, &orphan, &staff, &set(true)).unwrap_err().is_validation());
    }

    #[test]
    fn test_edit_rejects_blank_content_and_empty_patch() {
        let student = enrollment(2, CourseRole::Student);
        let c = conversation(ConversationType::Note, &student);
        let m = message("2", &student, Utc::now());
        let blank = EditMessageRequest {
            content: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(check_edit(&c, &m, &student, &blank).unwrap_err().is_validation());
        assert!(check_edit(&c, &m, &student, &EditMessageRequest::default())
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_propagates_anonymity_only_for_matching_first_message() {
        let student = enrollment(2, CourseRole::Student);
        let other = enrollment(3, CourseRole::Student);
        let c = conversation(ConversationType::Note, &student);

        assert!(propagates_anonymity(&c, &message("1", &student, Utc::now())));
        assert!(!propagates_anonymity(&c, &message("2", &student, Utc::now())));
        assert!(!propagates_anonymity(&c, &message("1", &other, Utc::now())));

        let mut drifted = c.clone();
        drifted.author = MaybeEnrollment::NoLongerEnrolled;
        assert!(!propagates_anonymity(&drifted, &message("1", &student, Utc::now())));
    }

    #[test]
    fn test_check_like() {
        assert!(check_like(false, true).is_ok());
        assert!(check_like(true, false).is_ok());
        assert!(check_like(true, true).unwrap_err().is_validation());
        assert!(check_like(false, false).unwrap_err().is_validation());
    }

    #[test]
    fn test_check_endorsement() {
        let staff = enrollment(1, CourseRole::Staff);
        let student = enrollment(2, CourseRole::Student);
        let c = conversation(ConversationType::Question, &student);
        let mut answer = message("2", &student, Utc::now());
        answer.answer_at = Some(Utc::now());

        assert!(check_endorsement(&c, &answer, &staff, false, true).is_ok());
        assert!(check_endorsement(&c, &answer, &staff, true, true)
            .unwrap_err()
            .is_validation());
        assert!(check_endorsement(&c, &answer, &student, false, true)
            .unwrap_err()
            .is_not_found());

        let mut first = answer.clone();
        first.reference = "1".to_string();
        assert!(check_endorsement(&c, &first, &staff, false, true)
            .unwrap_err()
            .is_validation());

        let not_answer = message("3", &student, Utc::now());
        assert!(check_endorsement(&c, &not_answer, &staff, false, true)
            .unwrap_err()
            .is_validation());

        let mut staff_answer = message("4", &staff, Utc::now());
        staff_answer.answer_at = Some(Utc::now());
        assert!(check_endorsement(&c, &staff_answer, &staff, false, true)
            .unwrap_err()
            .is_validation());

        let note = conversation(ConversationType::Note, &student);
        assert!(check_endorsement(&note, &answer, &staff, false, true)
            .unwrap_err()
            .is_validation());
    }

    fn create_request(kind: ConversationType) -> CreateConversationRequest {
        CreateConversationRequest {
            conversation_type: kind,
            participants: ConversationParticipants::Everyone,
            selected_participants: vec![],
            title: "Office hours".to_string(),
            content: "When are they?".to_string(),
            is_anonymous: false,
            is_announcement: false,
        }
    }

    #[test]
    fn test_check_create_conversation() {
        let staff = enrollment(1, CourseRole::Staff);
        let student = enrollment(2, CourseRole::Student);

        let question = create_request(ConversationType::Question);
        assert!(check_create_conversation(&student, &question).is_ok());

        let mut blank = create_request(ConversationType::Question);
        blank.title = "  ".to_string();
        assert!(check_create_conversation(&student, &blank).unwrap_err().is_validation());

        let mut announcement = create_request(ConversationType::Note);
        announcement.is_announcement = true;
        assert!(check_create_conversation(&staff, &announcement).is_ok());
        assert!(check_create_conversation(&student, &announcement)
            .unwrap_err()
            .is_validation());

        let mut question_announcement = create_request(ConversationType::Question);
        question_announcement.is_announcement = true;
        assert!(check_create_conversation(&staff, &question_announcement).is_err());

        let mut anonymous = create_request(ConversationType::Question);
        anonymous.is_anonymous = true;
        assert!(check_create_conversation(&student, &anonymous).is_ok());
        assert!(check_create_conversation(&staff, &anonymous).is_err());

        let mut nobody = create_request(ConversationType::Note);
        nobody.participants = ConversationParticipants::SelectedPeople;
        assert!(check_create_conversation(&student, &nobody).is_err());
    }

    #[test]
    fn test_selected_audience() {
        let staff = enrollment(1, CourseRole::Staff);
        let student = enrollment(2, CourseRole::Student);

        let everyone = selected_audience(ConversationParticipants::Everyone, &student, vec![3]);
        assert!(everyone.is_empty());
        assert_eq!(
            selected_audience(ConversationParticipants::Staff, &staff, vec![3]),
            vec![3]
        );
        assert_eq!(
            selected_audience(ConversationParticipants::Staff, &student, vec![3]),
            vec![2, 3]
        );
        assert_eq!(
            selected_audience(ConversationParticipants::SelectedPeople, &student, vec![3, 2]),
            vec![2, 3]
        );
    }
}
