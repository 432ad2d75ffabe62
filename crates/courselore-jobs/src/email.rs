//! Notification email rendering.

use courselore_core::content::escape_html;
use courselore_core::defaults::BASE_URL;
use courselore_core::{Conversation, Course, Enrollment, MailOptions, MaybeEnrollment, Message};

/// Renders the email a recipient receives about a new or edited message.
#[derive(Debug, Clone)]
pub struct EmailRenderer {
    base_url: String,
    host: String,
}

impl Default for EmailRenderer {
    fn default() -> Self {
        Self::new(BASE_URL)
    }
}

impl EmailRenderer {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let host = host_of(&base_url).to_string();
        Self { base_url, host }
    }

    /// Reads `BASE_URL` (default `http://localhost:4000`).
    pub fn from_env() -> Self {
        Self::new(std::env::var("BASE_URL").unwrap_or_else(|_| BASE_URL.to_string()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Link to a message inside its conversation.
    pub fn permalink(
        &self,
        course: &Course,
        conversation: &Conversation,
        message: &Message,
    ) -> String {
        format!(
            "{}/courses/{}/conversations/{}?messages={}",
            self.base_url, course.reference, conversation.reference, message.reference
        )
    }

    pub fn preferences_link(&self) -> String {
        format!("{}/settings/notifications", self.base_url)
    }

    /// Stable identity of a conversation's email thread.
    pub fn thread_id(&self, course: &Course, conversation: &Conversation) -> String {
        format!(
            "<courses/{}/conversations/{}@{}>",
            course.reference, conversation.reference, self.host
        )
    }

    pub fn subject(&self, course: &Course, conversation: &Conversation) -> String {
        let prefix = if conversation.is_announcement() {
            "Announcement: "
        } else {
            ""
        };
        format!("[{}] {}{}", course.name, prefix, conversation.title)
    }

    pub fn render(
        &self,
        course: &Course,
        conversation: &Conversation,
        message: &Message,
        recipient: &Enrollment,
    ) -> MailOptions {
        let permalink = self.permalink(course, conversation, message);
        let html = format!(
            "<p><strong>{author}</strong> in <a href=\"{permalink}\">{title}</a></p>\n\
             {content}\n\
             <hr>\n\
             <p><small><a href=\"{permalink}\">Open the conversation</a> \
             &middot; <a href=\"{preferences}\">Change notification preferences</a></small></p>",
            author = escape_html(&author_line(message)),
            permalink = escape_html(&permalink),
            title = escape_html(&conversation.title),
            content = message.content_preprocessed,
            preferences = escape_html(&self.preferences_link()),
        );
        let thread = self.thread_id(course, conversation);

        MailOptions {
            to: recipient.user.email.clone(),
            subject: self.subject(course, conversation),
            html,
            in_reply_to: Some(thread.clone()),
            references: Some(thread),
        }
    }
}

fn author_line(message: &Message) -> String {
    if message.is_anonymous() {
        return "Anonymous".to_string();
    }
    match &message.author {
        MaybeEnrollment::Enrolled(enrollment) => enrollment.user.name.clone(),
        MaybeEnrollment::NoLongerEnrolled => "Someone who is no longer enrolled".to_string(),
    }
}

fn host_of(base_url: &str) -> &str {
    let without_scheme = base_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(base_url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority.split(':').next().unwrap_or(authority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courselore_core::{
        ConversationParticipants, ConversationType, CourseRole, NotificationPreferences, User,
    };

    fn course() -> Course {
        Course {
            id: 1,
            reference: "1001".to_string(),
            name: "Compilers".to_string(),
            next_conversation_reference: 5,
        }
    }

    fn enrollment(name: &str, role: CourseRole) -> Enrollment {
        Enrollment {
            id: 7,
            user: User {
                id: 7,
                email: format!("{}@example.edu", name.to_lowercase()),
                email_verified_at: Some(Utc::now()),
                name: name.to_string(),
                preferences: NotificationPreferences::recommended(),
            },
            course_id: 1,
            reference: "7".to_string(),
            course_role: role,
        }
    }

    fn conversation() -> Conversation {
        Conversation {
            id: 3,
            course_id: 1,
            reference: "4".to_string(),
            author: MaybeEnrollment::Enrolled(enrollment("Ada", CourseRole::Student)),
            anonymous_at: None,
            conversation_type: ConversationType::Question,
            participants: ConversationParticipants::Everyone,
            selected_participants: vec![],
            title: "Parsing <expr>".to_string(),
            announcement_at: None,
            resolved_at: None,
            next_message_reference: 3,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn message(author: MaybeEnrollment) -> Message {
        Message {
            id: 11,
            created_at: Utc::now(),
            updated_at: None,
            conversation_id: 3,
            reference: "2".to_string(),
            author,
            anonymous_at: None,
            answer_at: None,
            content_source: "Use a Pratt parser".to_string(),
            content_preprocessed: "<p>Use a Pratt parser</p>".to_string(),
            content_search: "Use a Pratt parser".to_string(),
        }
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://courselore.org"), "courselore.org");
        assert_eq!(host_of("http://localhost:4000"), "localhost");
        assert_eq!(host_of("https://example.edu/courselore"), "example.edu");
        assert_eq!(host_of("example.edu"), "example.edu");
    }

    #[test]
    fn test_render_links_and_threading() {
        let renderer = EmailRenderer::new("https://courselore.org/");
        let recipient = enrollment("Grace", CourseRole::Staff);
        let msg = message(MaybeEnrollment::Enrolled(enrollment("Ada", CourseRole::Student)));

        let mail = renderer.render(&course(), &conversation(), &msg, &recipient);

        assert_eq!(mail.to, "grace@example.edu");
        assert_eq!(mail.subject, "[Compilers] Parsing <expr>");
        assert!(mail
            .html
            .contains("https://courselore.org/courses/1001/conversations/4?messages=2"));
        assert!(mail
            .html
            .contains("https://courselore.org/settings/notifications"));
        assert!(mail.html.contains("<p>Use a Pratt parser</p>"));
        assert!(mail.html.contains("Parsing &lt;expr&gt;"));
        assert!(mail.html.contains("<strong>Ada</strong>"));
        assert_eq!(
            mail.in_reply_to.as_deref(),
            Some("<courses/1001/conversations/4@courselore.org>")
        );
        assert_eq!(mail.references, mail.in_reply_to);
    }

    #[test]
    fn test_announcement_subject_prefix() {
        let renderer = EmailRenderer::default();
        let mut announcement = conversation();
        announcement.announcement_at = Some(Utc::now());
        assert_eq!(
            renderer.subject(&course(), &announcement),
            "[Compilers] Announcement: Parsing <expr>"
        );
    }

    #[test]
    fn test_author_line_hides_anonymous_and_tombstoned_authors() {
        let ada = enrollment("Ada", CourseRole::Student);
        let mut anonymous = message(MaybeEnrollment::Enrolled(ada));
        anonymous.anonymous_at = Some(Utc::now());
        assert_eq!(author_line(&anonymous), "Anonymous");

        let gone = message(MaybeEnrollment::NoLongerEnrolled);
        assert_eq!(author_line(&gone), "Someone who is no longer enrolled");
    }
}
