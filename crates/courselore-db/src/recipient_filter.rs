//! Notification recipient query builder.
//!
//! The eligibility query is assembled from independent predicate clauses,
//! each returning a SQL fragment plus the parameters it binds, in order:
//!
//! - participation scope: who can see the conversation at all
//! - mentions: who the message content addresses
//! - preferences: which of those the user asked to be emailed about
//!
//! Fragments refer to the enrollment as `e` and its user as `u`.

use std::collections::BTreeSet;

use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;

use courselore_core::{Conversation, ConversationParticipants, Mention, Message};

use crate::rows::ENROLLMENT_COLUMNS;

/// Type-safe parameter binding for SQL queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    /// Integer parameter (ids).
    Int(i64),
    /// String parameter (references).
    String(String),
}

/// Bind `params` to `query` in order.
pub fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: Vec<QueryParam>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            QueryParam::Int(value) => query.bind(value),
            QueryParam::String(value) => query.bind(value),
        };
    }
    query
}

const ALWAYS: &str = "1 = 1";

const SELECTED_PARTICIPANT: &str = "e.id IN (SELECT sp.enrollment_id \
    FROM conversation_selected_participants sp WHERE sp.conversation_id = ?)";

/// Builds the recipient query for one message.
pub struct RecipientQueryBuilder<'a> {
    conversation: &'a Conversation,
    message: &'a Message,
    mentions: &'a BTreeSet<Mention>,
}

impl<'a> RecipientQueryBuilder<'a> {
    pub fn new(
        conversation: &'a Conversation,
        message: &'a Message,
        mentions: &'a BTreeSet<Mention>,
    ) -> Self {
        Self {
            conversation,
            message,
            mentions,
        }
    }

    /// Enrollments inside the conversation's participation scope.
    pub fn participation_clause(&self) -> (String, Vec<QueryParam>) {
        participation_clause(self.conversation)
    }

    /// Enrollments addressed by the message's mentions, or `None` when the
    /// message mentions nobody.
    pub fn mention_clause(&self) -> Option<(String, Vec<QueryParam>)> {
        if self.mentions.is_empty() {
            return None;
        }

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut references = Vec::new();
        for mention in self.mentions {
            match mention {
                Mention::Everyone => clauses.push(ALWAYS.to_string()),
                Mention::Staff => clauses.push("e.course_role = 'staff'".to_string()),
                Mention::Students => clauses.push("e.course_role = 'student'".to_string()),
                Mention::Enrollment(reference) => references.push(reference.clone()),
            }
        }
        if !references.is_empty() {
            let placeholders = vec!["?"; references.len()].join(", ");
            clauses.push(format!("e.reference IN ({placeholders})"));
            params.extend(references.into_iter().map(QueryParam::String));
        }

        Some((format!("({})", clauses.join(" OR ")), params))
    }

    /// Enrollments whose notification preferences select this message.
    ///
    /// The first message of an announcement goes to everyone in scope
    /// regardless of preferences.
    pub fn preference_clause(&self) -> (String, Vec<QueryParam>) {
        if self.conversation.is_announcement() && self.message.is_first() {
            return (ALWAYS.to_string(), vec![]);
        }

        let mut clauses = vec!["u.email_notifications_for_all_messages = 1".to_string()];
        let mut params = Vec::new();

        if let Some((mention_sql, mention_params)) = self.mention_clause() {
            clauses.push(format!(
                "(u.email_notifications_for_mentions = 1 AND {mention_sql})"
            ));
            params.extend(mention_params);
        }

        clauses.push(
            "(u.email_notifications_for_participated_conversations = 1 AND EXISTS (\
             SELECT 1 FROM messages pm \
             WHERE pm.conversation_id = ? AND pm.author_enrollment_id = e.id AND pm.id != ?))"
                .to_string(),
        );
        params.push(QueryParam::Int(self.conversation.id));
        params.push(QueryParam::Int(self.message.id));

        if let Some(author_id) = self.conversation.author.id() {
            clauses.push(
                "(u.email_notifications_for_started_conversations = 1 AND e.id = ?)".to_string(),
            );
            params.push(QueryParam::Int(author_id));
        }

        (format!("({})", clauses.join(" OR ")), params)
    }

    /// The full recipient query: scope, not yet accounted for, verified
    /// email, and selected by preferences.
    pub fn build(&self) -> (String, Vec<QueryParam>) {
        let (scope_sql, scope_params) = self.participation_clause();
        let (preference_sql, preference_params) = self.preference_clause();

        let sql = format!(
            "SELECT {ENROLLMENT_COLUMNS}
             FROM enrollments e JOIN users u ON u.id = e.user_id
             WHERE e.course_id = ?
               AND {scope_sql}
               AND NOT EXISTS (SELECT 1 FROM notification_deliveries d
                               WHERE d.message_id = ? AND d.enrollment_id = e.id)
               AND u.email_verified_at IS NOT NULL
               AND {preference_sql}
             ORDER BY e.id"
        );

        let mut params = vec![QueryParam::Int(self.conversation.course_id)];
        params.extend(scope_params);
        params.push(QueryParam::Int(self.message.id));
        params.extend(preference_params);
        (sql, params)
    }
}

/// Participation-scope predicate for a conversation.
pub fn participation_clause(conversation: &Conversation) -> (String, Vec<QueryParam>) {
    match conversation.participants {
        ConversationParticipants::Everyone => (ALWAYS.to_string(), vec![]),
        ConversationParticipants::Staff => (
            format!("(e.course_role = 'staff' OR {SELECTED_PARTICIPANT})"),
            vec![QueryParam::Int(conversation.id)],
        ),
        ConversationParticipants::SelectedPeople => (
            SELECTED_PARTICIPANT.to_string(),
            vec![QueryParam::Int(conversation.id)],
        ),
    }
}

/// Query for every enrollment in a conversation's participation scope.
pub fn candidates_query(conversation: &Conversation) -> (String, Vec<QueryParam>) {
    let (scope_sql, scope_params) = participation_clause(conversation);
    let sql = format!(
        "SELECT {ENROLLMENT_COLUMNS}
         FROM enrollments e JOIN users u ON u.id = e.user_id
         WHERE e.course_id = ? AND {scope_sql}
         ORDER BY e.id"
    );
    let mut params = vec![QueryParam::Int(conversation.course_id)];
    params.extend(scope_params);
    (sql, params)
}
