// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use conduit_model::Message;
use uuid::Uuid;

use crate::error::ConduitError;

/// One message as stored in a `Session`'s DAG: the message payload plus the
/// DAG bookkeeping (`id`, `predecessor_id`, `session_id`, `timestamp`) that
/// `conduit_model::Message` itself does not carry — the wire-level `Message`
/// type is shared with every provider adapter and stays a plain
/// role/content value; this envelope is the only place ancestry lives.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub predecessor_id: Option<Uuid>,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message: Message,
}

/// Source of truth: an append-only DAG of messages sharing one `session_id`.
/// `leaf` is the current tail.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub message_dict: HashMap<Uuid, StoredMessage>,
    pub leaf: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            message_dict: HashMap::new(),
            leaf: None,
            created_at: Utc::now(),
        }
    }

    /// Append `message` after `predecessor`, without moving the session's own
    /// `leaf` pointer. Used by a branched `Conversation` to extend a side
    /// path that is not (yet) the session's main tail.
    pub fn append_after(&mut self, predecessor: Option<Uuid>, message: Message) -> Uuid {
        let id = Uuid::new_v4();
        self.message_dict.insert(
            id,
            StoredMessage {
                id,
                predecessor_id: predecessor,
                session_id: self.id,
                timestamp: Utc::now(),
                message,
            },
        );
        id
    }

    /// Append `message` after the current leaf and advance the leaf to it.
    pub fn append(&mut self, message: Message) -> Uuid {
        let id = self.append_after(self.leaf, message);
        self.leaf = Some(id);
        id
    }

    /// Walk `predecessor_id` from `from` to the root, returning the chain in
    /// chronological (root-first) order. Terminates in at most
    /// `message_dict.len()` steps per the Session ancestry invariant.
    pub fn ancestry(&self, from: Uuid) -> Vec<&StoredMessage> {
        let mut chain = Vec::new();
        let mut cursor = Some(from);
        let mut steps = 0usize;
        while let Some(id) = cursor {
            let Some(m) = self.message_dict.get(&id) else { break };
            chain.push(m);
            cursor = m.predecessor_id;
            steps += 1;
            if steps > self.message_dict.len() {
                break; // defensive: a cycle would otherwise loop forever
            }
        }
        chain.reverse();
        chain
    }

    /// Approximate total token count across every message reachable from the
    /// given leaf (defaults to the session's own leaf).
    pub fn token_count_from(&self, leaf: Option<Uuid>) -> usize {
        match leaf.or(self.leaf) {
            None => 0,
            Some(l) => self
                .ancestry(l)
                .iter()
                .map(|m| m.message.approx_tokens())
                .sum(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived conversation state, used to decide what the tool-call loop or
/// caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Generate,
    Execute,
    Terminate,
    Incomplete,
}

/// Linear, ordered projection of a (possibly partial) ancestor chain from a
/// `Session`. Holds only `session_id` plus cloned messages — no back-pointer
/// to the `Session` itself (§9 design note).
#[derive(Debug, Clone)]
pub struct Conversation {
    pub session_id: Uuid,
    pub messages: Vec<StoredMessage>,
}

impl Conversation {
    /// Project the full ancestor chain from the session's current leaf.
    pub fn from_session(session: &Session) -> Self {
        let messages = match session.leaf {
            Some(leaf) => session.ancestry(leaf).into_iter().cloned().collect(),
            None => Vec::new(),
        };
        Self { session_id: session.id, messages }
    }

    pub fn tip(&self) -> Option<Uuid> {
        self.messages.last().map(|m| m.id)
    }

    fn last_role_tag(&self) -> Option<&'static str> {
        self.messages.last().map(|m| role_tag(&m.message))
    }

    /// Append `message` to both this conversation and the shared `session`,
    /// chaining off this conversation's own tip (not necessarily the
    /// session's current leaf — that is what makes branch-then-append work).
    /// Enforces system-message uniqueness and role-alternation.
    pub fn add(&mut self, session: &mut Session, message: Message) -> Result<Uuid, ConduitError> {
        let incoming_role = role_tag(&message);
        if incoming_role == "system" && self.messages.iter().any(|m| role_tag(&m.message) == "system") {
            return Err(ConduitError::ValidationError(
                "a Conversation may contain at most one SystemMessage".into(),
            ));
        }
        if incoming_role == "system" && !self.messages.is_empty() {
            return Err(ConduitError::ValidationError(
                "SystemMessage must be the first message in a Conversation".into(),
            ));
        }
        if let Some(last_role) = self.last_role_tag() {
            let alternation_ok = last_role != incoming_role || incoming_role == "tool";
            if !alternation_ok {
                return Err(ConduitError::ValidationError(format!(
                    "role alternation violated: {last_role} followed by {incoming_role}"
                )));
            }
        }
        let id = session.append_after(self.tip(), message);
        let stored = session.message_dict.get(&id).expect("just inserted").clone();
        self.messages.push(stored);
        session.leaf = Some(id);
        Ok(id)
    }

    /// Returns a new Conversation whose message list is the ancestor chain up
    /// to and including index `k`, sharing the same session. Appending to
    /// the branch does not touch `self.messages`.
    pub fn branch(&self, k: usize) -> Self {
        Self {
            session_id: self.session_id,
            messages: self.messages[..=k].to_vec(),
        }
    }

    /// Truncate to the last `keep_last` messages. The dropped messages remain
    /// reachable by id in the Session — pruning never mutates the Session.
    pub fn prune(&mut self, keep_last: usize) {
        if self.messages.len() > keep_last {
            let drop_count = self.messages.len() - keep_last;
            self.messages.drain(..drop_count);
        }
    }

    pub fn state(&self) -> ConversationState {
        match self.messages.last() {
            None => ConversationState::Incomplete,
            Some(m) => match &m.message.content {
                conduit_model::MessageContent::ToolCall { .. } => ConversationState::Execute,
                _ => match m.message.role {
                    conduit_model::Role::User | conduit_model::Role::Tool => ConversationState::Generate,
                    conduit_model::Role::Assistant => ConversationState::Terminate,
                    conduit_model::Role::System => ConversationState::Incomplete,
                },
            },
        }
    }
}

fn role_tag(m: &Message) -> &'static str {
    match &m.content {
        conduit_model::MessageContent::ToolCall { .. } => "assistant",
        conduit_model::MessageContent::ToolResult { .. } => "tool",
        _ => match m.role {
            conduit_model::Role::System => "system",
            conduit_model::Role::User => "user",
            conduit_model::Role::Assistant => "assistant",
            conduit_model::Role::Tool => "tool",
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Session ancestry ──────────────────────────────────────────────────────

    #[test]
    fn new_session_has_unique_id_and_empty_dict() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id, b.id);
        assert!(a.message_dict.is_empty());
        assert!(a.leaf.is_none());
    }

    #[test]
    fn append_advances_leaf_and_chains_predecessor() {
        let mut s = Session::new();
        let first = s.append(Message::user("hi"));
        let second = s.append(Message::assistant("hello"));
        assert_eq!(s.leaf, Some(second));
        assert_eq!(s.message_dict[&second].predecessor_id, Some(first));
        assert_eq!(s.message_dict[&first].predecessor_id, None);
    }

    #[test]
    fn ancestry_terminates_at_root_in_bounded_steps() {
        let mut s = Session::new();
        let mut last = None;
        for i in 0..10 {
            last = Some(s.append(Message::user(format!("msg{i}"))));
        }
        let chain = s.ancestry(last.unwrap());
        assert_eq!(chain.len(), 10);
        assert!(chain[0].predecessor_id.is_none());
        assert!(chain.len() <= s.message_dict.len());
    }

    #[test]
    fn token_count_from_sums_ancestry() {
        let mut s = Session::new();
        s.append(Message::user("12345678")); // 2 tokens
        s.append(Message::assistant("abcd")); // 1 token
        assert_eq!(s.token_count_from(None), 3);
    }

    // ── Conversation projection & role alternation ────────────────────────────

    #[test]
    fn conversation_projects_full_ancestry() {
        let mut s = Session::new();
        s.append(Message::system("be helpful"));
        s.append(Message::user("hi"));
        let conv = Conversation::from_session(&s);
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.session_id, s.id);
    }

    #[test]
    fn add_enforces_single_system_message() {
        let mut s = Session::new();
        let mut conv = Conversation { session_id: s.id, messages: Vec::new() };
        conv.add(&mut s, Message::system("sys")).unwrap();
        let err = conv.add(&mut s, Message::system("sys2")).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn add_enforces_role_alternation() {
        let mut s = Session::new();
        let mut conv = Conversation { session_id: s.id, messages: Vec::new() };
        conv.add(&mut s, Message::user("hi")).unwrap();
        let err = conv.add(&mut s, Message::user("again")).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn add_allows_consecutive_tool_messages_after_assistant() {
        let mut s = Session::new();
        let mut conv = Conversation { session_id: s.id, messages: Vec::new() };
        conv.add(&mut s, Message::user("what time is it?")).unwrap();
        conv.add(
            &mut s,
            Message {
                role: conduit_model::Role::Assistant,
                content: conduit_model::MessageContent::ToolCall {
                    tool_call_id: "1".into(),
                    function: conduit_model::FunctionCall {
                        name: "get_time".into(),
                        arguments: "{}".into(),
                    },
                },
            },
        )
        .unwrap();
        conv.add(&mut s, Message::tool_result("1", "12:00")).unwrap();
        assert_eq!(conv.messages.len(), 3);
    }

    // ── Branch isolation (S5) ─────────────────────────────────────────────────

    #[test]
    fn branch_isolation_matches_s5() {
        let mut s = Session::new();
        let mut conv = Conversation { session_id: s.id, messages: Vec::new() };
        conv.add(&mut s, Message::user("m0")).unwrap();
        conv.add(&mut s, Message::assistant("m1")).unwrap();
        conv.add(&mut s, Message::user("m2")).unwrap();
        conv.add(&mut s, Message::assistant("m3")).unwrap();
        conv.add(&mut s, Message::user("m4")).unwrap();
        assert_eq!(conv.messages.len(), 5);

        let mut branch = conv.branch(2);
        assert_eq!(branch.messages.len(), 3);
        branch.add(&mut s, Message::assistant("new turn")).unwrap();

        assert_eq!(conv.messages.len(), 5, "original conversation must be untouched");
        assert_eq!(branch.messages.len(), 4);
        for i in 0..3 {
            assert_eq!(branch.messages[i].id, conv.messages[i].id);
        }
        assert_eq!(branch.session_id, conv.session_id);
    }

    #[test]
    fn prune_keeps_tail_without_touching_session() {
        let mut s = Session::new();
        let mut conv = Conversation { session_id: s.id, messages: Vec::new() };
        for i in 0..5 {
            conv.add(&mut s, Message::user(format!("m{i}"))).ok();
            conv.add(&mut s, Message::assistant(format!("r{i}"))).ok();
        }
        let dict_len_before = s.message_dict.len();
        conv.prune(2);
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(s.message_dict.len(), dict_len_before);
    }

    // ── Conversation state ─────────────────────────────────────────────────────

    #[test]
    fn state_incomplete_when_empty() {
        let conv = Conversation { session_id: Uuid::new_v4(), messages: Vec::new() };
        assert_eq!(conv.state(), ConversationState::Incomplete);
    }

    #[test]
    fn state_generate_after_user_message() {
        let mut s = Session::new();
        let mut conv = Conversation { session_id: s.id, messages: Vec::new() };
        conv.add(&mut s, Message::user("hi")).unwrap();
        assert_eq!(conv.state(), ConversationState::Generate);
    }

    #[test]
    fn state_terminate_after_plain_assistant_message() {
        let mut s = Session::new();
        let mut conv = Conversation { session_id: s.id, messages: Vec::new() };
        conv.add(&mut s, Message::user("hi")).unwrap();
        conv.add(&mut s, Message::assistant("hello")).unwrap();
        assert_eq!(conv.state(), ConversationState::Terminate);
    }

    #[test]
    fn state_execute_after_tool_call_message() {
        let mut s = Session::new();
        let mut conv = Conversation { session_id: s.id, messages: Vec::new() };
        conv.add(&mut s, Message::user("what time is it?")).unwrap();
        conv.add(
            &mut s,
            Message {
                role: conduit_model::Role::Assistant,
                content: conduit_model::MessageContent::ToolCall {
                    tool_call_id: "1".into(),
                    function: conduit_model::FunctionCall { name: "get_time".into(), arguments: "{}".into() },
                },
            },
        )
        .unwrap();
        assert_eq!(conv.state(), ConversationState::Execute);
    }
}
