//! The mail broker: durable queue with typed protocol messages,
//! broadcast fan-out, auto-nudge markers, and debounced checks.

use std::collections::HashMap;
use std::fs;

use uuid::Uuid;

use super::nudge::{self, PendingNudge};
use crate::errors::{Error, Result};
use crate::paths::{self, OverstoryHome};
use crate::store::{
    Capability, EventType, MailFilter, MailMessage, MailPriority, MailStore, MailType, NewEvent,
    PurgeFilter, SessionStore,
};

/// Group addresses resolved against live sessions at send time.
const GROUPS: [(&str, Option<Capability>); 6] = [
    ("@all", None),
    ("@builders", Some(Capability::Builder)),
    ("@scouts", Some(Capability::Scout)),
    ("@reviewers", Some(Capability::Reviewer)),
    ("@leads", Some(Capability::Lead)),
    ("@mergers", Some(Capability::Merger)),
];

/// A send request before addressing.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub mail_type: MailType,
    pub priority: MailPriority,
    pub payload: Option<String>,
}

impl SendRequest {
    /// Whether delivery should drop a pending-nudge marker for the
    /// recipient.
    fn triggers_nudge(&self) -> bool {
        self.priority >= MailPriority::High
            || matches!(
                self.mail_type,
                MailType::WorkerDone
                    | MailType::MergeReady
                    | MailType::Error
                    | MailType::Escalation
                    | MailType::MergeFailed
            )
    }

    /// Marker reason: the type name for protocol messages, otherwise the
    /// priority.
    fn nudge_reason(&self) -> String {
        if self.mail_type.is_protocol() {
            self.mail_type.to_string()
        } else {
            format!("{} priority", self.priority)
        }
    }
}

pub struct MailBroker {
    home: OverstoryHome,
    store: MailStore,
}

impl MailBroker {
    pub fn open(home: &OverstoryHome) -> Result<Self> {
        let store = MailStore::open(&home.mail_db())?;
        Ok(Self {
            home: home.clone(),
            store,
        })
    }

    pub fn close(self) {
        self.store.close();
    }

    /// Send a message. Group addresses fan out to one row per live
    /// recipient, excluding the sender; each recipient gets its own
    /// nudge marker. Returns the inserted rows.
    pub fn send(&self, request: &SendRequest) -> Result<Vec<MailMessage>> {
        let recipients = self.resolve_recipients(&request.from, &request.to)?;

        let mut sent = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let id = Uuid::new_v4().to_string();
            let message = self.store.insert(
                &id,
                &request.from,
                recipient,
                &request.subject,
                &request.body,
                request.mail_type,
                request.priority,
                request.payload.as_deref(),
            )?;

            if request.triggers_nudge() {
                let nudge = PendingNudge::new(
                    &request.from,
                    &request.nudge_reason(),
                    &request.subject,
                    Some(&id),
                );
                nudge::write_marker(&self.home, recipient, &nudge)?;
            }
            sent.push(message);
        }

        if request.mail_type == MailType::MergeReady {
            self.warn_if_unreviewed(&request.from);
        }
        self.record_send_event(request, sent.len());

        Ok(sent)
    }

    fn resolve_recipients(&self, from: &str, to: &str) -> Result<Vec<String>> {
        if !to.starts_with('@') {
            if to.is_empty() {
                return Err(Error::Mail("recipient must be non-empty".to_string()));
            }
            return Ok(vec![to.to_string()]);
        }

        let builtin = GROUPS.iter().find(|(name, _)| *name == to);

        let recipients: Vec<String> = if let Some((_, capability)) = builtin {
            let sessions = SessionStore::open(&self.home.sessions_db())?;
            let recipients = sessions
                .get_active()?
                .into_iter()
                .filter(|s| capability.is_none_or(|c| s.capability == c))
                .map(|s| s.agent_name)
                .filter(|name| name != from)
                .collect();
            sessions.close();
            recipients
        } else {
            // operator-defined group
            let groups = super::groups::Groups::load(&self.home);
            let name = to.trim_start_matches('@');
            groups
                .members(name)
                .ok_or_else(|| Error::Mail(format!("unknown group address '{to}'")))?
                .iter()
                .filter(|member| member.as_str() != from)
                .cloned()
                .collect()
        };

        if recipients.is_empty() {
            return Err(Error::Mail(format!(
                "group '{to}' resolves to no recipients"
            )));
        }
        Ok(recipients)
    }

    /// merge_ready from a sender whose builder children were never paired
    /// with a reviewer gets an advisory on stderr. Never blocks.
    fn warn_if_unreviewed(&self, sender: &str) {
        let Ok(sessions) = SessionStore::open(&self.home.sessions_db()) else {
            return;
        };
        let Ok(children) = sessions.get_children(sender) else {
            sessions.close();
            return;
        };
        let has_builders = children
            .iter()
            .any(|s| s.capability == Capability::Builder);
        let has_reviewers = children
            .iter()
            .any(|s| s.capability == Capability::Reviewer);
        sessions.close();

        if has_builders && !has_reviewers {
            eprintln!(
                "warning: '{sender}' is sending merge_ready but spawned no reviewer \
                 for its builders; the merged work is unreviewed"
            );
        }
    }

    /// Best-effort `mail_sent` event; the send never fails because the
    /// event store did.
    fn record_send_event(&self, request: &SendRequest, recipients: usize) {
        let run_id = paths::read_pointer(&self.home.current_run_file());
        let Ok(events) = crate::store::EventStore::open(&self.home.events_db()) else {
            return;
        };
        let _ = events.insert(&NewEvent {
            run_id,
            data: Some(serde_json::json!({
                "to": request.to,
                "type": request.mail_type.as_str(),
                "priority": request.priority.as_str(),
                "recipients": recipients,
            })),
            ..NewEvent::new(&request.from, EventType::MailSent)
        });
        events.close();
    }

    /// Unread mail for an agent, marked read on delivery (deliver-once).
    pub fn check(&self, agent: &str) -> Result<Vec<MailMessage>> {
        let messages = self.store.unread_for(agent)?;
        for message in &messages {
            self.store.mark_read(&message.id)?;
        }
        Ok(messages)
    }

    /// Human-readable block suitable for prompt injection. Reads and
    /// clears the pending-nudge marker, prepending its priority banner.
    /// With `debounce_ms`, returns `None` silently when called again too
    /// soon (mail stays unread for the next non-debounced check).
    pub fn check_inject(&self, agent: &str, debounce_ms: Option<u64>) -> Result<Option<String>> {
        if let Some(window) = debounce_ms {
            if !self.debounce_elapsed(agent, window)? {
                return Ok(None);
            }
        }

        let nudge = nudge::take_marker(&self.home, agent)?;
        let messages = self.check(agent)?;

        if nudge.is_none() && messages.is_empty() {
            return Ok(None);
        }

        let mut block = String::new();
        if let Some(nudge) = nudge {
            block.push_str(&nudge.banner());
            block.push('\n');
        }
        if !messages.is_empty() {
            block.push_str(&format!(
                "You have {} new message(s):\n",
                messages.len()
            ));
            for message in &messages {
                block.push_str(&format!(
                    "\n[{}] from {} ({} / {})\nSubject: {}\n{}\n",
                    message.id,
                    message.from,
                    message.mail_type,
                    message.priority,
                    message.subject,
                    message.body
                ));
            }
        }
        Ok(Some(block))
    }

    /// True when the debounce window has elapsed; records the check time.
    fn debounce_elapsed(&self, agent: &str, window_ms: u64) -> Result<bool> {
        let path = self.home.mail_check_state_file();
        let mut state: HashMap<String, i64> = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };

        let now = chrono::Utc::now().timestamp_millis();
        if let Some(last) = state.get(agent) {
            if now - last < window_ms as i64 {
                return Ok(false);
            }
        }
        state.insert(agent.to_string(), now);
        let body = serde_json::to_string(&state)?;
        fs::write(&path, body)
            .map_err(|e| Error::Mail(format!("cannot write {}: {e}", path.display())))?;
        Ok(true)
    }

    pub fn list(&self, filter: &MailFilter) -> Result<Vec<MailMessage>> {
        self.store.get_all(filter)
    }

    pub fn mark_read(&self, id: &str) -> Result<bool> {
        Ok(self.store.mark_read(id)?.already_read)
    }

    /// Reply to a message: subject gains a `Re: ` prefix and from/to swap
    /// relative to the original direction.
    pub fn reply(&self, original_id: &str, body: &str, from: &str) -> Result<MailMessage> {
        let original = self
            .store
            .get(original_id)?
            .ok_or_else(|| Error::Mail(format!("no message with id '{original_id}'")))?;

        let to = if from == original.to {
            original.from.clone()
        } else {
            original.to.clone()
        };
        let subject = if original.subject.starts_with("Re: ") {
            original.subject.clone()
        } else {
            format!("Re: {}", original.subject)
        };

        let request = SendRequest {
            from: from.to_string(),
            to,
            subject,
            body: body.to_string(),
            mail_type: original.mail_type,
            priority: original.priority,
            payload: None,
        };
        let mut sent = self.send(&request)?;
        sent.pop()
            .ok_or_else(|| Error::Mail("reply produced no message".to_string()))
    }

    pub fn purge(&self, filter: &PurgeFilter) -> Result<usize> {
        self.store.purge(filter)
    }
}
