//! Assignment events from the forge.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::Origin;

/// Environment variable naming one more account the engine answers to.
pub const USERNAME_ENV: &str = "XBOT_USERNAME";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryPayload {
    pub full_name: String,
}

/// The subset of an `issues` webhook payload the engine reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEvent {
    /// Webhook action, e.g. `assigned`. Absent in hand-written events.
    #[serde(default)]
    pub action: Option<String>,
    pub issue: IssuePayload,
    #[serde(default)]
    pub assignee: Option<Account>,
    pub repository: RepositoryPayload,
}

impl AssignmentEvent {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid event payload: {}", e)))
    }

    /// Reads an event from a JSON file.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// True if this is an assignment to one of `usernames` (case-insensitive).
    pub fn is_directed_at(&self, usernames: &[String]) -> bool {
        if let Some(action) = &self.action {
            if action != "assigned" {
                return false;
            }
        }
        match &self.assignee {
            Some(assignee) => usernames
                .iter()
                .any(|u| !u.is_empty() && u.eq_ignore_ascii_case(&assignee.login)),
            None => false,
        }
    }

    /// The origin reference for a task created from this event.
    pub fn origin(&self) -> Origin {
        let origin = Origin::new(self.repository.full_name.clone(), self.issue.number)
            .with_title(self.issue.title.clone());
        match &self.issue.body {
            Some(body) => origin.with_body(body.clone()),
            None => origin,
        }
    }
}

/// Configured usernames plus the one named by [`USERNAME_ENV`], if set.
pub fn engine_usernames(configured: &[String]) -> Vec<String> {
    let mut names = configured.to_vec();
    if let Ok(name) = std::env::var(USERNAME_ENV) {
        let name = name.trim();
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "action": "assigned",
        "issue": { "number": 42, "title": "Fix login", "body": "It breaks", "state": "open" },
        "assignee": { "login": "XCloud-Bot", "id": 1 },
        "repository": { "full_name": "owner/repo", "private": false }
    }"#;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_webhook_payload_ignoring_extra_fields() {
        let event = AssignmentEvent::from_json(PAYLOAD).unwrap();
        let origin = event.origin();

        assert_eq!(origin.repository, "owner/repo");
        assert_eq!(origin.issue, 42);
        assert_eq!(origin.title, "Fix login");
        assert_eq!(origin.body.as_deref(), Some("It breaks"));
        assert!(origin.validate().is_ok());
    }

    #[test]
    fn assignee_match_is_case_insensitive() {
        let event = AssignmentEvent::from_json(PAYLOAD).unwrap();
        assert!(event.is_directed_at(&names(&["xbot", "xcloud-bot"])));
        assert!(!event.is_directed_at(&names(&["someone-else"])));
        assert!(!event.is_directed_at(&[]));
    }

    #[test]
    fn other_actions_are_not_assignments() {
        let mut event = AssignmentEvent::from_json(PAYLOAD).unwrap();
        event.action = Some("unassigned".to_string());
        assert!(!event.is_directed_at(&names(&["xcloud-bot"])));

        event.action = None;
        assert!(event.is_directed_at(&names(&["xcloud-bot"])));
    }

    #[test]
    fn missing_assignee_is_not_directed() {
        let event = AssignmentEvent::from_json(
            r#"{"issue":{"number":1},"repository":{"full_name":"r"}}"#,
        )
        .unwrap();
        assert!(!event.is_directed_at(&names(&["xbot"])));
        assert_eq!(event.origin().title, "");
    }

    #[test]
    fn malformed_payload_is_a_config_error() {
        assert!(matches!(
            AssignmentEvent::from_json("{\"issue\": 3}"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn reads_event_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, PAYLOAD).unwrap();

        assert_eq!(AssignmentEvent::read(&path).unwrap().issue.number, 42);
    }
}
