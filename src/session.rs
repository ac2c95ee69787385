//! Team sessions: the scope every task, worker and message lives in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::orchestration::WorkerId;
use crate::{clog, clog_debug, clog_warn, Error, Result};

const MAX_SESSION_NAME_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Session lifecycle. Moves strictly forward: Active, Draining, Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Active, SessionState::Draining)
                | (SessionState::Draining, SessionState::Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Draining => write!(f, "draining"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSession {
    pub id: SessionId,
    pub name: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    /// Every worker spawned in this session, including closed ones.
    pub workers: BTreeSet<WorkerId>,
    /// Non-fatal problems collected for the run report.
    pub warnings: Vec<String>,
}

impl TeamSession {
    pub fn new(name: &str, metadata: BTreeMap<String, String>) -> Result<Self> {
        validate_session_name(name)?;
        Ok(Self {
            id: SessionId::new(),
            name: name.trim().to_string(),
            metadata,
            created_at: Utc::now(),
            state: SessionState::Active,
            workers: BTreeSet::new(),
            warnings: Vec::new(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidSessionTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        clog!("Session '{}' {} -> {}", self.name, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        clog_warn!("Session '{}': {}", self.name, warning);
        self.warnings.push(warning);
    }
}

/// Named sessions alive in this process.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, TeamSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(
        &mut self,
        name: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<SessionId> {
        let session = TeamSession::new(name, metadata)?;
        if self.sessions.contains_key(&session.name) {
            return Err(Error::SessionExists(session.name));
        }
        let id = session.id;
        clog_debug!("SessionRegistry::create_session '{}' id={}", session.name, id.short());
        self.sessions.insert(session.name.clone(), session);
        Ok(id)
    }

    /// Remove a session. Only sessions that are closed, or active sessions
    /// that never spawned a worker, can be deleted.
    pub fn delete_session(&mut self, name: &str) -> Result<TeamSession> {
        let session = self
            .sessions
            .get(name)
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
        let idle = session.state == SessionState::Active && session.workers.is_empty();
        if session.state != SessionState::Closed && !idle {
            return Err(Error::SessionBusy {
                name: name.to_string(),
                state: session.state.to_string(),
            });
        }
        self.sessions
            .remove(name)
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&TeamSession> {
        self.sessions.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut TeamSession> {
        self.sessions
            .get_mut(name)
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<&TeamSession> {
        let mut sessions: Vec<&TeamSession> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn validate_session_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Validation(
            "Session name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_SESSION_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "Session name too long (max {} characters)",
            MAX_SESSION_NAME_LENGTH
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(
            "Session name cannot contain control characters".to_string(),
        ));
    }

    Ok(())
}
