//! Redaction sessions
//!
//! A session is the reversible mapping between placeholders and original
//! values for one (user, purpose) pair. Sessions live in a
//! [`SessionRegistry`] and are only reachable through it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use regex::Captures;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::audit::{AuditEntry, AuditLogger, SecurityEvent};
use crate::clock::Clock;
use crate::error::{FinguardError, FinguardResult};
use crate::schema::Category;

use super::patterns::PLACEHOLDER_REGEX;
use super::token::{self, DEFAULT_TOKEN_HEX_LEN};

/// Inactivity after which a (user, purpose) pair gets a fresh session
pub const DEFAULT_CONTEXT_WINDOW_MINUTES: i64 = 10;

/// Inactivity after which a session can no longer restore anything
pub const DEFAULT_IDLE_EXPIRY_HOURS: i64 = 24;

/// Identifier of a redaction session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse an ID from a string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Timing and token settings for sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub context_window: Duration,
    pub idle_expiry: Duration,
    /// Hex characters kept from each token hash
    pub token_hex_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_window: Duration::minutes(DEFAULT_CONTEXT_WINDOW_MINUTES),
            idle_expiry: Duration::hours(DEFAULT_IDLE_EXPIRY_HOURS),
            token_hex_len: DEFAULT_TOKEN_HEX_LEN,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> FinguardResult<()> {
        token::validate_hex_len(self.token_hex_len)?;
        if self.context_window <= Duration::zero() {
            return Err(FinguardError::Config(
                "Session context window must be positive".into(),
            ));
        }
        if self.idle_expiry < self.context_window {
            return Err(FinguardError::Config(
                "Session idle expiry must not be shorter than the context window".into(),
            ));
        }
        Ok(())
    }
}

/// One reversible redaction context
///
/// Original values are wiped from memory when the session is dropped.
pub struct AnonymizationSession {
    id: SessionId,
    user_id: String,
    purpose: String,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    token_hex_len: usize,
    /// placeholder -> original
    originals: HashMap<String, String>,
    /// (category, original) -> placeholder
    tokens: HashMap<(Category, String), String>,
    sensitive_paths: BTreeSet<String>,
    /// Placeholders standing in for a number or boolean
    typed: HashSet<String>,
}

impl AnonymizationSession {
    /// Open a session issuing placeholders of `token_hex_len` hex characters
    pub fn new(
        user_id: impl Into<String>,
        purpose: impl Into<String>,
        now: DateTime<Utc>,
        token_hex_len: usize,
    ) -> FinguardResult<Self> {
        token::validate_hex_len(token_hex_len)?;
        Ok(Self {
            id: SessionId::new(),
            user_id: user_id.into(),
            purpose: purpose.into(),
            created_at: now,
            last_used_at: now,
            token_hex_len,
            originals: HashMap::new(),
            tokens: HashMap::new(),
            sensitive_paths: BTreeSet::new(),
            typed: HashSet::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// Number of distinct placeholders issued
    pub fn token_count(&self) -> usize {
        self.originals.len()
    }

    /// Field paths redacted through a schema rule in this session
    pub fn sensitive_paths(&self) -> impl Iterator<Item = &str> {
        self.sensitive_paths.iter().map(String::as_str)
    }

    pub fn original(&self, placeholder: &str) -> Option<&str> {
        self.originals.get(placeholder).map(String::as_str)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_used_at {
            self.last_used_at = now;
        }
    }

    fn is_idle_expired(&self, now: DateTime<Utc>, idle_expiry: Duration) -> bool {
        now - self.last_used_at > idle_expiry
    }

    fn is_within_window(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.last_used_at <= window
    }

    pub(crate) fn record_path(&mut self, path: String) {
        self.sensitive_paths.insert(path);
    }

    pub(crate) fn mark_typed(&mut self, placeholder: &str) {
        self.typed.insert(placeholder.to_string());
    }

    /// Original number or boolean behind a placeholder, with its JSON type
    pub fn typed_original(&self, placeholder: &str) -> Option<Value> {
        if !self.typed.contains(placeholder) {
            return None;
        }
        self.originals
            .get(placeholder)
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    /// Placeholder for `value`, issuing one on first sight
    pub fn tokenize(&mut self, category: Category, value: &str) -> FinguardResult<String> {
        let lookup = (category, value.to_string());
        if let Some(existing) = self.tokens.get(&lookup) {
            return Ok(existing.clone());
        }

        let hash = token::token_hash(self.id.as_uuid().as_bytes(), category, value)?;
        let mut placeholder = token::placeholder(category, &hash[..self.token_hex_len]);

        // A truncated hash already issued for another value falls back to the full hash
        if self.originals.contains_key(&placeholder) {
            placeholder = token::placeholder(category, &hash);
        }

        self.originals.insert(placeholder.clone(), value.to_string());
        self.tokens.insert(lookup, placeholder.clone());
        Ok(placeholder)
    }

    /// Replace every placeholder this session issued; others are left as-is
    pub fn restore_text(&self, text: &str) -> String {
        PLACEHOLDER_REGEX
            .replace_all(text, |caps: &Captures| {
                let token = &caps[0];
                self.originals
                    .get(token)
                    .cloned()
                    .unwrap_or_else(|| token.to_string())
            })
            .into_owned()
    }
}

impl fmt::Debug for AnonymizationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymizationSession")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("tokens", &self.originals.len())
            .finish_non_exhaustive()
    }
}

impl Drop for AnonymizationSession {
    fn drop(&mut self) {
        for (_, mut original) in self.originals.drain() {
            original.zeroize();
        }
        for ((_, mut original), _) in self.tokens.drain() {
            original.zeroize();
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, AnonymizationSession>,
    /// Current session per (user, purpose)
    current: HashMap<(String, String), SessionId>,
}

/// Owns every live redaction session
pub struct SessionRegistry {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    log: Arc<AuditLogger>,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        log: Arc<AuditLogger>,
    ) -> FinguardResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            log,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the current session for (user, purpose)
    ///
    /// Lookup, creation and `f` itself all happen under one lock, so two
    /// concurrent callers for the same pair always share one mapping.
    pub fn with_current<R, F>(&self, user_id: &str, purpose: &str, f: F) -> FinguardResult<R>
    where
        F: FnOnce(&mut AnonymizationSession) -> FinguardResult<R>,
    {
        let now = self.clock.now();
        let mut state = self.lock();
        let state = &mut *state;
        let pair = (user_id.to_string(), purpose.to_string());

        let reusable = state
            .current
            .get(&pair)
            .and_then(|id| state.sessions.get(id))
            .filter(|session| session.is_within_window(now, self.config.context_window))
            .map(|session| session.id());

        let id = match reusable {
            Some(id) => id,
            None => {
                let session =
                    AnonymizationSession::new(user_id, purpose, now, self.config.token_hex_len)?;
                let id = session.id();
                state.sessions.insert(id, session);
                state.current.insert(pair, id);
                self.log.record(
                    AuditEntry::info(SecurityEvent::SessionCreated)
                        .with_session(id.to_string())
                        .with_detail(format!("purpose {}", purpose))
                        .at(now),
                );
                id
            }
        };

        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| FinguardError::SessionExpired(id.to_string()))?;
        session.touch(now);
        f(session)
    }

    /// Run `f` against an existing session
    ///
    /// A missing session, or one idle past its expiry, is `SessionExpired`.
    pub fn with_session<R, F>(&self, id: SessionId, f: F) -> FinguardResult<R>
    where
        F: FnOnce(&mut AnonymizationSession) -> R,
    {
        let now = self.clock.now();
        let mut state = self.lock();

        let expired = match state.sessions.get(&id) {
            None => return Err(FinguardError::SessionExpired(id.to_string())),
            Some(session) => session.is_idle_expired(now, self.config.idle_expiry),
        };
        if expired {
            self.remove_locked(&mut state, id, "idle expiry", now);
            return Err(FinguardError::SessionExpired(id.to_string()));
        }

        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| FinguardError::SessionExpired(id.to_string()))?;
        session.touch(now);
        Ok(f(session))
    }

    /// Destroy a session; returns whether it existed
    pub fn end(&self, id: SessionId) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        self.remove_locked(&mut state, id, "ended", now)
    }

    /// Destroy every session idle past its expiry
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let expired: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|s| s.is_idle_expired(now, self.config.idle_expiry))
            .map(|s| s.id())
            .collect();

        for id in &expired {
            self.remove_locked(&mut state, *id, "idle expiry", now);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_locked(
        &self,
        state: &mut RegistryState,
        id: SessionId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(session) = state.sessions.remove(&id) else {
            return false;
        };
        let pair = (session.user_id.clone(), session.purpose.clone());
        if state.current.get(&pair) == Some(&id) {
            state.current.remove(&pair);
        }
        self.log.record(
            AuditEntry::info(SecurityEvent::SessionEnded)
                .with_session(id.to_string())
                .with_detail(format!("{}; {} placeholders", reason, session.token_count()))
                .at(now),
        );
        true
    }
}
