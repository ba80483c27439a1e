// src/session.rs
// Concurrent Session Store: persisted Results across tool calls that share
// one logical analysis (spec §4.7, §9 "Session store").
//
// The source scans a Vec linearly for the session_key -> session_id match on
// every rehydration. We keep a DashMap of sessions indexed by session_id (the
// caller-facing handle) plus a secondary DashMap session_key -> session_id,
// rebuilt on insert, eliminating the O(n) scan the spec calls out.

use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const SESSION_TTL: chrono::Duration = chrono::Duration::hours(1);

/// Whitelisted args that feed the deterministic session key (spec §4.7,
/// §9 Open Questions — hardcoded here per source, not orchestrator-declared).
const KEY_WHITELIST: &[&str] = &["hours", "focus", "database_name", "table_name"];

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub session_key: String,
    pub results: Map<String, Value>,
    pub args: Map<String, Value>,
    pub last_completed_step: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub last_write: DateTime<Utc>,
}

pub struct SessionStore {
    sessions: DashMap<String, Session>,
    /// session_key -> session_id, rebuilt on every insert.
    key_index: DashMap<String, String>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            key_index: DashMap::new(),
        }
    }

    /// Look up a session by its caller-facing id. Expired entries are
    /// deleted on access (spec §4.7: "On every get the TTL is checked and
    /// expired entries deleted").
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let expired = self
            .sessions
            .get(session_id)
            .map(|s| Utc::now().signed_duration_since(s.last_write) > SESSION_TTL)
            .unwrap_or(false);

        if expired {
            self.remove(session_id);
            return None;
        }

        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Find a live session by its deterministic key (used when the caller
    /// supplies no `session_id`). O(1) via the secondary index, replacing
    /// the source's linear scan (spec §9).
    pub fn find_by_key(&self, session_key: &str) -> Option<Session> {
        let session_id = self.key_index.get(session_key)?.clone();
        self.get(&session_id)
    }

    /// Persist results for a session, creating one if `session_id` is absent.
    /// Returns the (possibly newly minted) session_id.
    pub fn put(
        &self,
        session_id: Option<String>,
        session_key: String,
        results: Map<String, Value>,
        args: Map<String, Value>,
        last_completed_step: Option<Value>,
    ) -> String {
        let now = Utc::now();
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let created_at = self
            .sessions
            .get(&session_id)
            .map(|s| s.created_at)
            .unwrap_or(now);

        self.sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                session_key: session_key.clone(),
                results,
                args,
                last_completed_step,
                created_at,
                last_write: now,
            },
        );
        self.key_index.insert(session_key, session_id.clone());

        session_id
    }

    fn remove(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.key_index.remove(&session.session_key);
        }
    }

    /// Lazily sweep every expired entry. Not required for correctness (TTL
    /// is also checked on `get`/`find_by_key`) but bounds memory for
    /// sessions nobody ever rereads.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| now.signed_duration_since(entry.last_write) > SESSION_TTL)
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in expired {
            self.remove(&session_id);
        }
    }
}

/// `generateDeterministicSessionKey(tool, args)` (spec §4.7, §8 "Session
/// determinism"): a function of `(tool, args.hours, args.focus,
/// args.database_name, args.table_name)` only.
pub fn deterministic_session_key(tool: &str, args: &Map<String, Value>) -> String {
    let mut canonical = Map::new();
    canonical.insert("tool".to_string(), Value::String(tool.to_string()));
    for key in KEY_WHITELIST {
        let value = args.get(*key).cloned().unwrap_or(Value::Null);
        canonical.insert(key.to_string(), value);
    }

    // serde_json::Map preserves insertion order, so this is already canonical.
    let canonical_json = serde_json::to_string(&Value::Object(canonical)).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    let digest = hasher.finalize();

    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    encoded.chars().take(20).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_deterministic_key_ignores_non_whitelisted_args() {
        let a1 = args(&[
            ("hours", json!(24)),
            ("focus", json!("storage")),
            ("noise", json!("anything")),
        ]);
        let a2 = args(&[
            ("hours", json!(24)),
            ("focus", json!("storage")),
            ("noise", json!("something else entirely")),
        ]);
        assert_eq!(
            deterministic_session_key("analyze_storage", &a1),
            deterministic_session_key("analyze_storage", &a2)
        );
    }

    #[test]
    fn test_deterministic_key_changes_with_whitelisted_args() {
        let a1 = args(&[("hours", json!(24))]);
        let a2 = args(&[("hours", json!(48))]);
        assert_ne!(
            deterministic_session_key("t", &a1),
            deterministic_session_key("t", &a2)
        );
    }

    #[test]
    fn test_deterministic_key_changes_with_tool_name() {
        let a = args(&[("hours", json!(24))]);
        assert_ne!(
            deterministic_session_key("tool_a", &a),
            deterministic_session_key("tool_b", &a)
        );
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let store = SessionStore::new();
        let mut results = Map::new();
        results.insert("q1".into(), json!([{"n": 1}]));
        let id = store.put(None, "key1".into(), results.clone(), Map::new(), None);

        let session = store.get(&id).expect("session should exist");
        assert_eq!(session.results, results);
    }

    #[test]
    fn test_find_by_key_uses_secondary_index() {
        let store = SessionStore::new();
        let id = store.put(None, "det-key".into(), Map::new(), Map::new(), None);
        let found = store.find_by_key("det-key").expect("should find by key");
        assert_eq!(found.session_id, id);
    }

    #[test]
    fn test_missing_session_is_silent_none() {
        let store = SessionStore::new();
        assert!(store.get("nonexistent").is_none());
        assert!(store.find_by_key("nonexistent").is_none());
    }

    #[test]
    fn test_expired_session_is_evicted_on_get() {
        let store = SessionStore::new();
        let id = store.put(None, "k".into(), Map::new(), Map::new(), None);
        if let Some(mut entry) = store.sessions.get_mut(&id) {
            entry.last_write = Utc::now() - chrono::Duration::hours(2);
        }
        assert!(store.get(&id).is_none());
        assert!(store.find_by_key("k").is_none());
    }
}
