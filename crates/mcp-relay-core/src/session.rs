//! Session/Connection data model (§3) shared between the Session Manager and
//! the transports. Transport handles themselves are not modeled here — this
//! crate stays independent of any networking framework, so it can't depend
//! on axum/reqwest types — only the bookkeeping fields the manager needs to
//! enforce the invariants of §3 live here.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The sentinel `connectionId` used when an upstream refuses to be
/// initialized more than once and every session is folded onto one shared
/// connection.
pub const GLOBAL_CONNECTION_ID: &str = "global-mcp-connection";

/// Mint a new opaque session id: a v4-style UUID, not a human-friendly
/// adjective-noun name (no GUI/debugging surface needs one here).
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// `state` field of a Connection (§3 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Initializing,
    Connected,
    Disconnected,
    Error,
}

/// The non-transport fields of a Connection (§3): everything the Session
/// Manager needs to keep its session↔connection bookkeeping consistent and
/// run validation/cleanup, without needing to know what kind of
/// client/server transport is attached.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub connection_id: String,
    pub state: ConnectionState,
    pub capabilities: serde_json::Value,
    pub created_at: u64,
    pub last_used_at: u64,
    pub session_ids: HashSet<String>,
}

impl ConnectionMeta {
    pub fn new(connection_id: String) -> Self {
        let now = now_millis();
        Self {
            connection_id,
            state: ConnectionState::Initializing,
            capabilities: serde_json::json!({}),
            created_at: now,
            last_used_at: now,
            session_ids: HashSet::new(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.connection_id == GLOBAL_CONNECTION_ID
    }

    pub fn touch(&mut self) {
        self.last_used_at = now_millis();
    }

    /// True once `state == Connected` (§4.6 "Validation"). Liveness probing
    /// beyond the state flag is a transport-level concern and layered on top
    /// of this by the Session Manager.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// §4.6 cleanup sweep predicate: idle past `idle_ttl_ms` with no sessions
    /// bound to it.
    pub fn is_evictable(&self, now: u64, idle_ttl_ms: u64) -> bool {
        self.session_ids.is_empty() && now.saturating_sub(self.last_used_at) > idle_ttl_ms
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_id_is_uuid_v4_shaped() {
        let id = new_session_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().filter(|c| *c == '-').count(), 4);
    }

    #[test]
    fn global_connection_meta_is_global() {
        let meta = ConnectionMeta::new(GLOBAL_CONNECTION_ID.to_string());
        assert!(meta.is_global());
    }

    #[test]
    fn eviction_requires_both_empty_sessions_and_idle_ttl() {
        let mut meta = ConnectionMeta::new("conn-1".to_string());
        meta.last_used_at = now_millis().saturating_sub(60_000);
        // Still has a bound session: not evictable even though idle.
        meta.session_ids.insert("s1".to_string());
        assert!(!meta.is_evictable(now_millis(), 1_000));

        meta.session_ids.clear();
        assert!(meta.is_evictable(now_millis(), 1_000));
        assert!(!meta.is_evictable(now_millis(), 3_600_000));
    }

    #[test]
    fn touch_updates_last_used_at() {
        let mut meta = ConnectionMeta::new("conn-1".to_string());
        meta.last_used_at = 0;
        meta.touch();
        assert!(meta.last_used_at > 0);
    }
}
