//! Event Store — per-session bounded ring of server-to-client events, keyed
//! by a monotonically assigned event id, enabling SSE `Last-Event-ID` resume.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

/// One replayable event: a server-to-client payload and the id it was
/// assigned when appended.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_id: u64,
    pub payload: Vec<u8>,
}

struct SessionLog {
    next_id: u64,
    events: VecDeque<StoredEvent>,
}

impl SessionLog {
    fn new() -> Self {
        Self {
            next_id: 1,
            events: VecDeque::new(),
        }
    }
}

/// Bounded, per-session append-only log of emitted SSE payloads.
///
/// Default capacity is 1024 events per session (§4.2); the oldest event is
/// dropped once a session's log would exceed capacity.
pub struct EventStore {
    capacity: usize,
    sessions: Mutex<HashMap<String, SessionLog>>,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Append `payload` for `session_id`, returning the event id it was
    /// assigned. Oldest events are evicted first once over capacity.
    pub async fn append(&self, session_id: &str, payload: Vec<u8>) -> u64 {
        let mut sessions = self.sessions.lock().await;
        let log = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionLog::new);

        let event_id = log.next_id;
        log.next_id += 1;
        log.events.push_back(StoredEvent { event_id, payload });

        while log.events.len() > self.capacity {
            log.events.pop_front();
        }

        event_id
    }

    /// Events for `session_id` strictly greater than `last_event_id`, in
    /// order. Returns an empty vec both when there is nothing newer and when
    /// `last_event_id` has already aged out of the retained window — the
    /// caller (the SSE server transport) must treat those the same way: if
    /// the replay is empty and the client isn't caught up, it has to resync
    /// from scratch rather than assume no messages were missed.
    pub async fn replay_from(&self, session_id: &str, last_event_id: u64) -> Vec<StoredEvent> {
        let sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(log) => log
                .events
                .iter()
                .filter(|e| e.event_id > last_event_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether `last_event_id` is still resident (i.e. a `replay_from` call
    /// for it is guaranteed complete, not just "nothing newer happened to be
    /// retained"). Used by the SSE transport to decide whether a `None`/empty
    /// replay means "fully caught up" or "resync, the tail aged out".
    pub async fn has_event(&self, session_id: &str, event_id: u64) -> bool {
        if event_id == 0 {
            return true;
        }
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|log| log.events.iter().any(|e| e.event_id == event_id))
            .unwrap_or(false)
    }

    /// Drop a session's log entirely, e.g. on connection cleanup.
    pub async fn drop_session(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_assign_increasing_ids() {
        let store = EventStore::new(10);
        let a = store.append("s1", b"one".to_vec()).await;
        let b = store.append("s1", b"two".to_vec()).await;
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn replay_from_returns_strictly_greater_ids_in_order() {
        let store = EventStore::new(10);
        store.append("s1", b"e1".to_vec()).await;
        store.append("s1", b"e2".to_vec()).await;
        store.append("s1", b"e3".to_vec()).await;

        let replay = store.replay_from("s1", 1).await;
        let ids: Vec<u64> = replay.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn replay_from_unknown_session_is_empty() {
        let store = EventStore::new(10);
        assert!(store.replay_from("missing", 0).await.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let store = EventStore::new(2);
        store.append("s1", b"e1".to_vec()).await;
        store.append("s1", b"e2".to_vec()).await;
        store.append("s1", b"e3".to_vec()).await;

        let replay = store.replay_from("s1", 0).await;
        let ids: Vec<u64> = replay.iter().map(|e| e.event_id).collect();
        // e1 was evicted; only e2, e3 remain resident.
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn replay_from_stale_id_after_eviction_signals_resync() {
        let store = EventStore::new(1);
        store.append("s1", b"e1".to_vec()).await;
        store.append("s1", b"e2".to_vec()).await; // evicts e1

        assert!(!store.has_event("s1", 1).await);
        // replay_from(1) looks empty-or-newer either way; has_event is what
        // distinguishes "caught up" from "resync".
        let replay = store.replay_from("s1", 1).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event_id, 2);
    }

    #[tokio::test]
    async fn drop_session_clears_its_log() {
        let store = EventStore::new(10);
        store.append("s1", b"e1".to_vec()).await;
        store.drop_session("s1").await;
        assert!(store.replay_from("s1", 0).await.is_empty());
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let store = EventStore::new(10);
        store.append("s1", b"a".to_vec()).await;
        store.append("s2", b"b".to_vec()).await;
        assert_eq!(store.replay_from("s1", 0).await.len(), 1);
        assert_eq!(store.replay_from("s2", 0).await.len(), 1);
    }
}
