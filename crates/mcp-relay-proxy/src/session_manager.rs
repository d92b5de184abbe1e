//! Session Manager (§4.6) — the heart of the proxy. Owns `activeConnections`,
//! `sessionToConnection`, the `initializing` guard, and the periodic cleanup
//! sweep; runs the concurrent-initialize protocol and subsequent-request
//! dispatch described in §4.6.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcp_relay_core::capabilities::{default_global_capabilities, Capabilities};
use mcp_relay_core::event_store::EventStore;
use mcp_relay_core::protocol::{Envelope, Id, InitializeResult};
use mcp_relay_core::session::{new_session_id, now_millis, ConnectionMeta, ConnectionState, GLOBAL_CONNECTION_ID};
use mcp_relay_core::transport::TransportConfig;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::bridge::{ServerSink, UpstreamLink};
use crate::client::{remote_http, subprocess, ClientTransport};
use crate::error::ProxyError;

/// §5/§6 tunables the front end's CLI parses into.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// The statically configured upstream, used whenever `dynamic_proxy` is
    /// off, or as the fallback when it's on but a session's `initialize`
    /// didn't name one.
    pub upstream: TransportConfig,
    /// §6 `--dynamicProxy`: pick the upstream per session from the first
    /// `initialize` instead of always using `upstream`. This proxy reads it
    /// from an `_mcpRelayUpstream` key under the request's `params`, a
    /// supplemental wire convention DESIGN.md records.
    pub dynamic_proxy: bool,
    pub init_wait: Duration,
    pub idle_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            upstream: TransportConfig::Subprocess {
                command: "true".to_string(),
                args: vec![],
                shell: None,
            },
            dynamic_proxy: false,
            init_wait: Duration::from_millis(100),
            idle_ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

struct ConnectionEntry {
    meta: Mutex<ConnectionMeta>,
    link: Arc<UpstreamLink>,
}

pub struct SessionManager {
    connections: Mutex<HashMap<String, Arc<ConnectionEntry>>>,
    session_to_connection: Mutex<HashMap<String, String>>,
    initializing: Mutex<HashMap<String, Arc<Notify>>>,
    event_store: Arc<EventStore>,
    closed_tx: mpsc::UnboundedSender<String>,
    config: ManagerConfig,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            session_to_connection: Mutex::new(HashMap::new()),
            initializing: Mutex::new(HashMap::new()),
            event_store: Arc::new(EventStore::default()),
            closed_tx,
            config,
        });
        SessionManager::spawn_closed_listener(manager.clone(), closed_rx);
        SessionManager::spawn_cleanup_loop(manager.clone());
        manager
    }

    pub fn event_store(&self) -> Arc<EventStore> {
        self.event_store.clone()
    }

    /// §4.6 step 1: resolve the session id the caller's HTTP handler needs
    /// *before* it can build this session's `ServerSink`/event channel, so
    /// it must be callable ahead of [`Self::initialize`] rather than folded
    /// into it.
    pub fn resolve_session_id(&self, session_id_header: Option<String>) -> String {
        session_id_header.unwrap_or_else(new_session_id)
    }

    fn spawn_closed_listener(manager: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        tokio::spawn(async move {
            while let Some(connection_id) = rx.recv().await {
                tracing::info!(connection = %connection_id, "upstream closed, cleaning up");
                manager.cleanup_connection(&connection_id).await;
            }
        });
    }

    fn spawn_cleanup_loop(manager: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.cleanup_interval);
            loop {
                interval.tick().await;
                manager.sweep_idle().await;
            }
        });
    }

    /// §4.6 cleanup sweep: evict connections idle past the TTL with no
    /// bound sessions.
    async fn sweep_idle(&self) {
        let now = now_millis();
        let idle_ttl_ms = self.config.idle_ttl.as_millis() as u64;
        let stale: Vec<String> = {
            let connections = self.connections.lock().await;
            let mut stale = Vec::new();
            for (id, entry) in connections.iter() {
                let meta = entry.meta.lock().await;
                if meta.is_evictable(now, idle_ttl_ms) {
                    stale.push(id.clone());
                }
            }
            stale
        };
        for id in stale {
            tracing::info!(connection = %id, "evicting idle connection");
            self.cleanup_connection(&id).await;
        }
    }

    async fn validate(&self, connection_id: &str) -> bool {
        let connections = self.connections.lock().await;
        match connections.get(connection_id) {
            Some(entry) => entry.meta.lock().await.is_connected(),
            None => false,
        }
    }

    async fn touch(&self, connection_id: &str) {
        if let Some(entry) = self.connections.lock().await.get(connection_id) {
            entry.meta.lock().await.touch();
        }
    }

    async fn link_for(&self, connection_id: &str) -> Option<Arc<UpstreamLink>> {
        self.connections
            .lock()
            .await
            .get(connection_id)
            .map(|e| e.link.clone())
    }

    /// §4.6 `cleanupConnection`: drop every bound session, close both
    /// transports (errors logged, never propagated), remove the entry.
    pub async fn cleanup_connection(&self, connection_id: &str) {
        let entry = self.connections.lock().await.remove(connection_id);
        let Some(entry) = entry else { return };

        let session_ids: Vec<String> = {
            let meta = entry.meta.lock().await;
            meta.session_ids.iter().cloned().collect()
        };
        self.session_to_connection
            .lock()
            .await
            .retain(|_, v| v != connection_id);
        for sid in &session_ids {
            self.event_store.drop_session(sid).await;
        }
        entry.link.close().await;
    }

    /// Client disconnected from its server transport (§4.6 step 10). Drops
    /// just this session; the connection itself is only reclaimed once it
    /// has zero bound sessions *and* the idle sweep finds it (§4.6 "Cleanup").
    pub async fn on_session_closed(&self, sid: &str) {
        if let Some(connection_id) = self.session_to_connection.lock().await.remove(sid) {
            if let Some(entry) = self.connections.lock().await.get(&connection_id) {
                let mut meta = entry.meta.lock().await;
                meta.session_ids.remove(sid);
                entry.link.unbind_session(sid).await;
            }
            self.event_store.drop_session(sid).await;
        }
    }

    /// Re-point an already-bound session at a fresh sink, e.g. a client that
    /// reconnected its SSE stream after a drop. A no-op if the session isn't
    /// bound to any connection yet (nothing to rebind until `initialize`).
    pub async fn rebind_sink(&self, sid: &str, sink: Arc<dyn ServerSink>) {
        if let Some(connection_id) = self.session_to_connection.lock().await.get(sid).cloned() {
            if let Some(entry) = self.connections.lock().await.get(&connection_id) {
                entry.link.bind_session(sid.to_string(), sink).await;
            }
        }
    }

    async fn bind_session(&self, sid: &str, connection_id: &str, sink: Arc<dyn ServerSink>) {
        if let Some(entry) = self.connections.lock().await.get(connection_id) {
            entry.meta.lock().await.session_ids.insert(sid.to_string());
            entry.link.bind_session(sid.to_string(), sink).await;
        }
        self.session_to_connection
            .lock()
            .await
            .insert(sid.to_string(), connection_id.to_string());
    }

    /// §4.6 steps 2-12: the initialize protocol for an already-resolved
    /// `sid` (see [`Self::resolve_session_id`]). `sink` is where server-to-
    /// client messages for this session go once it's bound to a connection.
    pub async fn initialize(
        self: &Arc<Self>,
        sid: String,
        request: Envelope,
        sink: Arc<dyn ServerSink>,
    ) -> Result<Envelope, ProxyError> {
        // Steps 2-3: only one initialize per sid runs at a time. A waiter
        // that times out before the leader publishes a result must re-race
        // for the slot rather than assume it now owns it — falling through
        // unconditionally would let two `do_initialize` calls run at once
        // for the same sid.
        loop {
            let owns_it = {
                let mut initializing = self.initializing.lock().await;
                if initializing.contains_key(&sid) {
                    false
                } else {
                    initializing.insert(sid.clone(), Arc::new(Notify::new()));
                    true
                }
            };

            if !owns_it {
                let waiter = self.initializing.lock().await.get(&sid).cloned();
                if let Some(notify) = waiter {
                    let _ = tokio::time::timeout(self.config.init_wait, notify.notified()).await;
                }
                if let Some(connection_id) = self.session_to_connection.lock().await.get(&sid).cloned() {
                    return self.dispatch_on(&connection_id, request).await;
                }
                // The leader hasn't published a mapping yet — it may still
                // be running, or it failed and already cleared its own
                // entry. Either way, go back and race for the slot again
                // instead of treating the timeout as a handoff.
                continue;
            }

            let result = self.do_initialize(&sid, request, sink).await;

            if let Some(notify) = self.initializing.lock().await.remove(&sid) {
                notify.notify_waiters();
            }

            return result;
        }
    }

    async fn do_initialize(
        self: &Arc<Self>,
        sid: &str,
        request: Envelope,
        sink: Arc<dyn ServerSink>,
    ) -> Result<Envelope, ProxyError> {
        // Step 4: reuse path.
        if let Some(connection_id) = self.session_to_connection.lock().await.get(sid).cloned() {
            if self.validate(&connection_id).await {
                self.touch(&connection_id).await;
                return self.dispatch_on(&connection_id, request).await;
            }
            self.cleanup_connection(&connection_id).await;
        }

        // Step 5: global reuse.
        if self.validate(GLOBAL_CONNECTION_ID).await {
            self.bind_session(sid, GLOBAL_CONNECTION_ID, sink).await;
            self.touch(GLOBAL_CONNECTION_ID).await;
            return self.dispatch_on(GLOBAL_CONNECTION_ID, request).await;
        }

        // Step 6: brand new connection.
        let transport_config = self.choose_upstream(&request);
        let client: Arc<dyn ClientTransport> = match &transport_config {
            TransportConfig::Subprocess { command, args, shell } => {
                subprocess::from_config(command.clone(), args.clone(), shell.clone())
            }
            TransportConfig::RemoteStreamableHttp { server_url } => {
                remote_http::from_config(server_url.clone())
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = client.connect(events_tx).await {
            tracing::error!(session = %sid, "upstream connect failed: {}", e);
            return Err(ProxyError::TransportSetup(e.to_string()));
        }

        let link = Arc::new(UpstreamLink::new(sid.to_string(), client.clone(), Capabilities::default()));
        let pump_link = link.clone();
        let closed_tx = self.closed_tx.clone();
        tokio::spawn(async move { pump_link.run_pump(events_rx, closed_tx).await });

        let init_response = match link.call(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                client.close().await;
                return Err(e.into());
            }
        };

        if let Some(error) = &init_response.error {
            if error.message.contains("Server already initialized") {
                return self.promote_to_global(sid, link, client, request, sink).await;
            }
            client.close().await;
            return Err(ProxyError::Relay(error.clone()));
        }

        let capabilities = extract_capabilities(&init_response);
        link.set_capabilities(Capabilities::from_value(&capabilities)).await;
        self.register_connection(sid, sid, link, sink, capabilities).await;

        Ok(init_response)
    }

    /// Step 6's "Server already initialized" branch. This session's own
    /// transport never produced a usable connection — the upstream is a
    /// singleton that's already live under some *other* session's id. Fold
    /// that existing connection into the global slot and bind this session
    /// to it, rather than registering this session's redundant new link as
    /// global and leaving the real connection permanently un-merged.
    async fn promote_to_global(
        self: &Arc<Self>,
        sid: &str,
        link: Arc<UpstreamLink>,
        client: Arc<dyn ClientTransport>,
        original_request: Envelope,
        sink: Arc<dyn ServerSink>,
    ) -> Result<Envelope, ProxyError> {
        tracing::info!(session = %sid, "upstream refused re-initialize, promoting existing connection to global");
        client.close().await;

        let capabilities = default_global_capabilities();
        if let Some(existing) = self.rekey_to_global().await {
            existing
                .link
                .set_capabilities(Capabilities::from_value(&capabilities))
                .await;
            existing.meta.lock().await.capabilities = capabilities.clone();
            self.bind_session(sid, GLOBAL_CONNECTION_ID, sink).await;
        } else {
            // No other live connection on file to fold in. Shouldn't happen
            // given the upstream just told us it's already initialized, but
            // rather than drop this session on the floor, treat its own
            // transport as the (singleton) global connection.
            link.set_capabilities(Capabilities::from_value(&capabilities)).await;
            self.register_connection(sid, GLOBAL_CONNECTION_ID, link, sink, capabilities.clone())
                .await;
        }

        Ok(Envelope::response(
            original_request.id.unwrap_or(Id::Null),
            serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": capabilities,
                "serverInfo": {"name": "mcp-relay", "version": env!("CARGO_PKG_VERSION")},
            }),
        ))
    }

    /// Move the one connected, non-global connection currently on file to
    /// the global slot, remapping every session bound to it. Returns the
    /// (now global) entry, or `None` if there wasn't one to promote.
    async fn rekey_to_global(&self) -> Option<Arc<ConnectionEntry>> {
        let mut connections = self.connections.lock().await;
        let mut existing_id = None;
        for (id, entry) in connections.iter() {
            if id == GLOBAL_CONNECTION_ID {
                continue;
            }
            if entry.meta.lock().await.is_connected() {
                existing_id = Some(id.clone());
                break;
            }
        }
        let existing_id = existing_id?;
        let entry = connections.remove(&existing_id)?;
        entry.meta.lock().await.connection_id = GLOBAL_CONNECTION_ID.to_string();
        connections.insert(GLOBAL_CONNECTION_ID.to_string(), entry.clone());
        drop(connections);

        let session_ids: Vec<String> = entry.meta.lock().await.session_ids.iter().cloned().collect();
        let mut session_to_connection = self.session_to_connection.lock().await;
        for sid in session_ids {
            session_to_connection.insert(sid, GLOBAL_CONNECTION_ID.to_string());
        }

        Some(entry)
    }

    async fn register_connection(
        &self,
        sid: &str,
        connection_id: &str,
        link: Arc<UpstreamLink>,
        sink: Arc<dyn ServerSink>,
        capabilities: serde_json::Value,
    ) {
        let mut meta = ConnectionMeta::new(connection_id.to_string());
        meta.state = ConnectionState::Connected;
        meta.capabilities = capabilities;
        meta.session_ids.insert(sid.to_string());

        let entry = Arc::new(ConnectionEntry {
            meta: Mutex::new(meta),
            link: link.clone(),
        });
        self.connections
            .lock()
            .await
            .insert(connection_id.to_string(), entry);
        link.bind_session(sid.to_string(), sink).await;
        self.session_to_connection
            .lock()
            .await
            .insert(sid.to_string(), connection_id.to_string());
    }

    fn choose_upstream(&self, request: &Envelope) -> TransportConfig {
        if self.config.dynamic_proxy {
            if let Some(params) = &request.params {
                if let Some(overridden) = params
                    .get("_mcpRelayUpstream")
                    .and_then(|v| serde_json::from_value::<TransportConfig>(v.clone()).ok())
                {
                    return overridden;
                }
            }
        }
        self.config.upstream.clone()
    }

    /// §4.6 "Subsequent request dispatch" for a request envelope (one that
    /// expects a response).
    pub async fn dispatch_request(
        &self,
        session_id_header: Option<String>,
        request: Envelope,
    ) -> Result<Envelope, ProxyError> {
        let connection_id = self.resolve_connection(session_id_header).await?;
        self.dispatch_on(&connection_id, request).await
    }

    /// Same resolution/validation as [`Self::dispatch_request`], but for a
    /// notification: fire-and-forget, no correlated response.
    pub async fn dispatch_notification(
        &self,
        session_id_header: Option<String>,
        notification: Envelope,
    ) -> Result<(), ProxyError> {
        let connection_id = self.resolve_connection(session_id_header).await?;
        let link = self
            .link_for(&connection_id)
            .await
            .ok_or(ProxyError::SessionNotFound)?;
        let caps = link.capabilities().await;
        let method = notification.method.clone().unwrap_or_default();
        if !crate::bridge::notification_relay_allowed(&method, &caps) {
            return Ok(());
        }
        link.notify(notification).await.map_err(ProxyError::from)
    }

    async fn resolve_connection(&self, session_id_header: Option<String>) -> Result<String, ProxyError> {
        let sid = session_id_header.ok_or(ProxyError::MissingSession)?;
        let connection_id = self
            .session_to_connection
            .lock()
            .await
            .get(&sid)
            .cloned()
            .ok_or(ProxyError::SessionNotFound)?;

        if !self.validate(&connection_id).await {
            self.cleanup_connection(&connection_id).await;
            return Err(ProxyError::ConnectionLost);
        }
        self.touch(&connection_id).await;
        Ok(connection_id)
    }

    async fn dispatch_on(&self, connection_id: &str, request: Envelope) -> Result<Envelope, ProxyError> {
        let link = self
            .link_for(connection_id)
            .await
            .ok_or(ProxyError::SessionNotFound)?;

        let caps = link.capabilities().await;
        let method = request.method.clone().unwrap_or_default();
        if !crate::bridge::request_allowed(&method, &caps) {
            return Err(ProxyError::MethodNotAvailable(method));
        }

        let response = link.call(request).await?;
        if let Some(error) = &response.error {
            return Err(ProxyError::Relay(error.clone()));
        }
        Ok(response)
    }
}

fn extract_capabilities(response: &Envelope) -> serde_json::Value {
    response
        .result
        .as_ref()
        .and_then(|r| serde_json::from_value::<InitializeResult>(r.clone()).ok())
        .map(|r| r.capabilities)
        .unwrap_or_else(|| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    #[async_trait::async_trait]
    impl ServerSink for NullSink {
        async fn send(&self, _envelope: Envelope) {}
    }

    fn null_sink() -> Arc<dyn ServerSink> {
        Arc::new(NullSink)
    }

    fn shell_upstream(script: String) -> TransportConfig {
        TransportConfig::Subprocess {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            shell: None,
        }
    }

    /// A second `initialize()` call for the same sid must never spawn its
    /// own upstream once the first is already in flight: it should wait for
    /// the leader and reuse whatever connection it produces, even if the
    /// leader is still running when the waiter's poll times out.
    #[tokio::test]
    async fn concurrent_initialize_for_the_same_session_runs_the_upstream_once() {
        let dir = tempfile::tempdir().unwrap();
        let invocations = dir.path().join("invocations");
        let script = format!(
            "read -r _line; echo x >> {path}; sleep 0.05; \
             echo '{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{{}},\"serverInfo\":{{}}}}}}'",
            path = invocations.display()
        );

        let manager = SessionManager::new(ManagerConfig {
            upstream: shell_upstream(script),
            init_wait: Duration::from_millis(10),
            ..Default::default()
        });

        let sid = "shared-session".to_string();
        let request = Envelope::request(serde_json::json!(1), "initialize", None);

        let m1 = manager.clone();
        let sid1 = sid.clone();
        let r1 = request.clone();
        let h1 = tokio::spawn(async move { m1.initialize(sid1, r1, null_sink()).await });

        // Give the first caller a head start so it reliably wins the race.
        tokio::time::sleep(Duration::from_millis(2)).await;

        let m2 = manager.clone();
        let sid2 = sid.clone();
        let r2 = request.clone();
        let h2 = tokio::spawn(async move { m2.initialize(sid2, r2, null_sink()).await });

        let (res1, res2) = tokio::join!(h1, h2);
        res1.unwrap().unwrap();
        res2.unwrap().unwrap();

        let seen = std::fs::read_to_string(&invocations).unwrap();
        assert_eq!(seen.lines().count(), 1, "upstream should only be spawned once for the shared sid");

        let connections = manager.connections.lock().await;
        assert_eq!(connections.len(), 1);
    }

    /// When a second session's upstream refuses re-initialize, both sessions
    /// must end up resolving to the *same* global connection rather than
    /// leaving the first session's connection orphaned and promoting a
    /// redundant new one.
    #[tokio::test]
    async fn already_initialized_upstream_merges_both_sessions_onto_one_global_connection() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("already-initialized");
        let script = format!(
            "read -r _line; if [ -e {path} ]; then \
             echo '{{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{{\"code\":-32000,\"message\":\"Server already initialized\"}}}}'; \
             else touch {path}; \
             echo '{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{{}},\"serverInfo\":{{}}}}}}'; fi",
            path = marker.display()
        );

        let manager = SessionManager::new(ManagerConfig {
            upstream: shell_upstream(script),
            ..Default::default()
        });

        let request = || Envelope::request(serde_json::json!(1), "initialize", None);

        manager
            .clone()
            .initialize("sid-1".to_string(), request(), null_sink())
            .await
            .unwrap();
        manager
            .clone()
            .initialize("sid-2".to_string(), request(), null_sink())
            .await
            .unwrap();

        let connections = manager.connections.lock().await;
        assert_eq!(connections.len(), 1, "both sessions should share one connection");

        let global = connections
            .get(GLOBAL_CONNECTION_ID)
            .expect("the shared connection should be keyed by the global connection id");
        assert_eq!(global.meta.lock().await.session_ids.len(), 2);

        let session_to_connection = manager.session_to_connection.lock().await;
        assert_eq!(session_to_connection.get("sid-1").map(String::as_str), Some(GLOBAL_CONNECTION_ID));
        assert_eq!(session_to_connection.get("sid-2").map(String::as_str), Some(GLOBAL_CONNECTION_ID));
    }

    #[tokio::test]
    async fn resolve_session_id_mints_uuid_when_absent() {
        let manager = SessionManager::new(ManagerConfig::default());
        let a = manager.resolve_session_id(None);
        let b = manager.resolve_session_id(None);
        assert_ne!(a, b);
        assert_eq!(manager.resolve_session_id(Some("fixed".to_string())), "fixed");
    }

    #[tokio::test]
    async fn dispatch_without_session_header_is_missing_session() {
        let manager = SessionManager::new(ManagerConfig::default());
        let request = Envelope::request(serde_json::json!(1), "tools/list", None);
        let err = manager.dispatch_request(None, request).await.unwrap_err();
        assert!(matches!(err, ProxyError::MissingSession));
    }

    #[tokio::test]
    async fn dispatch_with_unknown_session_is_session_not_found() {
        let manager = SessionManager::new(ManagerConfig::default());
        let request = Envelope::request(serde_json::json!(9), "tools/list", None);
        let err = manager
            .dispatch_request(Some("deadbeef".to_string()), request)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::SessionNotFound));
    }
}
