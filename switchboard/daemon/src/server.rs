//! Daemon Server Implementation
//!
//! This module provides the server loop for the switchboard daemon:
//! - Accepts connections on a Unix socket (owner-only, same-UID peers)
//! - Spawns a handler task per connection
//! - Answers each framed [`DaemonRequest`] with one [`DaemonResponse`]
//! - Supports graceful shutdown and config reload
//!
//! ```text
//!      CLI / dashboard      worker          worker
//!         (conn-1)         (conn-2)        (conn-3)
//!             │                │               │
//!             └────────────────┼───────────────┘
//!                              │
//!                        DaemonServer
//!                              │
//!                       AiServiceManager
//! ```

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use switchboard_core::protocol::{
    read_message, write_message, DaemonRequest, DaemonResponse, FrameDecoder,
};
use switchboard_core::{default_config_path, load_config_from_path, AiServiceManager};

/// Identifier of one accepted connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct ConnectionState {
    connected_at: Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    socket_path: PathBuf,
    /// Explicit config file; the default location is used when absent
    config_path: Option<PathBuf>,
    service: Arc<AiServiceManager>,
    server_config: ServerConfig,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    pub fn new(
        socket_path: PathBuf,
        config_path: Option<PathBuf>,
        service: Arc<AiServiceManager>,
    ) -> Self {
        Self {
            socket_path,
            config_path,
            service,
            server_config: ServerConfig::default(),
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Get peer credentials from Unix socket
    #[cfg(unix)]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Accept connections until `shutdown` is set
    pub async fn run(
        &mut self,
        shutdown: Arc<AtomicBool>,
        reload_config: Arc<AtomicBool>,
    ) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        info!(path = ?self.socket_path, "Listening for connections");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            if reload_config.swap(false, Ordering::SeqCst) {
                self.reload_config();
            }

            // Accept with timeout to allow checking the flags
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);

            let our_uid = unsafe { libc::getuid() };
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = ConnectionId::new();
            info!(
                conn_id = %conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            // Handler starts only once its state is tracked
            let (registered_tx, registered_rx) = oneshot::channel();
            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    registered_rx,
                    Arc::clone(&self.service),
                    Arc::clone(&self.connection_states),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            let _ = registered_tx.send(());
        }

        self.shutdown().await
    }

    /// Serve one client: read a request, answer it, repeat until EOF
    async fn handle_connection(
        conn_id: ConnectionId,
        mut stream: UnixStream,
        registered: oneshot::Receiver<()>,
        service: Arc<AiServiceManager>,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    ) {
        if registered.await.is_err() {
            return;
        }
        debug!("Connection handler started");
        let mut decoder = FrameDecoder::new();

        loop {
            let request = match read_message::<_, DaemonRequest>(&mut stream, &mut decoder).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    info!("Client disconnected (EOF)");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to decode request frame");
                    let reply = DaemonResponse::Error {
                        message: e.to_string(),
                    };
                    if let Err(e) = write_message(&mut stream, &reply).await {
                        debug!(error = %e, "Could not report decode failure");
                    }
                    break;
                }
            };

            let response = handle_request(&service, request).await;
            if let Err(e) = write_message(&mut stream, &response).await {
                error!(error = %e, "Write error");
                break;
            }
        }

        connection_states.remove(&conn_id);
        info!(
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Re-read the config file and apply its thresholds and timeouts
    ///
    /// A bad file is logged and the running configuration is kept.
    fn reload_config(&self) {
        let path = self.config_path.clone().or_else(default_config_path);
        info!(path = ?path, "Reloading configuration");

        let result = load_config_from_path(path)
            .map_err(anyhow::Error::from)
            .and_then(|config| self.service.reload(&config).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!(error = %e, "Config reload failed, keeping current configuration");
        }
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id = %conn_id,
                    peer_uid = ?conn_state.peer_uid,
                    uptime_secs = conn_state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                conn_state.abort_handle.abort();
            }
        }

        // Give aborted handlers a moment to unwind
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}

/// Answer one request against the service
pub async fn handle_request(service: &AiServiceManager, request: DaemonRequest) -> DaemonResponse {
    match request {
        DaemonRequest::Dispatch { request } => {
            let request_id = request.request_id.clone();
            match service
                .dispatch(request)
                .instrument(tracing::debug_span!("dispatch", %request_id))
                .await
            {
                Ok(response) => DaemonResponse::Dispatched { response },
                Err(e) => DaemonResponse::from(&e),
            }
        }
        DaemonRequest::Statistics => DaemonResponse::Statistics {
            statistics: service.statistics(),
        },
        DaemonRequest::ActiveAlerts => DaemonResponse::Alerts {
            alerts: service.active_alerts(),
        },
        DaemonRequest::DismissAlert { id } => DaemonResponse::Dismissed {
            found: service.dismiss_alert(id),
        },
        DaemonRequest::UpdateConfig { update } => match service.update_config(&update) {
            Ok(()) => DaemonResponse::Ok,
            Err(e) => DaemonResponse::Error {
                message: e.to_string(),
            },
        },
        DaemonRequest::CheckAlerts => DaemonResponse::AlertChanges {
            changes: service.check_alerts(),
        },
        DaemonRequest::OverrideProvider { provider, patch } => DaemonResponse::Profile {
            profile: service.override_provider(provider, &patch),
        },
        DaemonRequest::Metrics => DaemonResponse::Metrics {
            text: service.metrics_prometheus(),
        },
        DaemonRequest::Ping => DaemonResponse::Pong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use switchboard_core::protocol::call;
    use switchboard_core::routing::test_utils::{ScriptedOutcome, ScriptedProvider};
    use switchboard_core::{
        AlertConfigUpdate, ChatRequest, ConfigUpdate, ErrorClass, ProviderId, ProviderOverride,
        SwitchboardConfig, SystemClock,
    };

    fn service(client: &ScriptedProvider) -> Arc<AiServiceManager> {
        Arc::new(
            AiServiceManager::new(
                &SwitchboardConfig::default(),
                Arc::new(client.clone()),
                SystemClock::shared(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new();
        let formatted = format!("{id}");
        assert!(formatted.starts_with("conn-"));
        // conn- (5 chars) + UUID (36 chars)
        assert_eq!(formatted.len(), 41);
        assert_ne!(ConnectionId::new(), id);
    }

    #[tokio::test]
    async fn test_dispatch_request() {
        let client = ScriptedProvider::new();
        client.push(ProviderId::OpenAi, ScriptedOutcome::Fail(ErrorClass::Network));
        let service = service(&client);

        let response = handle_request(
            &service,
            DaemonRequest::Dispatch {
                request: ChatRequest::user("hello"),
            },
        )
        .await;

        match response {
            DaemonResponse::Dispatched { response } => {
                assert_eq!(response.provider, ProviderId::Anthropic);
                assert_eq!(response.content, "reply from anthropic");
                assert!(!response.cached);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_dispatch_reports_class() {
        let client = ScriptedProvider::new();
        let service = service(&client);

        let response = handle_request(
            &service,
            DaemonRequest::Dispatch {
                request: ChatRequest::new(vec![]),
            },
        )
        .await;

        match response {
            DaemonResponse::DispatchFailed {
                class, retryable, ..
            } => {
                assert_eq!(class, ErrorClass::Validation);
                assert!(!retryable);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_admin_requests() {
        let client = ScriptedProvider::new();
        let service = service(&client);

        assert_eq!(
            handle_request(&service, DaemonRequest::Ping).await,
            DaemonResponse::Pong
        );
        assert_eq!(
            handle_request(&service, DaemonRequest::DismissAlert { id: Uuid::nil() }).await,
            DaemonResponse::Dismissed { found: false }
        );
        assert_eq!(
            handle_request(&service, DaemonRequest::CheckAlerts).await,
            DaemonResponse::AlertChanges { changes: vec![] }
        );

        let bad = ConfigUpdate {
            alerts: Some(AlertConfigUpdate {
                warning_threshold: Some(0.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            handle_request(&service, DaemonRequest::UpdateConfig { update: bad }).await,
            DaemonResponse::Error { .. }
        ));

        let patch = ProviderOverride {
            priority: Some(9),
            ..Default::default()
        };
        match handle_request(
            &service,
            DaemonRequest::OverrideProvider {
                provider: ProviderId::Groq,
                patch,
            },
        )
        .await
        {
            DaemonResponse::Profile { profile } => {
                assert_eq!(profile.id, ProviderId::Groq);
                assert_eq!(profile.priority, 9);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        match handle_request(&service, DaemonRequest::Metrics).await {
            DaemonResponse::Metrics { text } => {
                assert!(text.contains("switchboard_dispatches_total 0"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serves_requests_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("run").join("switchboard.sock");
        let client = ScriptedProvider::new();

        let shutdown = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        let mut server = DaemonServer::new(socket_path.clone(), None, service(&client));
        let server_task = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { server.run(shutdown, reload).await })
        };

        for _ in 0..200 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&socket_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert_eq!(
            call(&socket_path, &DaemonRequest::Ping).await.unwrap(),
            DaemonResponse::Pong
        );

        let request = DaemonRequest::Dispatch {
            request: ChatRequest::user("over the socket"),
        };
        match call(&socket_path, &request).await.unwrap() {
            DaemonResponse::Dispatched { response } => {
                assert_eq!(response.provider, ProviderId::OpenAi);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        match call(&socket_path, &DaemonRequest::Statistics).await.unwrap() {
            DaemonResponse::Statistics { statistics } => {
                assert_eq!(statistics.dispatches, 1);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        shutdown.store(true, Ordering::SeqCst);
        server_task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_short_lived_connections_leave_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("switchboard.sock");
        let client = ScriptedProvider::new();

        let shutdown = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        let mut server = DaemonServer::new(socket_path.clone(), None, service(&client));
        let states = Arc::clone(&server.connection_states);
        let server_task = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { server.run(shutdown, reload).await })
        };

        for _ in 0..200 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Connect and hang up immediately, many times over
        for _ in 0..50 {
            drop(UnixStream::connect(&socket_path).await.unwrap());
        }
        assert_eq!(
            call(&socket_path, &DaemonRequest::Ping).await.unwrap(),
            DaemonResponse::Pong
        );

        for _ in 0..200 {
            if states.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(states.len(), 0);

        shutdown.store(true, Ordering::SeqCst);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("switchboard.sock");
        fs::write(&socket_path, b"stale").unwrap();

        let client = ScriptedProvider::new();
        let server = DaemonServer::new(socket_path.clone(), None, service(&client));
        server.prepare_socket().unwrap();
        assert!(!socket_path.exists());
        assert_eq!(server.connection_count(), 0);
    }
}
