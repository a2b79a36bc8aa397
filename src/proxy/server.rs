//! Proxy lifecycle.
//!
//! [`ProxyController`] owns everything that outlives a single listener: the
//! certificate authority, the interception queue, the traffic recorder and
//! the upstream TLS connectors. Starting binds a listener and spawns the
//! accept loop; stopping abandons paused transactions, signals shutdown, and
//! waits for connections to drain.
//!
//! # State Machine
//!
//! ```text
//! stopped ──start──► starting ──bind ok──► listening
//!    ▲                  │                     │
//!    └────bind failed───┘                   stop
//!    ▲                                        │
//!    └───────drained or grace expired──── stopping
//! ```
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), intercept_proxy::proxy::ProxyError> {
//! use intercept_proxy::ca::CertificateAuthority;
//! use intercept_proxy::control::EventSink;
//! use intercept_proxy::proxy::{ProxyConfig, ProxyController};
//! use std::sync::Arc;
//!
//! let controller = ProxyController::new(Arc::new(CertificateAuthority::new()), EventSink::null());
//! let addr = controller
//!     .start(ProxyConfig {
//!         port: 0,
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("listening on {}", addr);
//!
//! controller.stop().await;
//! # Ok(())
//! # }
//! ```

use super::config::ProxyConfig;
use super::connect::{handle_connection, shutdown_signal};
use super::error::ProxyError;
use super::forward::ConnectionState;
use super::intercept::{InterceptError, InterceptionQueue};
use super::message::EditedPayload;
use super::recorder::TrafficRecorder;
use super::tls::UpstreamConnectors;
use crate::ca::CertificateAuthority;
use crate::control::{EventSink, ProxyEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    /// No listener.
    Stopped,
    /// Binding.
    Starting,
    /// Accepting connections.
    Listening,
    /// Draining connections.
    Stopping,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Stopped => "stopped",
            ProxyState::Starting => "starting",
            ProxyState::Listening => "listening",
            ProxyState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Long-lived components shared by every connection.
pub(crate) struct Services {
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) queue: Arc<InterceptionQueue>,
    pub(crate) recorder: Arc<TrafficRecorder>,
    pub(crate) connectors: UpstreamConnectors,
}

impl Services {
    pub(crate) fn new(
        ca: Arc<CertificateAuthority>,
        events: EventSink,
        record_capacity: usize,
    ) -> Self {
        Self {
            ca,
            queue: Arc::new(InterceptionQueue::new(events.clone())),
            recorder: Arc::new(TrafficRecorder::new(record_capacity, events)),
            connectors: UpstreamConnectors::new(),
        }
    }
}

struct RunningServer {
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Starts, stops and reconfigures the proxy.
pub struct ProxyController {
    services: Arc<Services>,
    events: EventSink,
    state_tx: watch::Sender<ProxyState>,
    config_tx: watch::Sender<Arc<ProxyConfig>>,
    running: Mutex<Option<RunningServer>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl ProxyController {
    /// Create a stopped controller.
    pub fn new(ca: Arc<CertificateAuthority>, events: EventSink) -> Self {
        let config = ProxyConfig::default();
        let services = Arc::new(Services::new(ca, events.clone(), config.record_capacity));
        let (state_tx, _) = watch::channel(ProxyState::Stopped);
        let (config_tx, _) = watch::channel(Arc::new(config));

        Self {
            services,
            events,
            state_tx,
            config_tx,
            running: Mutex::new(None),
            local_addr: std::sync::Mutex::new(None),
        }
    }

    /// Start listening with `config`, stopping a running instance first.
    ///
    /// Returns the bound address; `port: 0` picks an ephemeral port.
    pub async fn start(&self, config: ProxyConfig) -> Result<SocketAddr, ProxyError> {
        config.validate()?;

        let mut running = self.running.lock().await;
        if let Some(server) = running.take() {
            info!("Restarting proxy");
            self.shutdown(server).await;
        }

        self.set_state(ProxyState::Starting);

        let addr = config.listen_addr();
        let bound = match TcpListener::bind(addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                warn!("Failed to bind {}: {}", addr, source);
                self.set_state(ProxyState::Stopped);
                return Err(ProxyError::Bind { addr, source });
            }
        };

        self.services.recorder.set_capacity(config.record_capacity);
        self.config_tx.send_replace(Arc::new(config));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            local_addr,
            self.services.clone(),
            self.config_tx.subscribe(),
            shutdown_rx,
        ));

        *running = Some(RunningServer {
            shutdown_tx,
            accept_task,
            local_addr,
        });
        self.set_local_addr(Some(local_addr));

        info!("Proxy listening on {}", local_addr);
        self.set_state(ProxyState::Listening);
        Ok(local_addr)
    }

    /// Stop listening and drain connections. Succeeds when already stopped.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(server) => self.shutdown(server).await,
            None => debug!("Proxy already stopped"),
        }
    }

    /// Replace the configuration read by new connections.
    ///
    /// Existing connections keep the snapshot they were accepted with. The
    /// listen address only changes on the next start. A no-op when stopped.
    pub async fn update_config(&self, config: ProxyConfig) -> Result<(), ProxyError> {
        config.validate()?;

        let running = self.running.lock().await;
        let Some(server) = running.as_ref() else {
            debug!("Proxy not listening, ignoring configuration update");
            return Ok(());
        };

        if config.listen_addr() != server.local_addr && config.port != 0 {
            info!(
                "Listen address {} takes effect on next start",
                config.listen_addr()
            );
        }

        self.services.recorder.set_capacity(config.record_capacity);
        self.config_tx.send_replace(Arc::new(config));
        info!("Proxy configuration updated");
        Ok(())
    }

    /// Release a paused transaction, with edits if given.
    pub fn respond_to_intercepted_request(
        &self,
        id: Uuid,
        payload: Option<EditedPayload>,
    ) -> Result<(), InterceptError> {
        self.services.queue.release(id, payload)
    }

    /// Drop a paused transaction. Returns false if it was not pending.
    pub fn abandon(&self, id: Uuid) -> bool {
        self.services.queue.abandon(id)
    }

    /// Current state.
    pub fn state(&self) -> ProxyState {
        *self.state_tx.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ProxyState> {
        self.state_tx.subscribe()
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration snapshot handed to new connections.
    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config_tx.borrow().clone()
    }

    /// Traffic recorder.
    pub fn recorder(&self) -> &Arc<TrafficRecorder> {
        &self.services.recorder
    }

    /// Interception queue.
    pub fn queue(&self) -> &Arc<InterceptionQueue> {
        &self.services.queue
    }

    /// Certificate authority used for TLS termination.
    pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
        &self.services.ca
    }

    async fn shutdown(&self, server: RunningServer) {
        self.set_state(ProxyState::Stopping);
        info!("Stopping proxy on {}", server.local_addr);

        self.services.queue.abandon_all("proxy stopping");
        let _ = server.shutdown_tx.send(true);

        if let Err(e) = server.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        self.set_local_addr(None);
        self.set_state(ProxyState::Stopped);
        info!("Proxy stopped");
    }

    fn set_state(&self, state: ProxyState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Proxy state {} -> {}", previous, state);
            self.events.emit(ProxyEvent::ProxyState { state });
        }
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = addr;
    }
}

/// Accept connections until shutdown, then drain them.
async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    services: Arc<Services>,
    config_rx: watch::Receiver<Arc<ProxyConfig>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id;
                    next_id += 1;
                    trace!("Connection {} from {}", id, peer);

                    let config = config_rx.borrow().clone();
                    let state = ConnectionState::new(id, local_addr, config, services.clone());
                    let shutdown = shutdown_rx.clone();

                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, state, shutdown).await {
                            if e.is_disconnect() {
                                debug!("Connection {} ended: {}", id, e);
                            } else {
                                warn!("Connection {} error: {}", id, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_signal(&mut shutdown_rx) => break,
        }
    }

    drop(listener);

    if connections.is_empty() {
        return;
    }

    let grace = config_rx.borrow().drain_grace();
    info!("Draining {} connections", connections.len());

    let drained = timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "{} connections still open after {:?}, closing them",
            connections.len(),
            grace
        );
        connections.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::create_event_channel;

    fn ephemeral() -> ProxyConfig {
        ProxyConfig {
            port: 0,
            ..Default::default()
        }
    }

    fn controller() -> ProxyController {
        ProxyController::new(Arc::new(CertificateAuthority::new()), EventSink::null())
    }

    #[tokio::test]
    async fn test_start_reports_ephemeral_port() {
        let controller = controller();
        let addr = controller.start(ephemeral()).await.unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(controller.state(), ProxyState::Listening);
        assert_eq!(controller.local_addr(), Some(addr));

        controller.stop().await;
        assert_eq!(controller.state(), ProxyState::Stopped);
        assert_eq!(controller.local_addr(), None);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_succeeds() {
        let controller = controller();
        controller.stop().await;
        assert_eq!(controller.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let controller = controller();
        let result = controller
            .start(ProxyConfig {
                timeout_ms: 0,
                ..ephemeral()
            })
            .await;

        assert!(matches!(result, Err(ProxyError::Config(_))));
        assert_eq!(controller.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_stopped() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let controller = controller();
        let result = controller
            .start(ProxyConfig {
                port,
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(ProxyError::Bind { .. })));
        assert_eq!(controller.state(), ProxyState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_replaces_listener() {
        let controller = controller();
        controller.start(ephemeral()).await.unwrap();
        let second = controller.start(ephemeral()).await.unwrap();

        assert_eq!(controller.local_addr(), Some(second));
        assert_eq!(controller.state(), ProxyState::Listening);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_update_config_when_stopped_is_noop() {
        let controller = controller();
        controller
            .update_config(ProxyConfig {
                intercept_enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!controller.config().intercept_enabled);
    }

    #[tokio::test]
    async fn test_update_config_swaps_snapshot() {
        let controller = controller();
        controller.start(ephemeral()).await.unwrap();
        let before = controller.config();

        controller
            .update_config(ProxyConfig {
                intercept_enabled: true,
                record_capacity: 5,
                ..ephemeral()
            })
            .await
            .unwrap();

        assert!(!before.intercept_enabled);
        assert!(controller.config().intercept_enabled);
        assert_eq!(controller.recorder().capacity(), 5);

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_state_events_emitted() {
        let (events, mut rx) = create_event_channel();
        let controller = ProxyController::new(Arc::new(CertificateAuthority::new()), events);

        controller.start(ephemeral()).await.unwrap();
        controller.stop().await;

        let mut states = Vec::new();
        while let Ok(ProxyEvent::ProxyState { state }) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                ProxyState::Starting,
                ProxyState::Listening,
                ProxyState::Stopping,
                ProxyState::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_release_is_not_pending() {
        let controller = controller();
        let id = Uuid::new_v4();
        assert_eq!(
            controller.respond_to_intercepted_request(id, None),
            Err(InterceptError::NotPending(id))
        );
        assert!(!controller.abandon(id));
    }
}
