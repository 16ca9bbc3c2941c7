use crate::config::{Direction, ForwardConfig};
use crate::error::{Result, TunnelError};
use crate::session::{RemoteRoute, Session, SessionPool};
use crate::socks5::{ClientSide, LocalDialer, Socks5Negotiator, SshChannelDialer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::Instrument;

const SUPERVISOR_BACKOFF: Duration = Duration::from_secs(30);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const REMOTE_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Idle,
    Starting,
    Running,
    Failing,
    Stopped,
}

impl ForwardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardState::Idle => "idle",
            ForwardState::Starting => "starting",
            ForwardState::Running => "running",
            ForwardState::Failing => "failing",
            ForwardState::Stopped => "stopped",
        }
    }
}

/// Runtime instance of a [`ForwardConfig`]. Owned exclusively by one
/// [`super::forward::ForwardSupervisor`]; the control interface only reads
/// its state through the shared fields below.
pub struct Forward {
    pub config: ForwardConfig,
    state: RwLock<ForwardState>,
    last_error: RwLock<Option<String>>,
    actual_local_port: RwLock<Option<u16>>,
}

impl Forward {
    pub fn new(config: ForwardConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ForwardState::Idle),
            last_error: RwLock::new(None),
            actual_local_port: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> ForwardState {
        *self.state.read().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub async fn actual_local_port(&self) -> Option<u16> {
        *self.actual_local_port.read().await
    }

    async fn set_state(&self, state: ForwardState) {
        *self.state.write().await = state;
    }

    async fn set_error(&self, err: impl ToString) {
        *self.last_error.write().await = Some(err.to_string());
    }

    async fn set_actual_local_port(&self, port: u16) {
        *self.actual_local_port.write().await = Some(port);
    }
}

/// Signals a supervisor to stop: either the process-wide shutdown watch, or
/// a forward-specific one set by `stop_forward`.
#[derive(Clone)]
pub struct StopSignal {
    global: watch::Receiver<bool>,
    local: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new(global: watch::Receiver<bool>, local: watch::Receiver<bool>) -> Self {
        Self { global, local }
    }

    fn requested(&self) -> bool {
        *self.global.borrow() || *self.local.borrow()
    }

    /// Resolves once either channel reports a stop request (or its sender
    /// is dropped, which is treated the same as a stop request).
    async fn wait(&mut self) {
        if self.requested() {
            return;
        }
        loop {
            tokio::select! {
                res = self.global.changed() => {
                    if res.is_err() || *self.global.borrow() { return; }
                }
                res = self.local.changed() => {
                    if res.is_err() || *self.local.borrow() { return; }
                }
            }
        }
    }
}

/// Drives one [`Forward`] through its supervise loop: obtain a session,
/// run the direction-specific listener, and back off on failure.
pub struct ForwardSupervisor {
    forward: Arc<Forward>,
    pool: Arc<SessionPool>,
    stop: StopSignal,
}

impl ForwardSupervisor {
    pub fn new(forward: Arc<Forward>, pool: Arc<SessionPool>, stop: StopSignal) -> Self {
        Self { forward, pool, stop }
    }

    pub async fn run(mut self) {
        loop {
            if self.stop.requested() {
                self.forward.set_state(ForwardState::Stopped).await;
                return;
            }

            self.forward.set_state(ForwardState::Starting).await;

            if !self.pool.has_server(&self.forward.config.server_name) {
                self.forward
                    .set_error(format!(
                        "forward {} references unknown server {}",
                        self.forward.config.name, self.forward.config.server_name
                    ))
                    .await;
                self.forward.set_state(ForwardState::Idle).await;
                if self.wait_or_stop(SUPERVISOR_BACKOFF).await {
                    self.forward.set_state(ForwardState::Stopped).await;
                    return;
                }
                continue;
            }

            let session = match self.pool.get(&self.forward.config.server_name).await {
                Ok(session) => session,
                Err(e) => {
                    self.forward.set_error(&e).await;
                    self.forward.set_state(ForwardState::Failing).await;
                    if self.wait_or_stop(SUPERVISOR_BACKOFF).await {
                        self.forward.set_state(ForwardState::Stopped).await;
                        return;
                    }
                    self.forward.set_state(ForwardState::Idle).await;
                    continue;
                }
            };

            self.forward.set_state(ForwardState::Running).await;
            let span = tracing::info_span!(
                "forward",
                name = %self.forward.config.name,
                server = %self.forward.config.server_name
            );
            let result = self.run_once(session.clone()).instrument(span).await;

            match result {
                Ok(()) => {
                    self.forward.set_state(ForwardState::Stopped).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(forward = %self.forward.config.name, "forward failed: {e}");
                    self.forward.set_error(&e).await;
                    self.forward.set_state(ForwardState::Failing).await;
                    self.pool.remove(&self.forward.config.server_name).await;
                    if self.wait_or_stop(SUPERVISOR_BACKOFF).await {
                        self.forward.set_state(ForwardState::Stopped).await;
                        return;
                    }
                    self.forward.set_state(ForwardState::Idle).await;
                }
            }
        }
    }

    /// Waits out `dur` unless a stop is requested first; returns whether a
    /// stop was requested.
    async fn wait_or_stop(&mut self, dur: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => false,
            _ = self.stop.wait() => true,
        }
    }

    async fn run_once(&mut self, session: Arc<Session>) -> Result<()> {
        match self.forward.config.direction {
            Direction::Local => self.run_local(session).await,
            Direction::Remote => self.run_remote(session).await,
            Direction::Socks5 => self.run_socks5(session).await,
            Direction::ReverseSocks5 => self.run_reverse_socks5(session).await,
        }
    }

    async fn run_local(&mut self, session: Arc<Session>) -> Result<()> {
        let fc = self.forward.config.clone();
        let bind_addr = format!("{}:{}", fc.local_ip, fc.local_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TunnelError::ListenerBind(bind_addr.clone(), e.to_string()))?;
        let actual_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(fc.local_port);
        self.forward.set_actual_local_port(actual_port).await;
        tracing::info!("listening on {bind_addr}");

        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = health.tick() => {
                    if session.is_failed() {
                        return Err(TunnelError::SessionUnavailable(fc.server_name.clone()));
                    }
                }
                _ = self.stop.wait() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted
                        .map_err(|e| TunnelError::ListenerBind(bind_addr.clone(), e.to_string()))?;
                    let remote_ip = fc.remote_ip.clone();
                    let remote_port = fc.remote_port;
                    let session = session.clone();
                    tokio::spawn(async move {
                        let channel = match session.open_direct_tcpip(&remote_ip, remote_port).await {
                            Ok(c) => c,
                            Err(e) => {
                                tracing::debug!(%peer, "direct-tcpip open failed: {e}");
                                return;
                            }
                        };
                        if let Err(e) = crate::copier::splice_tcp_channel(stream, channel).await {
                            tracing::debug!(%peer, "local forward copy ended: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn run_socks5(&mut self, session: Arc<Session>) -> Result<()> {
        let fc = self.forward.config.clone();
        let bind_addr = format!("{}:{}", fc.local_ip, fc.local_port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TunnelError::ListenerBind(bind_addr.clone(), e.to_string()))?;
        let actual_port = listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(fc.local_port);
        self.forward.set_actual_local_port(actual_port).await;
        tracing::info!("socks5 proxy listening on {bind_addr}");

        let dialer = Arc::new(SshChannelDialer::new(session.clone()));

        let mut health = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = health.tick() => {
                    if session.is_failed() {
                        return Err(TunnelError::SessionUnavailable(fc.server_name.clone()));
                    }
                }
                _ = self.stop.wait() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted
                        .map_err(|e| TunnelError::ListenerBind(bind_addr.clone(), e.to_string()))?;
                    let negotiator = Socks5Negotiator::new(fc.socks5_user.clone(), fc.socks5_pass.clone());
                    let dialer = dialer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = negotiator.serve(ClientSide::Tcp(stream), dialer.as_ref()).await {
                            tracing::debug!(%peer, "socks5 session ended: {e}");
                        }
                    });
                }
            }
        }
    }

    async fn run_remote(&mut self, session: Arc<Session>) -> Result<()> {
        let fc = &self.forward.config;
        session
            .request_remote_listen(&fc.remote_ip, fc.remote_port)
            .await?;
        session
            .register_route(
                fc.remote_port,
                RemoteRoute::Plain {
                    local_ip: fc.local_ip.clone(),
                    local_port: fc.local_port,
                },
            )
            .await;
        tracing::info!(
            "remote forward active on server {}:{}",
            fc.remote_ip,
            fc.remote_port
        );

        let result = self.monitor_session(&session).await;
        session.remove_route(fc.remote_port).await;
        result
    }

    async fn run_reverse_socks5(&mut self, session: Arc<Session>) -> Result<()> {
        let fc = &self.forward.config;
        session
            .request_remote_listen(&fc.remote_ip, fc.remote_port)
            .await?;
        session
            .register_route(
                fc.remote_port,
                RemoteRoute::ReverseSocks5 {
                    socks5_user: fc.socks5_user.clone(),
                    socks5_pass: fc.socks5_pass.clone(),
                },
            )
            .await;
        tracing::info!(
            "reverse-socks5 proxy active on server {}:{}",
            fc.remote_ip,
            fc.remote_port
        );

        let result = self.monitor_session(&session).await;
        session.remove_route(fc.remote_port).await;
        result
    }

    async fn monitor_session(&mut self, session: &Arc<Session>) -> Result<()> {
        let mut ticker = tokio::time::interval(REMOTE_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if session.is_failed() {
                        return Err(TunnelError::SessionUnavailable(
                            self.forward.config.server_name.clone(),
                        ));
                    }
                }
                _ = self.stop.wait() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_config(name: &str) -> ForwardConfig {
        ForwardConfig {
            name: name.to_string(),
            server_name: "edge1".to_string(),
            direction: Direction::Local,
            local_ip: "127.0.0.1".to_string(),
            local_port: 0,
            remote_ip: "127.0.0.1".to_string(),
            remote_port: 80,
            socks5_user: None,
            socks5_pass: None,
        }
    }

    #[test]
    fn forward_state_as_str_matches_every_variant() {
        assert_eq!(ForwardState::Idle.as_str(), "idle");
        assert_eq!(ForwardState::Starting.as_str(), "starting");
        assert_eq!(ForwardState::Running.as_str(), "running");
        assert_eq!(ForwardState::Failing.as_str(), "failing");
        assert_eq!(ForwardState::Stopped.as_str(), "stopped");
    }

    #[tokio::test]
    async fn new_forward_starts_idle_with_no_error_or_port() {
        let forward = Forward::new(forward_config("web"));
        assert_eq!(forward.state().await, ForwardState::Idle);
        assert_eq!(forward.last_error().await, None);
        assert_eq!(forward.actual_local_port().await, None);
    }

    #[tokio::test]
    async fn forward_records_state_error_and_actual_port_transitions() {
        let forward = Forward::new(forward_config("web"));

        forward.set_state(ForwardState::Starting).await;
        assert_eq!(forward.state().await, ForwardState::Starting);

        forward.set_error("server unreachable").await;
        assert_eq!(
            forward.last_error().await,
            Some("server unreachable".to_string())
        );

        forward.set_actual_local_port(18080).await;
        assert_eq!(forward.actual_local_port().await, Some(18080));

        forward.set_state(ForwardState::Running).await;
        assert_eq!(forward.state().await, ForwardState::Running);
    }

    #[tokio::test]
    async fn stop_signal_resolves_on_global_trigger() {
        let (global_tx, global_rx) = watch::channel(false);
        let (_local_tx, local_rx) = watch::channel(false);
        let mut stop = StopSignal::new(global_rx, local_rx);

        assert!(!stop.requested());
        global_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), stop.wait())
            .await
            .expect("stop signal should resolve once the global watch fires");
        assert!(stop.requested());
    }

    #[tokio::test]
    async fn stop_signal_resolves_on_local_trigger() {
        let (_global_tx, global_rx) = watch::channel(false);
        let (local_tx, local_rx) = watch::channel(false);
        let mut stop = StopSignal::new(global_rx, local_rx);

        local_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), stop.wait())
            .await
            .expect("stop signal should resolve once the local watch fires");
    }

    #[tokio::test]
    async fn stop_signal_resolves_when_sender_dropped() {
        let (global_tx, global_rx) = watch::channel(false);
        let (local_tx, local_rx) = watch::channel(false);
        let mut stop = StopSignal::new(global_rx, local_rx);

        drop(global_tx);
        drop(local_tx);
        tokio::time::timeout(Duration::from_secs(1), stop.wait())
            .await
            .expect("stop signal should resolve once its senders are dropped");
    }
}

