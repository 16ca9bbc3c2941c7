use crate::config::Config;
use crate::control::{ControlInterface, ForwardStatus, ServerStatus, Snapshot};
use crate::error::{Result, TunnelError};
use crate::forward::{Forward, ForwardSupervisor, StopSignal};
use crate::session::SessionPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

struct RunningForward {
    forward: Arc<Forward>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Top-level coordinator: owns the [`SessionPool`] and one supervisor task
/// per configured forward, and implements [`ControlInterface`] for the
/// tray/CLI collaborator.
pub struct Runtime {
    config: Config,
    pool: Arc<SessionPool>,
    running: Mutex<HashMap<String, RunningForward>>,
    global_shutdown: watch::Sender<bool>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let (global_shutdown, _) = watch::channel(false);
        let pool = Arc::new(SessionPool::new(config.servers.clone()));
        Self {
            config,
            pool,
            running: Mutex::new(HashMap::new()),
            global_shutdown,
        }
    }

    /// Spawns a supervisor for every configured forward that isn't already
    /// running.
    pub async fn start_all(&self) {
        let names: Vec<String> = self
            .config
            .forwards
            .iter()
            .map(|fc| fc.name.clone())
            .collect();
        for name in names {
            if let Err(e) = self.spawn_forward(&name).await {
                tracing::error!("failed to start forward {name}: {e}");
            }
        }
        tracing::info!("started {} forward supervisor(s)", self.running.lock().await.len());
    }

    async fn spawn_forward(&self, name: &str) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.contains_key(name) {
            return Ok(());
        }

        let fc = self
            .config
            .forwards
            .iter()
            .find(|fc| fc.name == name)
            .ok_or_else(|| TunnelError::ConfigValidation {
                section: name.to_string(),
                reason: "no such forward".to_string(),
            })?
            .clone();

        let forward = Arc::new(Forward::new(fc));
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = StopSignal::new(self.global_shutdown.subscribe(), stop_rx);
        let supervisor = ForwardSupervisor::new(forward.clone(), self.pool.clone(), stop);
        let task = tokio::spawn(supervisor.run());

        running.insert(
            name.to_string(),
            RunningForward {
                forward,
                stop_tx,
                task,
            },
        );
        Ok(())
    }

    async fn forward_status(forward: &Arc<Forward>) -> ForwardStatus {
        let fc = &forward.config;
        let endpoints = match forward.actual_local_port().await {
            Some(port) if fc.local_port == 0 => format!(
                "{}:{} (assigned {}) <-> {}:{}",
                fc.local_ip, fc.local_port, port, fc.remote_ip, fc.remote_port
            ),
            _ => format!(
                "{}:{} <-> {}:{}",
                fc.local_ip, fc.local_port, fc.remote_ip, fc.remote_port
            ),
        };

        ForwardStatus {
            name: fc.name.clone(),
            server: fc.server_name.clone(),
            direction: fc.direction.as_str().to_string(),
            endpoints,
            state: forward.state().await.as_str().to_string(),
            last_error: forward.last_error().await,
        }
    }
}

#[async_trait::async_trait]
impl ControlInterface for Runtime {
    async fn start(&self) -> Result<()> {
        self.start_all().await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.global_shutdown.send(true);
        let running: Vec<RunningForward> = self.running.lock().await.drain().map(|(_, v)| v).collect();

        let wait_all = async {
            for entry in running {
                let _ = entry.task.await;
            }
        };

        if tokio::time::timeout(SHUTDOWN_DEADLINE, wait_all).await.is_err() {
            tracing::warn!("graceful shutdown deadline exceeded; forcing session teardown");
        }

        self.pool.close_all().await;
        Ok(())
    }

    async fn list_servers(&self) -> Vec<ServerStatus> {
        let mut out = Vec::new();
        for name in self.config.servers.keys() {
            out.push(ServerStatus {
                name: name.clone(),
                connected: self.pool.is_connected(name).await,
            });
        }
        out
    }

    async fn list_forwards(&self) -> Vec<ForwardStatus> {
        let running = self.running.lock().await;
        let mut out = Vec::with_capacity(running.len());
        for entry in running.values() {
            out.push(Self::forward_status(&entry.forward).await);
        }
        out
    }

    async fn start_forward(&self, name: &str) -> Result<()> {
        self.spawn_forward(name).await
    }

    async fn stop_forward(&self, name: &str) -> Result<()> {
        let entry = self.running.lock().await.remove(name);
        let Some(entry) = entry else {
            return Err(TunnelError::ConfigValidation {
                section: name.to_string(),
                reason: "forward is not running".to_string(),
            });
        };

        let _ = entry.stop_tx.send(true);
        if tokio::time::timeout(SHUTDOWN_DEADLINE, entry.task).await.is_err() {
            tracing::warn!("forward {name} did not stop within the shutdown deadline");
        }
        Ok(())
    }

    async fn restart_forward(&self, name: &str) -> Result<()> {
        if self.running.lock().await.contains_key(name) {
            self.stop_forward(name).await?;
        }
        self.spawn_forward(name).await
    }

    async fn snapshot(&self) -> Snapshot {
        Snapshot {
            servers: self.list_servers().await,
            forwards: self.list_forwards().await,
        }
    }
}
