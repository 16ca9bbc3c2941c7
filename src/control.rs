use crate::error::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardStatus {
    pub name: String,
    pub server: String,
    pub direction: String,
    pub endpoints: String,
    pub state: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub servers: Vec<ServerStatus>,
    pub forwards: Vec<ForwardStatus>,
}

/// The boundary the tray/CLI collaborator drives the daemon through. Never
/// exposes session or channel internals, only status and start/stop.
#[async_trait::async_trait]
pub trait ControlInterface: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn list_servers(&self) -> Vec<ServerStatus>;
    async fn list_forwards(&self) -> Vec<ForwardStatus>;
    async fn start_forward(&self, name: &str) -> Result<()>;
    async fn stop_forward(&self, name: &str) -> Result<()>;
    /// Stops then starts a single forward's supervisor. Never mutates a
    /// running forward's configuration in place.
    async fn restart_forward(&self, name: &str) -> Result<()>;
    async fn snapshot(&self) -> Snapshot;
}
