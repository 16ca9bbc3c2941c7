mod handler;

pub use handler::{RemoteRoute, TunnelHandler};

use crate::config::{ServerAuth, ServerConfig};
use crate::error::{Result, TunnelError};
use russh::client::{self, AuthResult, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, Disconnect};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A live SSH session shared by every forward bound to the same server.
/// Forwards only ever borrow an `Arc<Session>` from the pool; the pool owns
/// it and decides when to evict it.
pub struct Session {
    handle: Mutex<client::Handle<TunnelHandler>>,
    handler: TunnelHandler,
    failed: AtomicBool,
}

impl Session {
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Channel<Msg>> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(TunnelError::Ssh)
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>> {
        let handle = self.handle.lock().await;
        handle.channel_open_session().await.map_err(TunnelError::Ssh)
    }

    pub async fn request_remote_listen(&self, bind_ip: &str, port: u16) -> Result<()> {
        let mut handle = self.handle.lock().await;
        handle
            .tcpip_forward(bind_ip, port as u32)
            .await
            .map_err(TunnelError::Ssh)?;
        Ok(())
    }

    pub async fn register_route(&self, port: u16, route: RemoteRoute) {
        self.handler.add_route(port, route).await;
    }

    pub async fn remove_route(&self, port: u16) {
        self.handler.remove_route(port).await;
    }

    async fn probe(&self) -> Result<()> {
        let mut channel = self.open_session_channel().await?;
        channel.eof().await.map_err(TunnelError::Ssh)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.failed.store(true, Ordering::Relaxed);
        let mut handle = self.handle.lock().await;
        let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
    }
}

/// Owns one [`Session`] per server name, dialing lazily and evicting on
/// keep-alive failure. `get` single-flights concurrent dials for the same
/// server behind a per-server lock.
pub struct SessionPool {
    servers: HashMap<String, ServerConfig>,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    dial_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionPool {
    pub fn new(servers: HashMap<String, ServerConfig>) -> Self {
        Self {
            servers,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            dial_locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        match self.sessions.read().await.get(name) {
            Some(session) => !session.is_failed(),
            None => false,
        }
    }

    pub async fn get(&self, server_name: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.cached(server_name).await {
            return Ok(session);
        }

        let lock = self.dial_lock(server_name).await;
        let _guard = lock.lock().await;

        if let Some(session) = self.cached(server_name).await {
            return Ok(session);
        }

        let server = self
            .servers
            .get(server_name)
            .ok_or_else(|| TunnelError::UnknownServer(server_name.to_string()))?
            .clone();

        let session = Self::dial(server_name, &server, self.sessions.clone()).await?;
        self.sessions
            .write()
            .await
            .insert(server_name.to_string(), session.clone());
        Ok(session)
    }

    pub async fn remove(&self, server_name: &str) {
        if let Some(session) = self.sessions.write().await.remove(server_name) {
            session.close().await;
        }
    }

    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.close().await;
        }
    }

    async fn cached(&self, server_name: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(server_name).cloned()?;
        if session.is_failed() {
            None
        } else {
            Some(session)
        }
    }

    async fn dial_lock(&self, server_name: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.dial_locks.read().await.get(server_name) {
            return lock.clone();
        }
        self.dial_locks
            .write()
            .await
            .entry(server_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn dial(
        server_name: &str,
        server: &ServerConfig,
        sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    ) -> Result<Arc<Session>> {
        tracing::info!(server = %server_name, host = %server.host, "dialing ssh session");

        let handler = TunnelHandler::new();
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..<client::Config as Default>::default()
        });

        let mut handle = tokio::time::timeout(
            DIAL_TIMEOUT,
            client::connect(config, (server.host.as_str(), server.port), handler.clone()),
        )
        .await
        .map_err(|_| TunnelError::SshConnect(server_name.to_string(), "dial timed out".into()))?
        .map_err(|e| TunnelError::SshConnect(server_name.to_string(), e.to_string()))?;

        match &server.auth {
            ServerAuth::Password(password) => {
                let result = handle
                    .authenticate_password(&server.user, password)
                    .await
                    .map_err(|e| TunnelError::SshAuth(server_name.to_string(), e.to_string()))?;
                if !matches!(result, AuthResult::Success) {
                    return Err(TunnelError::SshAuth(
                        server_name.to_string(),
                        "password rejected".into(),
                    ));
                }
            }
            ServerAuth::PrivateKey(path) => {
                let key_data = tokio::fs::read_to_string(path).await.map_err(|e| {
                    TunnelError::SshAuth(
                        server_name.to_string(),
                        format!("reading key {}: {e}", path.display()),
                    )
                })?;
                let key = PrivateKey::from_openssh(key_data.trim())
                    .map_err(|e| TunnelError::SshAuth(server_name.to_string(), e.to_string()))?;
                let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                let result = handle
                    .authenticate_publickey(&server.user, key_with_alg)
                    .await
                    .map_err(|e| TunnelError::SshAuth(server_name.to_string(), e.to_string()))?;
                if !matches!(result, AuthResult::Success) {
                    return Err(TunnelError::SshAuth(
                        server_name.to_string(),
                        "public key rejected".into(),
                    ));
                }
            }
        }

        tracing::info!(server = %server_name, "ssh session established");

        let session = Arc::new(Session {
            handle: Mutex::new(handle),
            handler,
            failed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&session);
        let keepalive_name = server_name.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    return;
                };
                if session.is_failed() {
                    return;
                }
                if let Err(e) = session.probe().await {
                    tracing::warn!(server = %keepalive_name, "keepalive failed, evicting: {e}");
                    let mut map = sessions.write().await;
                    if matches!(map.get(&keepalive_name), Some(current) if Arc::ptr_eq(current, &session))
                    {
                        map.remove(&keepalive_name);
                    }
                    drop(map);
                    session.close().await;
                    return;
                }
            }
        });

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAuth;

    fn server(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            host: format!("{name}.example.net"),
            port: 22,
            user: "tester".to_string(),
            auth: ServerAuth::Password("x".to_string()),
        }
    }

    fn pool_with(names: &[&str]) -> SessionPool {
        let servers = names.iter().map(|n| (n.to_string(), server(n))).collect();
        SessionPool::new(servers)
    }

    #[test]
    fn has_server_reflects_configured_servers() {
        let pool = pool_with(&["a", "b"]);
        assert!(pool.has_server("a"));
        assert!(!pool.has_server("c"));
    }

    #[tokio::test]
    async fn is_connected_false_before_any_dial() {
        let pool = pool_with(&["a"]);
        assert!(!pool.is_connected("a").await);
        assert!(!pool.is_connected("unknown").await);
    }

    #[tokio::test]
    async fn cached_returns_none_when_nothing_dialed() {
        let pool = pool_with(&["a"]);
        assert!(pool.cached("a").await.is_none());
    }

    #[tokio::test]
    async fn dial_lock_is_shared_across_calls_for_same_server() {
        let pool = pool_with(&["a", "b"]);
        let lock_a1 = pool.dial_lock("a").await;
        let lock_a2 = pool.dial_lock("a").await;
        let lock_b = pool.dial_lock("b").await;
        assert!(Arc::ptr_eq(&lock_a1, &lock_a2));
        assert!(!Arc::ptr_eq(&lock_a1, &lock_b));
    }

    #[tokio::test]
    async fn remove_on_empty_pool_is_a_noop() {
        let pool = pool_with(&["a"]);
        pool.remove("a").await;
        pool.close_all().await;
    }

    #[tokio::test]
    async fn get_fails_fast_for_unknown_server() {
        let pool = pool_with(&["a"]);
        let err = pool.get("does-not-exist").await.unwrap_err();
        assert!(matches!(err, TunnelError::UnknownServer(_)));
    }
}
