use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::RwLock;

/// Where a forwarded-tcpip connection delivered by the server should go,
/// keyed by the server-side port the client asked the server to listen on.
#[derive(Clone)]
pub enum RemoteRoute {
    /// Plain `remote` forward: dial a local address and splice.
    Plain { local_ip: String, local_port: u16 },
    /// `reverse-socks5` forward: run a SOCKS5 negotiation over the channel,
    /// dialing its targets from the local network stack.
    ReverseSocks5 {
        socks5_user: Option<String>,
        socks5_pass: Option<String>,
    },
}

/// `russh::client::Handler` shared by every forward bound to one session.
/// Host key verification is intentionally disabled (see DESIGN.md); the
/// handler's only other job is dispatching `forwarded-tcpip` channels opened
/// by the server to the route registered for that port.
#[derive(Clone)]
pub struct TunnelHandler {
    routes: Arc<RwLock<HashMap<u16, RemoteRoute>>>,
}

impl TunnelHandler {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add_route(&self, port: u16, route: RemoteRoute) {
        self.routes.write().await.insert(port, route);
    }

    pub async fn remove_route(&self, port: u16) {
        self.routes.write().await.remove(&port);
    }
}

impl Default for TunnelHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        async move {
            tracing::warn!("host key verification is disabled; accepting server key as-is");
            Ok(true)
        }
    }

    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        let routes = self.routes.clone();
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();

        async move {
            tracing::debug!(
                "forwarded-tcpip: {}:{} -> {}:{}",
                originator_address,
                originator_port,
                connected_address,
                connected_port
            );

            let route = routes.read().await.get(&(connected_port as u16)).cloned();

            match route {
                Some(RemoteRoute::Plain {
                    local_ip,
                    local_port,
                }) => {
                    let addr = format!("{local_ip}:{local_port}");
                    match TcpStream::connect(&addr).await {
                        Ok(stream) => {
                            tokio::spawn(async move {
                                if let Err(e) = crate::copier::splice_tcp_channel(stream, channel).await
                                {
                                    tracing::debug!("remote forward copy ended: {e}");
                                }
                            });
                            Ok(())
                        }
                        Err(e) => {
                            tracing::warn!("remote forward dial to {addr} failed: {e}");
                            Ok(())
                        }
                    }
                }
                Some(RemoteRoute::ReverseSocks5 {
                    socks5_user,
                    socks5_pass,
                }) => {
                    tokio::spawn(async move {
                        let negotiator = crate::socks5::Socks5Negotiator::new(socks5_user, socks5_pass);
                        let dialer = crate::socks5::LocalDialer::new(std::time::Duration::from_secs(30));
                        if let Err(e) = negotiator
                            .serve(crate::socks5::ClientSide::Channel(channel), &dialer)
                            .await
                        {
                            tracing::debug!("reverse-socks5 session ended: {e}");
                        }
                    });
                    Ok(())
                }
                None => {
                    tracing::warn!("no route registered for forwarded port {connected_port}");
                    Ok(())
                }
            }
        }
    }
}
