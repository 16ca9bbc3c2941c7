use crate::error::{Result, TunnelError};
use crate::session::Session;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_UPSTREAM_REFUSED: u8 = 0x05;
const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// The client-facing half of a SOCKS5 session: a plain TCP connection for
/// the `socks5` direction, or an SSH channel delivered via `forwarded-tcpip`
/// for the `reverse-socks5` direction.
pub enum ClientSide {
    Tcp(TcpStream),
    Channel(Channel<Msg>),
}

impl ClientSide {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            ClientSide::Tcp(stream) => {
                stream.read_exact(buf).await?;
                Ok(())
            }
            ClientSide::Channel(channel) => {
                let mut filled = 0;
                while filled < buf.len() {
                    match channel.wait().await {
                        Some(ChannelMsg::Data { ref data }) => {
                            // assumes no single SSH Data message spans more than one handshake field
                            let take = std::cmp::min(data.len(), buf.len() - filled);
                            buf[filled..filled + take].copy_from_slice(&data[..take]);
                            filled += take;
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            return Err(TunnelError::Socks5Protocol(
                                "channel closed during handshake".into(),
                            ));
                        }
                        Some(_) => {}
                    }
                }
                Ok(())
            }
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            ClientSide::Tcp(stream) => {
                stream.write_all(buf).await?;
                Ok(())
            }
            ClientSide::Channel(channel) => channel.data(buf).await.map_err(TunnelError::Ssh),
        }
    }
}

/// Where a CONNECT target gets dialed from.
pub enum UpstreamConn {
    Tcp(TcpStream),
    Channel(Channel<Msg>),
}

#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<UpstreamConn>;
}

/// Dials the CONNECT target through the shared SSH session (`socks5`
/// direction: the proxy's exit point is the server).
pub struct SshChannelDialer {
    session: Arc<Session>,
}

impl SshChannelDialer {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

#[async_trait::async_trait]
impl Dialer for SshChannelDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<UpstreamConn> {
        let channel = self.session.open_direct_tcpip(host, port).await?;
        Ok(UpstreamConn::Channel(channel))
    }
}

/// Dials the CONNECT target from the local network stack (`reverse-socks5`
/// direction: the proxy's exit point is the client).
pub struct LocalDialer {
    timeout: Duration,
}

impl LocalDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl Dialer for LocalDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<UpstreamConn> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TunnelError::Socks5Protocol(format!("dial to {addr} timed out")))?
            .map_err(|e| TunnelError::Socks5Protocol(format!("dial to {addr} failed: {e}")))?;
        Ok(UpstreamConn::Tcp(stream))
    }
}

/// A RFC 1928 / RFC 1929 SOCKS5 server: method negotiation, optional
/// username/password auth, and CONNECT-only request handling.
pub struct Socks5Negotiator {
    user: Option<String>,
    pass: Option<String>,
}

impl Socks5Negotiator {
    pub fn new(user: Option<String>, pass: Option<String>) -> Self {
        Self { user, pass }
    }

    pub async fn serve(&self, mut client: ClientSide, dialer: &dyn Dialer) -> Result<()> {
        self.negotiate_methods(&mut client).await?;

        if self.user.is_some() {
            self.authenticate(&mut client).await?;
        }

        let Some((host, port)) = self.read_request(&mut client).await? else {
            // Reply already sent for an unsupported CMD or ATYP.
            return Ok(());
        };

        match dialer.dial(&host, port).await {
            Ok(upstream) => {
                self.reply(&mut client, REPLY_SUCCESS).await?;
                Self::relay(client, upstream).await
            }
            Err(e) => {
                tracing::debug!("socks5 dial to {host}:{port} failed: {e}");
                self.reply(&mut client, REPLY_UPSTREAM_REFUSED).await?;
                Ok(())
            }
        }
    }

    async fn negotiate_methods(&self, client: &mut ClientSide) -> Result<()> {
        let mut header = [0u8; 2];
        client.read_exact(&mut header).await?;
        if header[0] != VERSION {
            return Err(TunnelError::Socks5Protocol(format!(
                "unsupported version {}",
                header[0]
            )));
        }

        let mut methods = vec![0u8; header[1] as usize];
        client.read_exact(&mut methods).await?;

        let wants_auth = self.user.is_some();
        let chosen = if wants_auth && methods.contains(&METHOD_USERPASS) {
            METHOD_USERPASS
        } else if !wants_auth && methods.contains(&METHOD_NONE) {
            METHOD_NONE
        } else {
            client.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
            return Err(TunnelError::Socks5Protocol(
                "no acceptable authentication method".into(),
            ));
        };

        client.write_all(&[VERSION, chosen]).await
    }

    async fn authenticate(&self, client: &mut ClientSide) -> Result<()> {
        let mut header = [0u8; 2];
        client.read_exact(&mut header).await?;
        let mut uname = vec![0u8; header[1] as usize];
        client.read_exact(&mut uname).await?;

        let mut plen = [0u8; 1];
        client.read_exact(&mut plen).await?;
        let mut passwd = vec![0u8; plen[0] as usize];
        client.read_exact(&mut passwd).await?;

        let ok = self.user.as_deref().map(str::as_bytes) == Some(&uname[..])
            && self.pass.as_deref().map(str::as_bytes) == Some(&passwd[..]);

        if ok {
            client.write_all(&[0x01, 0x00]).await
        } else {
            client.write_all(&[0x01, 0x01]).await?;
            Err(TunnelError::Socks5Protocol(
                "user/password authentication failed".into(),
            ))
        }
    }

    async fn read_request(&self, client: &mut ClientSide) -> Result<Option<(String, u16)>> {
        let mut header = [0u8; 4];
        client.read_exact(&mut header).await?;
        let (ver, cmd, atyp) = (header[0], header[1], header[3]);
        if ver != VERSION {
            return Err(TunnelError::Socks5Protocol(format!(
                "unsupported version {ver}"
            )));
        }
        if cmd != CMD_CONNECT {
            self.reply(client, REPLY_CMD_NOT_SUPPORTED).await?;
            return Ok(None);
        }

        let host = match atyp {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                client.read_exact(&mut addr).await?;
                Ipv4Addr::from(addr).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                client.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                client.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).into_owned()
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                client.read_exact(&mut addr).await?;
                Ipv6Addr::from(addr).to_string()
            }
            _ => {
                self.reply(client, REPLY_ATYP_NOT_SUPPORTED).await?;
                return Ok(None);
            }
        };

        let mut port_buf = [0u8; 2];
        client.read_exact(&mut port_buf).await?;
        Ok(Some((host, u16::from_be_bytes(port_buf))))
    }

    async fn reply(&self, client: &mut ClientSide, code: u8) -> Result<()> {
        client
            .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
    }

    async fn relay(client: ClientSide, upstream: UpstreamConn) -> Result<()> {
        match (client, upstream) {
            (ClientSide::Tcp(tcp), UpstreamConn::Channel(channel)) => {
                crate::copier::splice_tcp_channel(tcp, channel).await
            }
            (ClientSide::Channel(channel), UpstreamConn::Tcp(tcp)) => {
                crate::copier::splice_tcp_channel(tcp, channel).await
            }
            _ => unreachable!("a socks5 session always pairs a tcp side with a channel side"),
        }
    }
}
