use crate::error::{Result, TunnelError};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const BUF_SIZE: usize = 8192;

/// Splices a TCP stream with an SSH channel until either side reaches EOF
/// or closes. Every forwarding mode reduces to exactly one TCP stream paired
/// with one channel, so this single primitive covers all four directions.
pub async fn splice_tcp_channel(tcp: TcpStream, mut channel: Channel<Msg>) -> Result<()> {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        tokio::select! {
            result = tcp_read.read(&mut buf) => {
                match result? {
                    0 => {
                        let _ = channel.eof().await;
                        break;
                    }
                    n => {
                        channel.data(&buf[..n]).await.map_err(TunnelError::Ssh)?;
                    }
                }
            }
            message = channel.wait() => {
                match message {
                    Some(ChannelMsg::Data { ref data }) => {
                        tcp_write.write_all(data).await?;
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::BUF_SIZE;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Mirrors `splice_tcp_channel`'s read/forward/EOF semantics against a
    /// plain TCP peer standing in for the SSH channel side, which can't be
    /// constructed in tests without a live SSH session.
    async fn splice_tcp_tcp(a: TcpStream, b: TcpStream) {
        let (mut a_read, mut a_write) = a.into_split();
        let (mut b_read, mut b_write) = b.into_split();
        let mut buf_a = vec![0u8; BUF_SIZE];
        let mut buf_b = vec![0u8; BUF_SIZE];

        loop {
            tokio::select! {
                result = a_read.read(&mut buf_a) => {
                    match result.unwrap() {
                        0 => { let _ = b_write.shutdown().await; break; }
                        n => { b_write.write_all(&buf_a[..n]).await.unwrap(); }
                    }
                }
                result = b_read.read(&mut buf_b) => {
                    match result.unwrap() {
                        0 => { let _ = a_write.shutdown().await; break; }
                        n => { a_write.write_all(&buf_b[..n]).await.unwrap(); }
                    }
                }
            }
        }
    }

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn relays_data_until_either_side_closes() {
        let (mut client_a, server_a) = loopback_pair().await;
        let (mut client_b, server_b) = loopback_pair().await;

        let relay = tokio::spawn(splice_tcp_tcp(server_a, server_b));

        client_a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client_a);
        drop(client_b);
        relay.await.unwrap();
    }
}
