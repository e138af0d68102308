//! Connection plumbing for the rbcp tools
//!
//! - [`streams`]: length-delimited bincode framing over any `AsyncRead`/`AsyncWrite`, plus raw
//!   payload transfer right after a frame
//! - [`protocol`]: the hello exchanged at the start of every TCP connection
//! - [`port_ranges`]: binding listeners inside operator-provided port ranges
//!
//! Every connection opened by the source starts with a [`protocol::Hello`] and is answered with
//! a [`protocol::HelloReply`]. After that a control connection carries control messages in both
//! directions while data connections only carry data from the source to the destination.

use anyhow::{Context, anyhow};
use tracing::instrument;

pub mod port_ranges;
pub mod protocol;
pub mod streams;

/// TCP settings shared by `rbcp` and `rbcpd`
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Restrict the listener to these ports, e.g. "8000-8999"
    pub port_ranges: Option<String>,
    /// Timeout for connecting and for the hello exchange
    pub conn_timeout_sec: u64,
    /// Kernel socket buffer size (SO_SNDBUF/SO_RCVBUF), `None` keeps the system default
    pub socket_buffer_size: Option<usize>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            port_ranges: None,
            conn_timeout_sec: 15,
            socket_buffer_size: None,
        }
    }
}

impl TcpConfig {
    pub fn conn_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.conn_timeout_sec)
    }
}

fn parse_bind_ip(bind_ip: Option<&str>) -> anyhow::Result<std::net::IpAddr> {
    match bind_ip {
        Some(ip) => ip
            .parse()
            .with_context(|| format!("invalid bind IP address: {ip:?}")),
        None => Ok(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
    }
}

/// Creates the listener accepting control and data connections.
#[instrument]
pub async fn create_tcp_listener(
    config: &TcpConfig,
    bind_ip: Option<&str>,
) -> anyhow::Result<tokio::net::TcpListener> {
    let ip = parse_bind_ip(bind_ip)?;
    let listener = match &config.port_ranges {
        Some(ranges) => {
            port_ranges::PortRanges::parse(ranges)?
                .bind_tcp_listener(ip)
                .await?
        }
        None => tokio::net::TcpListener::bind((ip, 0))
            .await
            .with_context(|| format!("failed to bind TCP listener on {ip}"))?,
    };
    Ok(listener)
}

/// Address peers should use to reach `listener`.
///
/// A listener bound to the unspecified address reports `0.0.0.0`; in that case the loopback
/// address is advertised, callers that need a routable address must pass `--bind-ip`.
pub fn get_tcp_listener_addr(
    listener: &tokio::net::TcpListener,
) -> anyhow::Result<std::net::SocketAddr> {
    let mut addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    if addr.ip().is_unspecified() {
        addr.set_ip(match addr.ip() {
            std::net::IpAddr::V4(_) => std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            std::net::IpAddr::V6(_) => std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        });
    }
    Ok(addr)
}

/// Disables Nagle and applies the configured socket buffer sizes.
pub fn configure_tcp_stream(
    stream: &tokio::net::TcpStream,
    config: &TcpConfig,
) -> anyhow::Result<()> {
    stream.set_nodelay(true).context("failed to set TCP_NODELAY")?;
    if let Some(size) = config.socket_buffer_size {
        let sock = socket2::SockRef::from(stream);
        if let Err(error) = sock.set_send_buffer_size(size) {
            tracing::warn!("failed to set send buffer size to {size}: {error}");
        }
        if let Err(error) = sock.set_recv_buffer_size(size) {
            tracing::warn!("failed to set receive buffer size to {size}: {error}");
        }
    }
    Ok(())
}

/// Connects to `addr` ("host:port") within the configured timeout.
#[instrument(skip(config))]
pub async fn connect(addr: &str, config: &TcpConfig) -> anyhow::Result<tokio::net::TcpStream> {
    let stream = tokio::time::timeout(config.conn_timeout(), tokio::net::TcpStream::connect(addr))
        .await
        .with_context(|| format!("timed out connecting to {addr}"))?
        .with_context(|| format!("failed to connect to {addr}"))?;
    configure_tcp_stream(&stream, config)?;
    Ok(stream)
}

fn split_boxed(
    stream: tokio::net::TcpStream,
) -> (streams::BoxedSendStream, streams::BoxedRecvStream) {
    let (read_half, write_half) = stream.into_split();
    streams::boxed_pair(read_half, write_half)
}

/// Client side of the hello exchange: sends `hello` and waits for the server to accept it.
#[instrument(skip(stream, hello), fields(session = hello.session()))]
pub async fn send_hello(
    stream: tokio::net::TcpStream,
    hello: &protocol::Hello,
    timeout: std::time::Duration,
) -> anyhow::Result<(streams::BoxedSendStream, streams::BoxedRecvStream)> {
    let (mut send, mut recv) = split_boxed(stream);
    let exchange = async {
        send.send_control_message(hello).await?;
        recv.recv_object::<protocol::HelloReply>()
            .await?
            .ok_or_else(|| anyhow!("connection closed before hello was answered"))
    };
    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .context("timed out waiting for hello reply")??;
    match reply {
        protocol::HelloReply::Accepted => Ok((send, recv)),
        protocol::HelloReply::Rejected(reason) => Err(protocol::HelloRejected(reason).into()),
    }
}

/// Server side of the hello exchange: reads the hello, the caller answers it with
/// [`reply_hello`] once it decided what to do with the connection.
pub async fn recv_hello(
    stream: tokio::net::TcpStream,
    timeout: std::time::Duration,
) -> anyhow::Result<(
    protocol::Hello,
    streams::BoxedSendStream,
    streams::BoxedRecvStream,
)> {
    let (send, mut recv) = split_boxed(stream);
    let hello = tokio::time::timeout(timeout, recv.recv_object::<protocol::Hello>())
        .await
        .context("timed out waiting for hello")??
        .ok_or_else(|| anyhow!("connection closed before sending hello"))?;
    Ok((hello, send, recv))
}

pub async fn reply_hello(
    send: &mut streams::BoxedSendStream,
    reply: &protocol::HelloReply,
) -> anyhow::Result<()> {
    send.send_control_message(reply)
        .await
        .context("failed to answer hello")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hello_exchange_over_tcp() -> anyhow::Result<()> {
        let config = TcpConfig::default();
        let listener = create_tcp_listener(&config, Some("127.0.0.1")).await?;
        let addr = get_tcp_listener_addr(&listener)?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (hello, mut send, _recv) =
                recv_hello(stream, std::time::Duration::from_secs(5)).await?;
            let reply = match &hello {
                protocol::Hello::Data { stream_id: 1, .. } => protocol::HelloReply::Accepted,
                _ => protocol::HelloReply::Rejected("unexpected hello".to_string()),
            };
            reply_hello(&mut send, &reply).await?;
            anyhow::Ok(hello)
        });
        let stream = connect(&addr.to_string(), &config).await?;
        let hello = protocol::Hello::Data {
            session: "session".to_string(),
            stream_id: 1,
        };
        send_hello(stream, &hello, std::time::Duration::from_secs(5)).await?;
        assert_eq!(server.await??, hello);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_hello_is_an_error() -> anyhow::Result<()> {
        let config = TcpConfig::default();
        let listener = create_tcp_listener(&config, Some("127.0.0.1")).await?;
        let addr = get_tcp_listener_addr(&listener)?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (_hello, mut send, _recv) =
                recv_hello(stream, std::time::Duration::from_secs(5)).await?;
            reply_hello(
                &mut send,
                &protocol::HelloReply::Rejected("unknown session".to_string()),
            )
            .await
        });
        let stream = connect(&addr.to_string(), &config).await?;
        let hello = protocol::Hello::Data {
            session: "nope".to_string(),
            stream_id: 0,
        };
        let Err(error) = send_hello(stream, &hello, std::time::Duration::from_secs(5)).await else {
            panic!("hello should have been rejected");
        };
        assert_eq!(
            error.downcast_ref::<protocol::HelloRejected>(),
            Some(&protocol::HelloRejected("unknown session".to_string()))
        );
        server.await??;
        Ok(())
    }

    #[test]
    fn invalid_bind_ip() {
        assert!(parse_bind_ip(Some("not-an-ip")).is_err());
        assert!(parse_bind_ip(None).unwrap().is_unspecified());
    }
}
