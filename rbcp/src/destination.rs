//! `rbcpd` accept loop
//!
//! One listener serves control and data connections alike; the [`remote::protocol::Hello`] at
//! the start of a connection tells them apart. A control hello starts a receiver and registers
//! its session, data hellos carrying that session are handed to the receiver.

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::error::{Error, ErrorKind, Summary};
use crate::receiver::{ReceiverSettings, run_receiver};

type DataSender = async_channel::Sender<(u32, remote::streams::BoxedRecvStream)>;

#[derive(Clone, Debug, Default)]
pub struct DestinationSettings {
    /// Only accept destinations below this directory
    pub root: Option<std::path::PathBuf>,
    /// Serve transfers until cancelled instead of exiting after the first one
    pub keep_running: bool,
}

/// Checks a destination requested by a peer; it must be absolute, free of `..` and below
/// `root` when one is configured.
pub fn resolve_destination(
    root: Option<&std::path::Path>,
    requested: &std::path::Path,
) -> anyhow::Result<std::path::PathBuf> {
    if !requested.is_absolute() {
        return Err(anyhow!("destination {requested:?} is not absolute"));
    }
    if requested
        .components()
        .any(|component| component == std::path::Component::ParentDir)
    {
        return Err(anyhow!("destination {requested:?} must not contain '..'"));
    }
    if let Some(root) = root
        && !requested.starts_with(root)
    {
        return Err(anyhow!("destination {requested:?} is outside of {root:?}"));
    }
    if requested.file_name().is_none() {
        return Err(anyhow!("destination {requested:?} does not name a file"));
    }
    Ok(requested.to_path_buf())
}

#[derive(Debug, Default)]
struct Sessions {
    data: std::sync::Mutex<std::collections::HashMap<String, DataSender>>,
}

impl Sessions {
    fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, DataSender>> {
        self.data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(&self, session: &str, sender: DataSender) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(session) {
            return false;
        }
        sessions.insert(session.to_string(), sender);
        true
    }

    fn get(&self, session: &str) -> Option<DataSender> {
        self.lock().get(session).cloned()
    }

    fn unregister(&self, session: &str) {
        if let Some(sender) = self.lock().remove(session) {
            sender.close();
        }
    }
}

struct ConnectionContext {
    tcp: remote::TcpConfig,
    settings: DestinationSettings,
    sessions: Sessions,
    cancel: tokio_util::sync::CancellationToken,
}

async fn reject(send: &mut remote::streams::BoxedSendStream, reason: String) {
    tracing::warn!("rejecting connection: {reason}");
    if let Err(error) =
        remote::reply_hello(send, &remote::protocol::HelloReply::Rejected(reason)).await
    {
        tracing::debug!("{error:#}");
    }
}

// returns the transfer result for control connections, None for everything else
#[instrument(level = "debug", skip(ctx, stream))]
async fn handle_connection(
    ctx: std::sync::Arc<ConnectionContext>,
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
) -> Option<Result<Summary, Error>> {
    if let Err(error) = remote::configure_tcp_stream(&stream, &ctx.tcp) {
        tracing::warn!("{error:#}");
    }
    let (hello, mut send, recv) = match remote::recv_hello(stream, ctx.tcp.conn_timeout()).await
    {
        Ok(hello) => hello,
        Err(error) => {
            tracing::warn!("handshake with {peer} failed: {error:#}");
            return None;
        }
    };
    match hello {
        remote::protocol::Hello::Data { session, stream_id } => {
            let Some(data) = ctx.sessions.get(&session) else {
                reject(&mut send, format!("unknown session {session:?}")).await;
                return None;
            };
            if let Err(error) =
                remote::reply_hello(&mut send, &remote::protocol::HelloReply::Accepted).await
            {
                tracing::warn!("{error:#}");
                return None;
            }
            if data.send((stream_id, recv)).await.is_err() {
                tracing::debug!("transfer {session:?} ended before data stream {stream_id} joined");
            }
            None
        }
        remote::protocol::Hello::Control {
            session,
            destination,
            resume,
            version,
        } => {
            let ours = common::version::ProtocolVersion::current();
            if !ours.is_compatible_with(&version) {
                reject(
                    &mut send,
                    format!(
                        "incompatible protocol version: peer {}, local {}",
                        version.display(),
                        ours.display()
                    ),
                )
                .await;
                return None;
            }
            let destination = match resolve_destination(ctx.settings.root.as_deref(), &destination)
            {
                Ok(destination) => destination,
                Err(error) => {
                    reject(&mut send, format!("{error:#}")).await;
                    return None;
                }
            };
            let (data_tx, data_rx) = async_channel::unbounded();
            if !ctx.sessions.register(&session, data_tx) {
                reject(&mut send, format!("session {session:?} already exists")).await;
                return None;
            }
            if let Err(error) =
                remote::reply_hello(&mut send, &remote::protocol::HelloReply::Accepted).await
            {
                tracing::warn!("{error:#}");
                ctx.sessions.unregister(&session);
                return None;
            }
            tracing::info!("transfer from {peer} into {destination:?} started");
            let settings = ReceiverSettings {
                resume,
                handshake_timeout: ctx.tcp.conn_timeout(),
            };
            let result = run_receiver(
                &destination,
                send,
                recv,
                data_rx,
                &settings,
                ctx.cancel.child_token(),
            )
            .await;
            ctx.sessions.unregister(&session);
            Some(result)
        }
    }
}

/// Serves transfers on `listener` until the first one ends, or until cancelled with
/// `keep_running`.
///
/// With `keep_running` failed transfers are logged and the summaries of the successful ones
/// are added up.
pub async fn serve(
    listener: tokio::net::TcpListener,
    tcp: remote::TcpConfig,
    settings: DestinationSettings,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Summary, Error> {
    let keep_running = settings.keep_running;
    let ctx = std::sync::Arc::new(ConnectionContext {
        tcp,
        settings,
        sessions: Sessions::default(),
        cancel: cancel.clone(),
    });
    let mut connections = tokio::task::JoinSet::new();
    let mut total = Summary::default();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                connections.shutdown().await;
                return Err(Error::new(ErrorKind::Cancelled).with_summary(total));
            }
            Some(joined) = connections.join_next() => {
                let result = match joined {
                    Ok(Some(result)) => result,
                    Ok(None) => continue,
                    Err(error) => Err(Error::io(anyhow!("connection task failed: {error}"))),
                };
                if !keep_running {
                    connections.shutdown().await;
                    return result;
                }
                match result {
                    Ok(summary) => total = total + summary,
                    Err(error) => tracing::error!("transfer failed: {error}"),
                }
            }
            accepted = listener.accept() => match accepted.context("failed to accept connection") {
                Ok((stream, peer)) => {
                    tracing::debug!("accepted connection from {peer}");
                    connections.spawn(handle_connection(ctx.clone(), stream, peer));
                }
                Err(error) => tracing::warn!("{error:#}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations_are_confined_to_root() {
        let root = std::path::Path::new("/data");
        assert_eq!(
            resolve_destination(Some(root), std::path::Path::new("/data/in/big.img")).unwrap(),
            std::path::PathBuf::from("/data/in/big.img")
        );
        assert!(resolve_destination(Some(root), std::path::Path::new("/etc/passwd")).is_err());
        assert!(
            resolve_destination(Some(root), std::path::Path::new("/data/../etc/passwd")).is_err()
        );
        assert!(resolve_destination(Some(root), std::path::Path::new("/database")).is_err());
        assert!(resolve_destination(None, std::path::Path::new("relative")).is_err());
        assert!(resolve_destination(None, std::path::Path::new("/")).is_err());
        assert!(resolve_destination(None, std::path::Path::new("/tmp/x")).is_ok());
    }

    #[test]
    fn sessions_register_once() {
        let sessions = Sessions::default();
        let (tx, rx) = async_channel::unbounded();
        assert!(sessions.register("s", tx.clone()));
        assert!(!sessions.register("s", tx));
        assert!(sessions.get("s").is_some());
        sessions.unregister("s");
        assert!(sessions.get("s").is_none());
        assert!(rx.is_closed());
    }
}
