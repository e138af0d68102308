//! `rbcp` side of a transfer: connects to an `rbcpd` and runs the sender.

use anyhow::Context;
use tracing::instrument;

use crate::error::{Error, ErrorKind, Summary};
use crate::path::RemotePath;
use crate::sender::{DataConnection, DataStreamConnector, SenderSettings, run_sender};

#[derive(Clone, Debug, Default)]
pub struct SourceSettings {
    pub sender: SenderSettings,
    pub tcp: remote::TcpConfig,
    /// Ask the receiver to reuse chunks recorded by a previous attempt
    pub resume: bool,
}

/// Opens data connections to the daemon that accepted the control connection.
#[derive(Debug)]
struct TcpConnector {
    addr: String,
    tcp: remote::TcpConfig,
    session: String,
}

impl DataStreamConnector for TcpConnector {
    fn connect(
        &self,
        stream_id: u32,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<DataConnection>> {
        let addr = self.addr.clone();
        let tcp = self.tcp.clone();
        let hello = remote::protocol::Hello::Data {
            session: self.session.clone(),
            stream_id,
        };
        Box::pin(async move {
            let stream = remote::connect(&addr, &tcp).await?;
            // data streams are one-way, the read half is never used
            let (send, _recv) = remote::send_hello(stream, &hello, tcp.conn_timeout()).await?;
            Ok(send)
        })
    }
}

fn hello_error(error: anyhow::Error) -> Error {
    if error
        .downcast_ref::<remote::protocol::HelloRejected>()
        .is_some()
    {
        Error::protocol(format!("{error:#}"))
    } else {
        Error::network(error)
    }
}

/// Sends `src` to `dst` on a running `rbcpd`.
#[instrument(skip(settings, cancel))]
pub async fn run_source(
    src: &std::path::Path,
    dst: &RemotePath,
    settings: &SourceSettings,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Summary, Error> {
    let addr = dst.addr();
    let session = remote::protocol::generate_session_token();
    let stream = remote::connect(&addr, &settings.tcp)
        .await
        .map_err(Error::network)?;
    let hello = remote::protocol::Hello::Control {
        session: session.clone(),
        destination: dst.path().to_path_buf(),
        resume: settings.resume,
        version: common::version::ProtocolVersion::current(),
    };
    let (send, recv) = remote::send_hello(stream, &hello, settings.tcp.conn_timeout())
        .await
        .map_err(hello_error)?;
    tracing::info!("connected to {addr}, session {session}");
    let connector = TcpConnector {
        addr,
        tcp: settings.tcp.clone(),
        session,
    };
    run_sender(
        src,
        send,
        recv,
        std::sync::Arc::new(connector),
        &settings.sender,
        cancel,
    )
    .await
    .map_err(|error| {
        if error.sidecar.is_none() && error.is_retryable() {
            let sidecar = crate::sidecar::sidecar_path(dst.path());
            error.with_sidecar(Some(sidecar))
        } else {
            error
        }
    })
}

/// Copies `src` to the local path `dst` through an in-process receiver on loopback TCP.
///
/// Goes through the same hello, control and data stream protocol as a remote transfer.
#[instrument(skip(settings, cancel))]
pub async fn run_local(
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &SourceSettings,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Summary, Error> {
    let dst = std::path::absolute(dst)
        .with_context(|| format!("failed to resolve destination {dst:?}"))
        .map_err(Error::io)?;
    let listener = remote::create_tcp_listener(&settings.tcp, Some("127.0.0.1"))
        .await
        .map_err(Error::network)?;
    let addr = remote::get_tcp_listener_addr(&listener).map_err(Error::network)?;
    tracing::debug!("local receiver listening on {addr}");
    let destination_cancel = cancel.child_token();
    let destination = tokio::spawn(crate::destination::serve(
        listener,
        settings.tcp.clone(),
        crate::destination::DestinationSettings::default(),
        destination_cancel.clone(),
    ));
    let remote_dst = RemotePath::new(addr.ip().to_string(), addr.port(), dst)
        .map_err(|error| Error::io(error.context("invalid destination")))?;
    let sent = run_source(src, &remote_dst, settings, cancel).await;
    if sent.is_err() {
        // the receiver may still wait for a control connection that never came
        destination_cancel.cancel();
    }
    let received = destination
        .await
        .map_err(|error| Error::io(anyhow::anyhow!("local receiver task failed: {error}")))?;
    match (sent, received) {
        (Ok(summary), Ok(_)) => Ok(summary),
        (Ok(summary), Err(error)) => Err(error.with_summary(summary)),
        (Err(error), Err(received)) if matches!(error.kind, ErrorKind::PeerAbort(_)) => {
            // the receiver knows best what went wrong on its side
            Err(received.with_summary(error.summary))
        }
        (Err(error), _) => Err(error),
    }
}
