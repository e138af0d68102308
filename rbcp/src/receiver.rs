//! Destination side of a transfer
//!
//! [`run_receiver`] validates the manifest, prepares the destination file (resuming from the
//! sidecar when allowed) and then serves every data stream with its own worker. Workers verify
//! each chunk, write it at its offset and record it in the sidecar before acknowledging it on
//! the control channel.

use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::control::{
    ChunkOutcome, ControlEvent, ControlMessage, ControlSender, DataFrameHeader, send_control,
    send_resumed, shared_control_sender, spawn_control_reader,
};
use crate::digest::{ChecksumAlgorithm, Digest};
use crate::error::{ChunkFailure, Error, ErrorKind, FailureKind, Summary};
use crate::ledger::{ChunkState, Ledger, TransferOutcome};
use crate::manifest::TransferManifest;
use crate::planner::ChunkSpan;
use crate::sidecar::{self, Sidecar};

/// Data streams accepted for a transfer, tagged with the stream id from their hello.
pub type IncomingStreams = async_channel::Receiver<(u32, remote::streams::BoxedRecvStream)>;

#[derive(Clone, Debug)]
pub struct ReceiverSettings {
    /// Reuse chunks recorded in the sidecar of a previous attempt
    pub resume: bool,
    /// Deadline for receiving the manifest
    pub handshake_timeout: std::time::Duration,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            resume: false,
            handshake_timeout: std::time::Duration::from_secs(15),
        }
    }
}

struct PreparedDestination {
    file: std::fs::File,
    sidecar: Sidecar,
    verified: Vec<(u64, Digest)>,
}

fn read_span(file: &std::fs::File, span: &ChunkSpan) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; span.length as usize];
    file.read_exact_at(&mut buf, span.offset)?;
    Ok(buf)
}

fn fresh_destination(
    destination: &std::path::Path,
    sidecar_path: &std::path::Path,
    manifest: &TransferManifest,
) -> anyhow::Result<PreparedDestination> {
    sidecar::remove(sidecar_path)?;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(destination)
        .with_context(|| format!("failed to open destination {destination:?}"))?;
    file.set_len(manifest.file_size)
        .with_context(|| format!("failed to resize {destination:?}"))?;
    let sidecar = Sidecar::create(sidecar_path, manifest, &[])?;
    Ok(PreparedDestination {
        file,
        sidecar,
        verified: Vec::new(),
    })
}

// None when the destination no longer matches what the sidecar describes
fn resume_destination(
    destination: &std::path::Path,
    sidecar_path: &std::path::Path,
    manifest: &TransferManifest,
    records: Vec<(u64, Digest)>,
) -> anyhow::Result<Option<PreparedDestination>> {
    let file = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(destination)
    {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("destination {destination:?} is gone, restarting transfer");
            return Ok(None);
        }
        Err(error) => {
            return Err(error).with_context(|| format!("failed to open destination {destination:?}"));
        }
    };
    let len = file
        .metadata()
        .with_context(|| format!("failed to read metadata of {destination:?}"))?
        .len();
    if len != manifest.file_size {
        tracing::warn!(
            "destination {destination:?} is {len} bytes, expected {}, restarting transfer",
            manifest.file_size
        );
        return Ok(None);
    }
    let spans = manifest.plan();
    let mut verified = Vec::with_capacity(records.len());
    for (index, digest) in records {
        let Some(span) = spans.get(index as usize) else {
            tracing::warn!("sidecar records unknown chunk {index}");
            continue;
        };
        let data = read_span(&file, span)
            .with_context(|| format!("failed to re-read chunk {index} of {destination:?}"))?;
        if Digest::compute(manifest.checksum, &data) == digest {
            verified.push((index, digest));
        } else {
            tracing::warn!("chunk {index} of {destination:?} does not match its record, resending");
        }
    }
    // compaction drops duplicates and records that failed re-verification
    let sidecar = Sidecar::create(sidecar_path, manifest, &verified)?;
    Ok(Some(PreparedDestination {
        file,
        sidecar,
        verified,
    }))
}

fn prepare_destination(
    destination: &std::path::Path,
    manifest: &TransferManifest,
    resume: bool,
) -> anyhow::Result<PreparedDestination> {
    let sidecar_path = sidecar::sidecar_path(destination);
    let previous = if resume {
        match sidecar::load(&sidecar_path) {
            Ok(previous) => previous,
            Err(error) => {
                tracing::warn!("ignoring unreadable resume state: {error:#}");
                None
            }
        }
    } else {
        None
    };
    if let Some(previous) = previous {
        if manifest.is_resumable_from(&previous.manifest) {
            if let Some(prepared) =
                resume_destination(destination, &sidecar_path, manifest, previous.records)?
            {
                return Ok(prepared);
            }
        } else {
            tracing::warn!(
                "resume state of {destination:?} belongs to a different transfer, restarting"
            );
        }
    } else if !resume && sidecar_path.exists() {
        tracing::info!("discarding resume state of a previous transfer to {destination:?}");
    }
    fresh_destination(destination, &sidecar_path, manifest)
}

struct ReceiveContext {
    file: std::sync::Arc<std::fs::File>,
    ledger: std::sync::Arc<Ledger>,
    sidecar: std::sync::Mutex<Sidecar>,
    control: ControlSender,
    checksum: ChecksumAlgorithm,
    rejected: AtomicU64,
    retried: AtomicU64,
    cancel: tokio_util::sync::CancellationToken,
}

enum Committed {
    Written,
    AlreadyVerified,
}

// digest check, positional write and sidecar append of one chunk, on the blocking pool
fn commit_chunk(
    ctx: &ReceiveContext,
    span: ChunkSpan,
    expected: Digest,
    payload: &[u8],
) -> Result<Committed, ChunkFailure> {
    let digest = Digest::compute(ctx.checksum, payload);
    if digest != expected {
        return Err(ChunkFailure::new(
            FailureKind::Integrity,
            format!("digest mismatch: expected {expected}, got {digest}"),
        ));
    }
    if ctx.ledger.state(span.index) == Some(ChunkState::Verified { digest }) {
        return Ok(Committed::AlreadyVerified);
    }
    if ctx.cancel.is_cancelled() {
        return Err(ChunkFailure::cancelled());
    }
    ctx.file
        .write_all_at(payload, span.offset)
        .map_err(|error| ChunkFailure::io(format!("write at offset {}: {error}", span.offset)))?;
    ctx.sidecar
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .append(span.index, &digest)
        .map_err(ChunkFailure::io)?;
    // a different digest means the source changed since the chunk was first verified
    ctx.ledger.requeue(span.index);
    ctx.ledger.mark_verified(span.index, digest);
    Ok(Committed::Written)
}

async fn acknowledge(
    ctx: &ReceiveContext,
    header: &DataFrameHeader,
    outcome: ChunkOutcome,
) -> anyhow::Result<()> {
    send_control(
        &ctx.control,
        &ControlMessage::ChunkAck {
            index: header.index,
            attempt: header.attempt,
            outcome,
        },
    )
    .await
}

async fn reject(
    ctx: &ReceiveContext,
    header: &DataFrameHeader,
    failure: ChunkFailure,
) -> anyhow::Result<()> {
    tracing::warn!(
        "rejecting chunk {} attempt {}: {failure}",
        header.index,
        header.attempt
    );
    ctx.rejected.fetch_add(1, Ordering::Relaxed);
    common::get_progress().chunks_rejected.inc();
    ctx.ledger.note_failure(header.index, failure.clone());
    acknowledge(ctx, header, ChunkOutcome::Rejected(failure)).await
}

/// Serves one data stream until the sender closes it or framing breaks.
#[instrument(level = "debug", skip(ctx, recv))]
async fn receive_stream(
    ctx: std::sync::Arc<ReceiveContext>,
    stream_id: u32,
    mut recv: remote::streams::BoxedRecvStream,
) -> anyhow::Result<()> {
    loop {
        let header = match recv.recv_object::<DataFrameHeader>().await {
            Ok(Some(header)) => header,
            Ok(None) => {
                tracing::debug!("data stream {stream_id} closed by the sender");
                return Ok(());
            }
            Err(error) => {
                tracing::warn!("data stream {stream_id} failed: {error:#}");
                return Ok(());
            }
        };
        let _guard = common::get_progress().chunks_in_flight.guard();
        if header.attempt > 1 {
            ctx.retried.fetch_add(1, Ordering::Relaxed);
        }
        let span = match ctx.ledger.span(header.index) {
            Some(span) if span.length == header.length => span,
            Some(span) => {
                let failure = ChunkFailure::new(
                    FailureKind::Protocol,
                    format!(
                        "chunk {} declared {} bytes, planned {}",
                        header.index, header.length, span.length
                    ),
                );
                reject(&ctx, &header, failure).await?;
                return Ok(());
            }
            None => {
                let failure = ChunkFailure::new(
                    FailureKind::Protocol,
                    format!("unknown chunk {}", header.index),
                );
                reject(&ctx, &header, failure).await?;
                return Ok(());
            }
        };
        let mut payload = vec![0u8; span.length as usize];
        if let Err(error) = recv.recv_payload(&mut payload).await {
            let failure = ChunkFailure::network(format!("truncated frame: {error}"));
            reject(&ctx, &header, failure).await?;
            return Ok(());
        }
        let commit_ctx = ctx.clone();
        let committed = tokio::task::spawn_blocking(move || {
            commit_chunk(&commit_ctx, span, header.digest, &payload)
        })
        .await
        .map_err(|error| ChunkFailure::io(format!("commit task failed: {error}")))
        .and_then(|result| result);
        match committed {
            Ok(Committed::Written) => {
                let progress = common::get_progress();
                progress.chunks_verified.inc();
                progress.bytes_verified.add(span.length);
                acknowledge(&ctx, &header, ChunkOutcome::Verified).await?;
            }
            Ok(Committed::AlreadyVerified) => {
                tracing::debug!("chunk {} already verified, not rewritten", header.index);
                acknowledge(&ctx, &header, ChunkOutcome::Verified).await?;
            }
            Err(failure) if failure.kind == FailureKind::Cancelled => return Ok(()),
            Err(failure) => reject(&ctx, &header, failure).await?,
        }
    }
}

fn control_error(event: Option<ControlEvent>) -> Error {
    match event {
        Some(ControlEvent::Message(ControlMessage::Abort(reason))) => {
            Error::new(ErrorKind::PeerAbort(reason))
        }
        Some(ControlEvent::Message(message)) => Error::protocol(format!(
            "unexpected {} message on the control channel",
            message.name()
        )),
        Some(ControlEvent::Failed(error)) => {
            Error::network(error.context("control channel failed"))
        }
        Some(ControlEvent::Closed) | None => {
            Error::network(anyhow!("control channel closed by the sender"))
        }
    }
}

async fn recv_manifest(
    events: &mut tokio::sync::mpsc::Receiver<ControlEvent>,
    timeout: std::time::Duration,
) -> Result<TransferManifest, Error> {
    let manifest = match tokio::time::timeout(timeout, events.recv()).await {
        Ok(Some(ControlEvent::Message(ControlMessage::Manifest(manifest)))) => manifest,
        Ok(other) => return Err(control_error(other)),
        Err(_) => {
            return Err(Error::network(anyhow!(
                "no manifest received within {}",
                humantime::format_duration(timeout)
            )));
        }
    };
    manifest
        .validate()
        .map_err(|error| Error::protocol(format!("invalid manifest: {error:#}")))?;
    Ok(manifest)
}

struct ReceiverSession {
    ctx: std::sync::Arc<ReceiveContext>,
    /// stream ids that attached at least once, a repeated id is a reconnect
    attached: std::collections::HashSet<u32>,
    reconnects: u64,
    tasks: tokio::task::JoinSet<anyhow::Result<()>>,
    summary: Summary,
}

impl ReceiverSession {
    async fn serve(
        &mut self,
        events: &mut tokio::sync::mpsc::Receiver<ControlEvent>,
        incoming: &IncomingStreams,
    ) -> Result<(), Error> {
        let mut accepting = true;
        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(Error::new(ErrorKind::Cancelled)),
                event = events.recv() => match event {
                    Some(ControlEvent::Message(ControlMessage::Complete)) => return Ok(()),
                    other => return Err(control_error(other)),
                },
                stream = incoming.recv(), if accepting => match stream {
                    Ok((stream_id, recv)) => {
                        if !self.attached.insert(stream_id) {
                            self.reconnects += 1;
                        }
                        tracing::debug!("data stream {stream_id} attached");
                        self.tasks.spawn(receive_stream(self.ctx.clone(), stream_id, recv));
                    }
                    Err(_) => accepting = false,
                },
                Some(joined) = self.tasks.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        return Err(Error::network(error.context("failed to acknowledge chunk")));
                    }
                    Err(error) => {
                        return Err(Error::io(anyhow!("receiver task failed: {error}")));
                    }
                },
            }
        }
    }

    async fn finish(&mut self, destination: &std::path::Path) -> Result<(), Error> {
        self.tasks.shutdown().await;
        let unfinished = self.ctx.ledger.unfinished();
        if !unfinished.is_empty() {
            return Err(Error::protocol(format!(
                "sender completed with {} chunks unverified",
                unfinished.len()
            )));
        }
        let file = self.ctx.file.clone();
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|error| Error::io(anyhow!("fsync task failed: {error}")))?
            .with_context(|| format!("failed to sync {destination:?}"))
            .map_err(Error::io)?;
        let sidecar_path = sidecar::sidecar_path(destination);
        sidecar::remove(&sidecar_path).map_err(Error::io)?;
        send_control(&self.ctx.control, &ControlMessage::Complete)
            .await
            .map_err(|error| Error::network(error.context("failed to confirm completion")))?;
        Ok(())
    }

    fn summary(&self) -> Summary {
        let snapshot = self.ctx.ledger.snapshot();
        let chunks_transferred = snapshot.verified.saturating_sub(self.summary.chunks_resumed);
        Summary {
            chunks_total: self.ctx.ledger.len(),
            chunks_verified: snapshot.verified,
            chunks_transferred,
            bytes_transferred: snapshot
                .verified_bytes
                .saturating_sub(self.summary.bytes_resumed),
            chunks_retried: self.ctx.retried.load(Ordering::Relaxed),
            chunks_rejected: self.ctx.rejected.load(Ordering::Relaxed),
            reconnects: self.reconnects,
            ..self.summary
        }
    }
}

async fn send_abort(control: &ControlSender, error: &Error) {
    if matches!(error.kind, ErrorKind::PeerAbort(_)) {
        return;
    }
    let abort = ControlMessage::Abort(error.abort_reason());
    if let Err(send_error) = send_control(control, &abort).await {
        tracing::debug!("failed to send abort to the sender: {send_error:#}");
    }
}

/// Receives a transfer into `destination` over the given control connection and data streams.
#[instrument(skip(control_send, control_recv, incoming, settings, cancel))]
pub async fn run_receiver(
    destination: &std::path::Path,
    control_send: remote::streams::BoxedSendStream,
    control_recv: remote::streams::BoxedRecvStream,
    incoming: IncomingStreams,
    settings: &ReceiverSettings,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Summary, Error> {
    let control = shared_control_sender(control_send);
    let (mut events, reader) = spawn_control_reader(control_recv);
    let manifest = tokio::select! {
        _ = cancel.cancelled() => Err(Error::new(ErrorKind::Cancelled)),
        manifest = recv_manifest(&mut events, settings.handshake_timeout) => manifest,
    };
    let manifest = match manifest {
        Ok(manifest) => manifest,
        Err(error) => {
            send_abort(&control, &error).await;
            reader.abort();
            return Err(error);
        }
    };
    tracing::info!(
        "receiving {} in {} chunks into {destination:?}",
        bytesize::ByteSize(manifest.file_size),
        manifest.chunk_count()
    );
    // the echo accepts the manifest, resumed chunks follow once re-verified
    if let Err(error) = send_control(&control, &ControlMessage::Manifest(manifest.clone())).await {
        reader.abort();
        return Err(Error::network(error.context("failed to echo manifest")));
    }
    let prepared = {
        let destination = destination.to_path_buf();
        let manifest = manifest.clone();
        let resume = settings.resume;
        let setup = tokio::task::spawn_blocking(move || {
            prepare_destination(&destination, &manifest, resume)
        });
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::new(ErrorKind::Cancelled)),
            joined = setup => joined
                .map_err(|error| Error::io(anyhow!("destination setup task failed: {error}")))
                .and_then(|result| result.map_err(Error::io)),
        }
    };
    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(error) => {
            send_abort(&control, &error).await;
            reader.abort();
            return Err(error);
        }
    };
    let ledger = std::sync::Arc::new(Ledger::new(manifest.plan()));
    let mut summary = Summary::default();
    for (index, digest) in &prepared.verified {
        if ledger.mark_verified(*index, *digest)
            && let Some(span) = ledger.span(*index)
        {
            summary.chunks_resumed += 1;
            summary.bytes_resumed += span.length;
        }
    }
    if summary.chunks_resumed > 0 {
        tracing::info!(
            "resuming: {} chunks ({}) already on disk",
            summary.chunks_resumed,
            bytesize::ByteSize(summary.bytes_resumed)
        );
    }
    let mut session = ReceiverSession {
        ctx: std::sync::Arc::new(ReceiveContext {
            file: std::sync::Arc::new(prepared.file),
            ledger,
            sidecar: std::sync::Mutex::new(prepared.sidecar),
            control: control.clone(),
            checksum: manifest.checksum,
            rejected: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            cancel: cancel.child_token(),
        }),
        attached: std::collections::HashSet::new(),
        reconnects: 0,
        tasks: tokio::task::JoinSet::new(),
        summary,
    };
    let result = async {
        send_resumed(&control, &prepared.verified)
            .await
            .map_err(|error| Error::network(error.context("failed to acknowledge manifest")))?;
        session.serve(&mut events, &incoming).await?;
        session.finish(destination).await
    }
    .await;
    reader.abort();
    let summary = session.summary();
    match result {
        Ok(()) => {
            tracing::info!("transfer into {destination:?} completed");
            Ok(summary)
        }
        Err(error) => {
            session.ctx.cancel.cancel();
            session.tasks.shutdown().await;
            send_abort(&control, &error).await;
            let outcome = session.ctx.ledger.outcome();
            let sidecar = (outcome != TransferOutcome::Completed)
                .then(|| sidecar::sidecar_path(destination));
            Err(error
                .with_unfinished(session.ctx.ledger.unfinished())
                .with_sidecar(sidecar)
                .with_summary(summary))
        }
    }
}
