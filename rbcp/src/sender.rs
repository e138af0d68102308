//! Source side of a transfer
//!
//! [`run_sender`] agrees on the manifest with the receiver, reconciles chunks the receiver
//! already holds, then runs the scheduling loop: a single task that hands pending chunks to idle
//! data streams, reacts to acknowledgements and failures and (re)connects streams. Each chunk
//! assignment runs as its own worker task which returns the stream handle when done.

use std::os::unix::fs::FileExt;

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::control::{
    AckRouter, ChunkOutcome, ControlEvent, ControlMessage, ControlSender, DataFrameHeader,
    send_control, shared_control_sender, spawn_control_reader,
};
use crate::digest::{ChecksumAlgorithm, Digest};
use crate::error::{ChunkFailure, Error, ErrorKind, FailureKind, Summary};
use crate::ledger::{Assignment, Ledger, TransferOutcome};
use crate::manifest::TransferManifest;
use crate::planner::ChunkPolicy;
use crate::policy::{DefaultRetryPolicy, RetryDecision, RetryPolicy};
use crate::pool::{Released, StreamHandle, StreamOutcome, StreamPool};

pub type DataConnection = remote::streams::BoxedSendStream;

/// Opens data connections to the receiver of the current transfer.
pub trait DataStreamConnector: Send + Sync {
    fn connect(
        &self,
        stream_id: u32,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<DataConnection>>;
}

#[derive(Clone, Debug)]
pub struct SenderSettings {
    pub stream_count: u32,
    pub chunk_policy: ChunkPolicy,
    pub checksum: ChecksumAlgorithm,
    /// Deadline for sending one chunk and receiving its acknowledgement
    pub chunk_timeout: std::time::Duration,
    /// Deadline for the manifest exchange and for opening a data stream
    pub handshake_timeout: std::time::Duration,
    /// Reconnects allowed per data stream before it is retired
    pub max_reconnects: u32,
    pub retry: std::sync::Arc<dyn RetryPolicy>,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            stream_count: 4,
            chunk_policy: ChunkPolicy::default(),
            checksum: ChecksumAlgorithm::default(),
            chunk_timeout: std::time::Duration::from_secs(60),
            handshake_timeout: std::time::Duration::from_secs(15),
            max_reconnects: 3,
            retry: std::sync::Arc::new(DefaultRetryPolicy::default()),
        }
    }
}

struct ChunkContext {
    file: std::sync::Arc<std::fs::File>,
    checksum: ChecksumAlgorithm,
    chunk_timeout: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
}

struct ChunkReport {
    handle: StreamHandle<DataConnection>,
    assignment: Assignment,
    result: Result<Digest, ChunkFailure>,
    /// the failure came from a negative acknowledgement
    rejected: bool,
}

enum TaskResult {
    Chunk(Box<ChunkReport>),
    Connected {
        id: u32,
        result: anyhow::Result<DataConnection>,
    },
    Wake,
}

async fn read_chunk(
    file: std::sync::Arc<std::fs::File>,
    checksum: ChecksumAlgorithm,
    offset: u64,
    length: u64,
) -> anyhow::Result<(Vec<u8>, Digest)> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; length as usize];
        file.read_exact_at(&mut buf, offset)
            .with_context(|| format!("failed to read {length} bytes at offset {offset}"))?;
        let digest = Digest::compute(checksum, &buf);
        Ok((buf, digest))
    })
    .await
    .context("chunk read task failed")?
}

// returns the digest of the data the receiver acknowledged
async fn transfer_chunk(
    ctx: &ChunkContext,
    conn: &mut DataConnection,
    assignment: Assignment,
    ack: tokio::sync::oneshot::Receiver<ChunkOutcome>,
) -> (Result<Digest, ChunkFailure>, bool) {
    let span = assignment.span;
    let (payload, digest) =
        match read_chunk(ctx.file.clone(), ctx.checksum, span.offset, span.length).await {
            Ok(read) => read,
            Err(error) => return (Err(ChunkFailure::io(error)), false),
        };
    throttle::get_chunk_ops_token().await;
    throttle::get_bandwidth_tokens(span.length).await;
    let header = DataFrameHeader {
        index: span.index,
        attempt: assignment.attempt,
        length: span.length,
        digest,
    };
    let exchange = async {
        if let Err(error) = conn.send_message_with_payload(&header, &payload).await {
            return (Err(ChunkFailure::network(error)), false);
        }
        match ack.await {
            Ok(ChunkOutcome::Verified) => (Ok(digest), false),
            Ok(ChunkOutcome::Rejected(failure)) => (Err(failure), true),
            Err(_) => (
                Err(ChunkFailure::network(
                    "control channel closed before the chunk was acknowledged",
                )),
                false,
            ),
        }
    };
    match tokio::time::timeout(ctx.chunk_timeout, exchange).await {
        Ok(result) => result,
        Err(_) => (
            Err(ChunkFailure::new(
                FailureKind::Timeout,
                format!(
                    "chunk not acknowledged within {}",
                    humantime::format_duration(ctx.chunk_timeout)
                ),
            )),
            false,
        ),
    }
}

#[instrument(level = "debug", skip(ctx, handle, ack), fields(stream = handle.id, index = assignment.span.index, attempt = assignment.attempt))]
async fn send_chunk(
    ctx: std::sync::Arc<ChunkContext>,
    mut handle: StreamHandle<DataConnection>,
    assignment: Assignment,
    ack: tokio::sync::oneshot::Receiver<ChunkOutcome>,
) -> TaskResult {
    let _guard = common::get_progress().chunks_in_flight.guard();
    let (result, rejected) = tokio::select! {
        _ = ctx.cancel.cancelled() => (Err(ChunkFailure::cancelled()), false),
        result = transfer_chunk(&ctx, &mut handle.conn, assignment, ack) => result,
    };
    TaskResult::Chunk(Box::new(ChunkReport {
        handle,
        assignment,
        result,
        rejected,
    }))
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
            Error::network(anyhow!("control channel closed by the receiver"))
        }
    }
}

/// Sends the manifest and collects the chunks the receiver kept from a previous attempt.
///
/// Only the echo is bounded by `timeout`: the receiver echoes before it re-verifies resumed
/// chunks, which takes as long as reading them back.
async fn exchange_manifest(
    control: &ControlSender,
    events: &mut tokio::sync::mpsc::Receiver<ControlEvent>,
    manifest: &TransferManifest,
    timeout: std::time::Duration,
) -> Result<Vec<(u64, Digest)>, Error> {
    send_control(control, &ControlMessage::Manifest(manifest.clone()))
        .await
        .map_err(|error| Error::network(error.context("failed to send manifest")))?;
    let echo = tokio::time::timeout(timeout, events.recv())
        .await
        .map_err(|_| {
            Error::network(anyhow!(
                "receiver did not accept the manifest within {}",
                humantime::format_duration(timeout)
            ))
        })?;
    match echo {
        Some(ControlEvent::Message(ControlMessage::Manifest(echo))) => {
            if echo != *manifest {
                return Err(Error::protocol(
                    "manifest echoed by the receiver differs from the one sent",
                ));
            }
        }
        other => return Err(control_error(other)),
    }
    let chunk_count = manifest.chunk_count();
    let mut verified = Vec::new();
    loop {
        match events.recv().await {
            Some(ControlEvent::Message(ControlMessage::ResumedChunks(batch))) => {
                if (verified.len() + batch.len()) as u64 > chunk_count {
                    return Err(Error::protocol(format!(
                        "receiver reported more resumed chunks than the {chunk_count} planned"
                    )));
                }
                verified.extend(batch);
            }
            Some(ControlEvent::Message(ControlMessage::ManifestAck { resumed })) => {
                if resumed != verified.len() as u64 {
                    return Err(Error::protocol(format!(
                        "receiver announced {resumed} resumed chunks but sent {}",
                        verified.len()
                    )));
                }
                return Ok(verified);
            }
            other => return Err(control_error(other)),
        }
    }
}

struct SenderSession {
    ledger: std::sync::Arc<Ledger>,
    pool: StreamPool<DataConnection>,
    acks: std::sync::Arc<AckRouter>,
    control: ControlSender,
    connector: std::sync::Arc<dyn DataStreamConnector>,
    settings: SenderSettings,
    ctx: std::sync::Arc<ChunkContext>,
    tasks: tokio::task::JoinSet<TaskResult>,
    parked: Vec<StreamHandle<DataConnection>>,
    summary: Summary,
    cancel: tokio_util::sync::CancellationToken,
}

impl SenderSession {
    fn spawn_connect(&mut self, id: u32, delay: std::time::Duration) {
        let connector = self.connector.clone();
        let timeout = self.settings.handshake_timeout;
        self.tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = match tokio::time::timeout(timeout, connector.connect(id)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "timed out opening data stream after {}",
                    humantime::format_duration(timeout)
                )),
            };
            TaskResult::Connected { id, result }
        });
    }

    /// Checks the chunks the receiver kept from a previous attempt against the source.
    async fn reconcile_resumed(&mut self, verified: Vec<(u64, Digest)>) -> Result<(), Error> {
        if verified.is_empty() {
            return Ok(());
        }
        let ledger = self.ledger.clone();
        let file = self.ctx.file.clone();
        let checksum = self.ctx.checksum;
        let (resumed, mismatched) = tokio::task::spawn_blocking(move || {
            let mut resumed = Vec::new();
            let mut mismatched = 0u64;
            for (index, digest) in verified {
                let Some(span) = ledger.span(index) else {
                    tracing::warn!("receiver reported unknown chunk {index} as verified");
                    continue;
                };
                let mut buf = vec![0u8; span.length as usize];
                file.read_exact_at(&mut buf, span.offset)
                    .with_context(|| format!("failed to read chunk {index} of the source"))?;
                if Digest::compute(checksum, &buf) == digest {
                    if ledger.mark_verified(index, digest) {
                        resumed.push(span.length);
                    }
                } else {
                    mismatched += 1;
                }
            }
            anyhow::Ok((resumed, mismatched))
        })
        .await
        .map_err(|error| Error::io(anyhow!("resume check task failed: {error}")))?
        .map_err(Error::io)?;
        if mismatched > 0 {
            tracing::warn!("{mismatched} resumed chunks differ from the source and will be resent");
        }
        let progress = common::get_progress();
        for length in resumed {
            self.summary.chunks_resumed += 1;
            self.summary.bytes_resumed += length;
            progress.chunks_resumed.inc();
            progress.bytes_resumed.add(length);
        }
        tracing::info!("resuming with {} chunks already verified", self.summary.chunks_resumed);
        Ok(())
    }

    fn dispatch(&mut self, mut handle: StreamHandle<DataConnection>) {
        let Some(assignment) = self.ledger.assign(handle.id, self.pool.live_streams()) else {
            // nothing this stream may take right now, retry after the next task finishes
            self.parked.push(handle);
            return;
        };
        let index = assignment.span.index;
        self.pool.assign(&mut handle, index);
        if assignment.attempt > 1 {
            self.summary.chunks_retried += 1;
            common::get_progress().chunks_retried.inc();
        }
        tracing::trace!(
            "chunk {index} attempt {} assigned to stream {}",
            assignment.attempt,
            handle.id
        );
        let ack = self.acks.register(index, assignment.attempt);
        self.tasks
            .spawn(send_chunk(self.ctx.clone(), handle, assignment, ack));
    }

    fn on_released(&mut self, released: Released, delay: std::time::Duration) {
        let progress = common::get_progress();
        match released {
            Released::Idle => {}
            Released::Reconnect { id, .. } => {
                progress.reconnects.inc();
                self.spawn_connect(id, delay);
            }
            Released::Retired => progress.streams_retired.inc(),
        }
    }

    fn on_chunk_report(&mut self, report: ChunkReport) -> Result<(), Error> {
        let ChunkReport {
            handle,
            assignment,
            result,
            rejected,
        } = report;
        let index = assignment.span.index;
        let failure = match result {
            Ok(digest) => {
                if self.ledger.complete(index, assignment.attempt, digest) {
                    let progress = common::get_progress();
                    self.summary.chunks_transferred += 1;
                    self.summary.bytes_transferred += assignment.span.length;
                    progress.chunks_verified.inc();
                    progress.bytes_verified.add(assignment.span.length);
                }
                self.pool.release(handle, StreamOutcome::Healthy);
                return Ok(());
            }
            Err(failure) => failure,
        };
        self.acks.forget(index, assignment.attempt);
        if failure.kind == FailureKind::Cancelled {
            drop(handle);
            return Ok(());
        }
        if rejected {
            self.summary.chunks_rejected += 1;
            common::get_progress().chunks_rejected.inc();
        }
        let stream = handle.id;
        let attempts = self
            .ledger
            .fail(index, assignment.attempt, stream, failure.clone());
        tracing::warn!(
            "chunk {index} attempt {} failed on stream {stream}: {failure}",
            assignment.attempt
        );
        match self.settings.retry.decide(failure.kind, attempts) {
            RetryDecision::Retry { delay } => {
                let released = self.pool.release(handle, StreamOutcome::Healthy);
                self.on_released(released, std::time::Duration::ZERO);
                if !delay.is_zero() {
                    self.ledger
                        .hold_until(index, tokio::time::Instant::now() + delay);
                    self.tasks.spawn(async move {
                        tokio::time::sleep(delay).await;
                        TaskResult::Wake
                    });
                }
            }
            RetryDecision::RetireStream { delay } => {
                let released = self
                    .pool
                    .release(handle, StreamOutcome::Dead(failure.to_string()));
                self.on_released(released, delay);
            }
            RetryDecision::Abort => {
                drop(handle);
                self.ledger.fail_permanently(index, failure.clone());
                tracing::error!("chunk {index} failed {attempts} times, aborting transfer");
                return Err(Error::new(ErrorKind::FatalAbort {
                    index,
                    attempts,
                    last: failure,
                }));
            }
        }
        Ok(())
    }

    fn on_task(&mut self, result: TaskResult) -> Result<(), Error> {
        match result {
            TaskResult::Chunk(report) => self.on_chunk_report(*report)?,
            TaskResult::Connected { id, result } => match result {
                Ok(conn) => {
                    tracing::debug!("data stream {id} connected");
                    self.pool.restore(id, conn);
                }
                Err(error) => {
                    tracing::warn!("failed to connect data stream {id}: {error:#}");
                    let released = self.pool.connect_failed(id, format!("{error:#}"));
                    let delay = match released {
                        Released::Reconnect { attempt, .. } => {
                            self.settings.retry.reconnect_delay(attempt)
                        }
                        _ => std::time::Duration::ZERO,
                    };
                    self.on_released(released, delay);
                }
            },
            TaskResult::Wake => {}
        }
        Ok(())
    }

    async fn schedule(
        &mut self,
        events: &mut tokio::sync::mpsc::Receiver<ControlEvent>,
    ) -> Result<(), Error> {
        for (id, _) in self.pool.pending_connects() {
            self.spawn_connect(id, std::time::Duration::ZERO);
        }
        loop {
            match self.ledger.outcome() {
                TransferOutcome::Completed => return Ok(()),
                TransferOutcome::Aborted => {
                    return Err(Error::protocol("transfer aborted with failed chunks"));
                }
                TransferOutcome::Running => {}
            }
            if self.pool.usable_streams() == 0 {
                return Err(Error::new(ErrorKind::ResourceExhausted));
            }
            let can_assign = self.ledger.has_assignable();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(Error::new(ErrorKind::Cancelled));
                }
                event = events.recv() => match event {
                    Some(ControlEvent::Message(ControlMessage::ChunkAck { index, attempt, outcome })) => {
                        if !self.acks.resolve(index, attempt, outcome) {
                            tracing::debug!("ignoring stale ack for chunk {index} attempt {attempt}");
                        }
                    }
                    other => return Err(control_error(other)),
                },
                Some(joined) = self.tasks.join_next() => {
                    let result = joined
                        .map_err(|error| Error::io(anyhow!("sender task failed: {error}")))?;
                    self.on_task(result)?;
                    for handle in std::mem::take(&mut self.parked) {
                        self.pool.release(handle, StreamOutcome::Healthy);
                    }
                }
                acquired = self.pool.acquire_idle_stream(), if can_assign => match acquired {
                    Ok(handle) => self.dispatch(handle),
                    Err(_) => return Err(Error::new(ErrorKind::ResourceExhausted)),
                },
            }
        }
    }

    async fn close_streams(&mut self) {
        self.tasks.shutdown().await;
        let mut handles = std::mem::take(&mut self.parked);
        handles.extend(self.pool.close());
        for mut handle in handles {
            if let Err(error) = handle.conn.close().await {
                tracing::debug!("failed to close data stream {}: {error:#}", handle.id);
            }
        }
    }

    async fn finish(
        &mut self,
        events: &mut tokio::sync::mpsc::Receiver<ControlEvent>,
    ) -> Result<(), Error> {
        self.close_streams().await;
        send_control(&self.control, &ControlMessage::Complete)
            .await
            .map_err(|error| Error::network(error.context("failed to send completion")))?;
        // the receiver syncs the whole file before confirming, only cancellation ends the wait
        let confirmation = async {
            loop {
                match events.recv().await {
                    Some(ControlEvent::Message(ControlMessage::Complete)) => return Ok(()),
                    Some(ControlEvent::Message(ControlMessage::ChunkAck { .. })) => continue,
                    other => return Err(control_error(other)),
                }
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::new(ErrorKind::Cancelled)),
            result = confirmation => result,
        }
    }

    async fn abort(&mut self, error: &Error) {
        let abandoned = self.ledger.abandon_in_flight(ChunkFailure::cancelled());
        if !abandoned.is_empty() {
            tracing::debug!("abandoned in-flight chunks {abandoned:?}");
        }
        self.acks.close();
        self.close_streams().await;
        if !matches!(error.kind, ErrorKind::PeerAbort(_)) {
            let abort = ControlMessage::Abort(error.abort_reason());
            if let Err(send_error) = send_control(&self.control, &abort).await {
                tracing::debug!("failed to send abort to the receiver: {send_error:#}");
            }
        }
    }

    fn summary(&self) -> Summary {
        let snapshot = self.ledger.snapshot();
        Summary {
            chunks_total: self.ledger.len(),
            chunks_verified: snapshot.verified,
            streams_retired: self.pool.retired_streams() as u64,
            reconnects: self.pool.reconnects(),
            ..self.summary
        }
    }
}

async fn open_source(
    source: &std::path::Path,
) -> Result<(std::path::PathBuf, std::fs::File, u64), Error> {
    let path = tokio::fs::canonicalize(source)
        .await
        .with_context(|| format!("failed to resolve source {source:?}"))
        .map_err(Error::io)?;
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("failed to open source {path:?}"))
        .map_err(Error::io)?;
    let metadata = file
        .metadata()
        .await
        .with_context(|| format!("failed to read metadata of {path:?}"))
        .map_err(Error::io)?;
    if !metadata.is_file() {
        return Err(Error::io(anyhow!("source {path:?} is not a regular file")));
    }
    Ok((path, file.into_std().await, metadata.len()))
}

/// Transfers `source` to the receiver at the other end of the control connection.
#[instrument(skip(control_send, control_recv, connector, settings, cancel))]
pub async fn run_sender(
    source: &std::path::Path,
    control_send: remote::streams::BoxedSendStream,
    control_recv: remote::streams::BoxedRecvStream,
    connector: std::sync::Arc<dyn DataStreamConnector>,
    settings: &SenderSettings,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Summary, Error> {
    if settings.stream_count == 0 {
        return Err(Error::protocol("at least one data stream is required"));
    }
    let (path, file, file_size) = open_source(source).await?;
    settings
        .chunk_policy
        .validate_for(file_size)
        .map_err(|error| Error::protocol(format!("invalid chunk policy: {error:#}")))?;
    let manifest = TransferManifest::new(
        &path,
        file_size,
        settings.chunk_policy,
        settings.checksum,
        settings.stream_count,
    );
    tracing::info!(
        "sending {path:?}: {} in {} chunks over {} streams",
        bytesize::ByteSize(file_size),
        manifest.chunk_count(),
        settings.stream_count
    );
    let control = shared_control_sender(control_send);
    let (mut events, reader) = spawn_control_reader(control_recv);
    let mut session = SenderSession {
        ledger: std::sync::Arc::new(Ledger::new(manifest.plan())),
        pool: StreamPool::new(settings.stream_count, settings.max_reconnects),
        acks: std::sync::Arc::new(AckRouter::new()),
        control,
        connector,
        settings: settings.clone(),
        ctx: std::sync::Arc::new(ChunkContext {
            file: std::sync::Arc::new(file),
            checksum: settings.checksum,
            chunk_timeout: settings.chunk_timeout,
            cancel: cancel.clone(),
        }),
        tasks: tokio::task::JoinSet::new(),
        parked: Vec::new(),
        summary: Summary::default(),
        cancel,
    };
    let result = async {
        let verified = tokio::select! {
            _ = session.cancel.cancelled() => return Err(Error::new(ErrorKind::Cancelled)),
            verified = exchange_manifest(
                &session.control,
                &mut events,
                &manifest,
                session.settings.handshake_timeout,
            ) => verified?,
        };
        session.reconcile_resumed(verified).await?;
        if session.ledger.outcome() == TransferOutcome::Running {
            session.schedule(&mut events).await?;
        }
        session.finish(&mut events).await
    }
    .await;
    if let Err(error) = &result {
        session.abort(error).await;
    }
    reader.abort();
    let summary = session.summary();
    match result {
        Ok(()) => {
            tracing::info!("transfer of {path:?} completed");
            Ok(summary)
        }
        Err(error) => Err(error
            .with_unfinished(session.ledger.unfinished())
            .with_summary(summary)),
    }
}
