//! Failure taxonomy
//!
//! Chunk-level failures ([`ChunkFailure`]) are recoverable events fed to the retry policy and
//! carried in negative acknowledgements. Transfer-level failures ([`Error`]) end the transfer;
//! they carry the [`Summary`] of what was done, the chunks that never completed and, when the
//! destination can be resumed, the location of the resume sidecar.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Reading the source or writing the destination failed
    Io,
    /// Connection reset, closed or truncated
    Network,
    /// Chunk deadline exceeded
    Timeout,
    /// Digest mismatch
    Integrity,
    /// Peer sent something that violates the protocol
    Protocol,
    /// Transfer cancelled while the chunk was in flight
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Io => "io",
            FailureKind::Network => "network",
            FailureKind::Timeout => "timeout",
            FailureKind::Integrity => "integrity",
            FailureKind::Protocol => "protocol",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} failure: {reason}")]
pub struct ChunkFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl ChunkFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn io(error: impl std::fmt::Display) -> Self {
        Self::new(FailureKind::Io, format!("{error:#}"))
    }

    pub fn network(error: impl std::fmt::Display) -> Self {
        Self::new(FailureKind::Network, format!("{error:#}"))
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "transfer cancelled")
    }
}

/// Why a peer ended the transfer, sent in `ControlMessage::Abort`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum AbortReason {
    #[error("cancelled")]
    Cancelled,
    #[error("chunk {index} failed after {attempts} attempts: {last}")]
    ChunkFailed {
        index: u64,
        attempts: u32,
        last: ChunkFailure,
    },
    #[error("no data streams left")]
    StreamsExhausted,
    #[error("network error: {0}")]
    Network(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl AbortReason {
    pub fn is_retryable(&self) -> bool {
        match self {
            AbortReason::Cancelled | AbortReason::StreamsExhausted | AbortReason::Network(_) => {
                true
            }
            AbortReason::ChunkFailed { last, .. } => {
                matches!(last.kind, FailureKind::Network | FailureKind::Timeout)
            }
            AbortReason::Io(_) | AbortReason::Protocol(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("I/O error: {0:#}")]
    Io(anyhow::Error),
    #[error("network error: {0:#}")]
    Network(anyhow::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("all data streams were retired before the transfer finished")]
    ResourceExhausted,
    #[error("chunk {index} failed permanently after {attempts} attempts: {last}")]
    FatalAbort {
        index: u64,
        attempts: u32,
        last: ChunkFailure,
    },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("peer aborted the transfer: {0}")]
    PeerAbort(AbortReason),
}

/// Transfer-level failure.
///
/// Like the summary-carrying errors of the other tools, `Display` shows the cause only; the
/// summary, unfinished chunks and sidecar location are available as fields.
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct Error {
    pub kind: ErrorKind,
    /// Chunk indices that never reached Verified
    pub unfinished: Vec<u64>,
    /// Resume sidecar left behind for a later `--resume`
    pub sidecar: Option<std::path::PathBuf>,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            unfinished: Vec::new(),
            sidecar: None,
            summary: Summary::default(),
        }
    }

    pub fn io(error: anyhow::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }

    pub fn network(error: anyhow::Error) -> Self {
        Self::new(ErrorKind::Network(error))
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol(reason.into()))
    }

    #[must_use]
    pub fn with_summary(mut self, summary: Summary) -> Self {
        self.summary = summary;
        self
    }

    #[must_use]
    pub fn with_unfinished(mut self, unfinished: Vec<u64>) -> Self {
        self.unfinished = unfinished;
        self
    }

    #[must_use]
    pub fn with_sidecar(mut self, sidecar: Option<std::path::PathBuf>) -> Self {
        self.sidecar = sidecar;
        self
    }

    /// Whether rerunning the same command (with `--resume`) can be expected to succeed.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ErrorKind::Network(_) | ErrorKind::ResourceExhausted | ErrorKind::Cancelled => true,
            ErrorKind::FatalAbort { last, .. } => {
                matches!(last.kind, FailureKind::Network | FailureKind::Timeout)
            }
            ErrorKind::PeerAbort(reason) => reason.is_retryable(),
            ErrorKind::Io(_) | ErrorKind::Protocol(_) => false,
        }
    }

    /// Process exit code: 2 for retryable failures, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_retryable() { 2 } else { 1 }
    }

    /// What to tell the peer when this error ends the transfer locally.
    pub fn abort_reason(&self) -> AbortReason {
        match &self.kind {
            ErrorKind::Io(error) => AbortReason::Io(format!("{error:#}")),
            ErrorKind::Network(error) => AbortReason::Network(format!("{error:#}")),
            ErrorKind::Protocol(reason) => AbortReason::Protocol(reason.clone()),
            ErrorKind::ResourceExhausted => AbortReason::StreamsExhausted,
            ErrorKind::FatalAbort {
                index,
                attempts,
                last,
            } => AbortReason::ChunkFailed {
                index: *index,
                attempts: *attempts,
                last: last.clone(),
            },
            ErrorKind::Cancelled => AbortReason::Cancelled,
            ErrorKind::PeerAbort(reason) => reason.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub chunks_total: u64,
    pub chunks_verified: u64,
    /// Chunks reused from the resume sidecar
    pub chunks_resumed: u64,
    /// Chunks that crossed the wire and were verified
    pub chunks_transferred: u64,
    pub chunks_retried: u64,
    /// Negative acknowledgements received (sender) or sent (receiver)
    pub chunks_rejected: u64,
    pub bytes_transferred: u64,
    pub bytes_resumed: u64,
    pub streams_retired: u64,
    pub reconnects: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            chunks_total: self.chunks_total + other.chunks_total,
            chunks_verified: self.chunks_verified + other.chunks_verified,
            chunks_resumed: self.chunks_resumed + other.chunks_resumed,
            chunks_transferred: self.chunks_transferred + other.chunks_transferred,
            chunks_retried: self.chunks_retried + other.chunks_retried,
            chunks_rejected: self.chunks_rejected + other.chunks_rejected,
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            bytes_resumed: self.bytes_resumed + other.bytes_resumed,
            streams_retired: self.streams_retired + other.streams_retired,
            reconnects: self.reconnects + other.reconnects,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "chunks verified: {}/{}\n\
            chunks resumed: {}\n\
            chunks transferred: {}\n\
            chunks retried: {}\n\
            chunks rejected: {}\n\
            bytes transferred: {}\n\
            bytes resumed: {}\n\
            streams retired: {}\n\
            reconnects: {}",
            self.chunks_verified,
            self.chunks_total,
            self.chunks_resumed,
            self.chunks_transferred,
            self.chunks_retried,
            self.chunks_rejected,
            bytesize::ByteSize(self.bytes_transferred),
            bytesize::ByteSize(self.bytes_resumed),
            self.streams_retired,
            self.reconnects,
        )
    }
}
