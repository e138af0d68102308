//! Authoritative per-chunk transfer state
//!
//! Every chunk planned from the manifest has exactly one record for the whole transfer. Records
//! move `Pending -> InFlight -> Verified`, or back to `Pending` after a failure, or to
//! `PermanentlyFailed` once the retry policy gives up. All transitions happen under one mutex in
//! a single critical section; the lock is never held across an `.await`.

use crate::digest::Digest;
use crate::error::ChunkFailure;
use crate::planner::ChunkSpan;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight { stream: u32, attempt: u32 },
    Verified { digest: Digest },
    PermanentlyFailed,
}

#[derive(Debug)]
struct ChunkRecord {
    span: ChunkSpan,
    state: ChunkState,
    attempts: u32,
    last_failure: Option<ChunkFailure>,
    // stream the chunk last failed on, other streams get it first
    avoid_stream: Option<u32>,
    ready_at: Option<tokio::time::Instant>,
}

impl ChunkRecord {
    fn is_ready(&self, now: tokio::time::Instant) -> bool {
        self.state == ChunkState::Pending && self.ready_at.is_none_or(|at| at <= now)
    }
}

/// A chunk handed to a stream, `attempt` identifies this particular try.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub span: ChunkSpan,
    pub attempt: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Running,
    Completed,
    Aborted,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub pending: u64,
    pub in_flight: u64,
    pub verified: u64,
    pub failed: u64,
    pub verified_bytes: u64,
}

#[derive(Debug)]
pub struct Ledger {
    chunks: std::sync::Mutex<Vec<ChunkRecord>>,
}

impl Ledger {
    pub fn new(spans: Vec<ChunkSpan>) -> Self {
        let chunks = spans
            .into_iter()
            .map(|span| ChunkRecord {
                span,
                state: ChunkState::Pending,
                attempts: 0,
                last_failure: None,
                avoid_stream: None,
                ready_at: None,
            })
            .collect();
        Self {
            chunks: std::sync::Mutex::new(chunks),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChunkRecord>> {
        self.chunks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn len(&self) -> u64 {
        self.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Hands the lowest-index ready chunk to `stream`.
    ///
    /// While more than one stream is live, chunks that last failed on `stream` are left for the
    /// others.
    pub fn assign(&self, stream: u32, live_streams: usize) -> Option<Assignment> {
        let now = tokio::time::Instant::now();
        let mut chunks = self.lock();
        let record = chunks.iter_mut().find(|record| {
            record.is_ready(now) && (live_streams <= 1 || record.avoid_stream != Some(stream))
        })?;
        record.attempts += 1;
        record.ready_at = None;
        record.state = ChunkState::InFlight {
            stream,
            attempt: record.attempts,
        };
        Some(Assignment {
            span: record.span,
            attempt: record.attempts,
        })
    }

    /// Marks the chunk Verified if `attempt` is still the one in flight; stale acks are ignored.
    pub fn complete(&self, index: u64, attempt: u32, digest: Digest) -> bool {
        let mut chunks = self.lock();
        match chunks.get_mut(index as usize) {
            Some(record)
                if matches!(record.state, ChunkState::InFlight { attempt: a, .. } if a == attempt) =>
            {
                record.state = ChunkState::Verified { digest };
                record.last_failure = None;
                true
            }
            _ => false,
        }
    }

    /// Requeues an in-flight chunk after a failed attempt, returns the attempts made so far.
    pub fn fail(&self, index: u64, attempt: u32, stream: u32, failure: ChunkFailure) -> u32 {
        let mut chunks = self.lock();
        let Some(record) = chunks.get_mut(index as usize) else {
            return 0;
        };
        if matches!(record.state, ChunkState::InFlight { attempt: a, .. } if a == attempt) {
            record.state = ChunkState::Pending;
            record.avoid_stream = Some(stream);
            record.last_failure = Some(failure);
        }
        record.attempts
    }

    /// Keeps a pending chunk from being assigned before `instant` (retry backoff).
    pub fn hold_until(&self, index: u64, instant: tokio::time::Instant) {
        if let Some(record) = self.lock().get_mut(index as usize)
            && record.state == ChunkState::Pending
        {
            record.ready_at = Some(instant);
        }
    }

    pub fn fail_permanently(&self, index: u64, failure: ChunkFailure) {
        if let Some(record) = self.lock().get_mut(index as usize) {
            record.state = ChunkState::PermanentlyFailed;
            record.last_failure = Some(failure);
        }
    }

    /// Records a chunk verified outside of an assignment (resume, receiver side).
    /// Returns false if it was already Verified.
    pub fn mark_verified(&self, index: u64, digest: Digest) -> bool {
        let mut chunks = self.lock();
        match chunks.get_mut(index as usize) {
            Some(record) if !matches!(record.state, ChunkState::Verified { .. }) => {
                record.state = ChunkState::Verified { digest };
                record.last_failure = None;
                true
            }
            _ => false,
        }
    }

    /// Returns a Verified chunk to Pending, e.g. when a resumed digest does not match the source.
    pub fn requeue(&self, index: u64) {
        if let Some(record) = self.lock().get_mut(index as usize)
            && matches!(record.state, ChunkState::Verified { .. })
        {
            record.state = ChunkState::Pending;
        }
    }

    /// Remembers a failure without changing the state (receiver side rejections).
    pub fn note_failure(&self, index: u64, failure: ChunkFailure) {
        if let Some(record) = self.lock().get_mut(index as usize) {
            record.last_failure = Some(failure);
        }
    }

    /// Requeues every in-flight chunk, returns their indices.
    pub fn abandon_in_flight(&self, failure: ChunkFailure) -> Vec<u64> {
        let mut abandoned = Vec::new();
        for record in self.lock().iter_mut() {
            if matches!(record.state, ChunkState::InFlight { .. }) {
                record.state = ChunkState::Pending;
                record.last_failure = Some(failure.clone());
                abandoned.push(record.span.index);
            }
        }
        abandoned
    }

    pub fn outcome(&self) -> TransferOutcome {
        let chunks = self.lock();
        if chunks
            .iter()
            .any(|record| record.state == ChunkState::PermanentlyFailed)
        {
            TransferOutcome::Aborted
        } else if chunks
            .iter()
            .all(|record| matches!(record.state, ChunkState::Verified { .. }))
        {
            TransferOutcome::Completed
        } else {
            TransferOutcome::Running
        }
    }

    /// Indices of all chunks not yet Verified.
    pub fn unfinished(&self) -> Vec<u64> {
        self.lock()
            .iter()
            .filter(|record| !matches!(record.state, ChunkState::Verified { .. }))
            .map(|record| record.span.index)
            .collect()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::default();
        for record in self.lock().iter() {
            match record.state {
                ChunkState::Pending => snapshot.pending += 1,
                ChunkState::InFlight { .. } => snapshot.in_flight += 1,
                ChunkState::Verified { .. } => {
                    snapshot.verified += 1;
                    snapshot.verified_bytes += record.span.length;
                }
                ChunkState::PermanentlyFailed => snapshot.failed += 1,
            }
        }
        snapshot
    }

    pub fn state(&self, index: u64) -> Option<ChunkState> {
        self.lock().get(index as usize).map(|record| record.state)
    }

    pub fn span(&self, index: u64) -> Option<ChunkSpan> {
        self.lock().get(index as usize).map(|record| record.span)
    }

    #[cfg(test)]
    fn last_failure(&self, index: u64) -> Option<ChunkFailure> {
        self.lock()
            .get(index as usize)
            .and_then(|record| record.last_failure.clone())
    }

    /// Whether some chunk could be assigned right now (ignoring stream preferences).
    pub fn has_assignable(&self) -> bool {
        let now = tokio::time::Instant::now();
        self.lock().iter().any(|record| record.is_ready(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ChecksumAlgorithm;
    use crate::error::FailureKind;
    use crate::planner::{ChunkPolicy, plan};

    fn ledger(chunks: u64) -> Ledger {
        Ledger::new(plan(chunks * 100, &ChunkPolicy::Fixed { size: 100 }))
    }

    fn digest(byte: u8) -> Digest {
        Digest::compute(ChecksumAlgorithm::Crc32, &[byte])
    }

    #[test]
    fn assigns_in_ascending_order_and_completes() {
        let ledger = ledger(3);
        let a = ledger.assign(0, 2).unwrap();
        let b = ledger.assign(1, 2).unwrap();
        assert_eq!((a.span.index, a.attempt), (0, 1));
        assert_eq!((b.span.index, b.attempt), (1, 1));
        assert_eq!(
            ledger.state(0),
            Some(ChunkState::InFlight {
                stream: 0,
                attempt: 1
            })
        );
        assert!(ledger.complete(0, 1, digest(0)));
        assert!(ledger.complete(1, 1, digest(1)));
        assert_eq!(ledger.outcome(), TransferOutcome::Running);
        let c = ledger.assign(0, 2).unwrap();
        assert!(ledger.complete(c.span.index, c.attempt, digest(2)));
        assert!(ledger.assign(0, 2).is_none());
        assert_eq!(ledger.outcome(), TransferOutcome::Completed);
        assert!(ledger.unfinished().is_empty());
        assert_eq!(ledger.snapshot().verified_bytes, 300);
    }

    #[test]
    fn stale_attempts_are_ignored() {
        let ledger = ledger(1);
        let first = ledger.assign(0, 1).unwrap();
        ledger.fail(
            0,
            first.attempt,
            0,
            ChunkFailure::new(FailureKind::Timeout, "slow"),
        );
        let second = ledger.assign(1, 1).unwrap();
        assert_eq!(second.attempt, 2);
        // late ack of the first attempt must not complete the chunk
        assert!(!ledger.complete(0, first.attempt, digest(0)));
        assert!(ledger.complete(0, second.attempt, digest(0)));
    }

    #[test]
    fn failed_chunk_prefers_a_different_stream() {
        let ledger = ledger(2);
        let a = ledger.assign(0, 2).unwrap();
        let attempts = ledger.fail(
            a.span.index,
            a.attempt,
            0,
            ChunkFailure::new(FailureKind::Integrity, "digest mismatch"),
        );
        assert_eq!(attempts, 1);
        assert_eq!(ledger.state(0), Some(ChunkState::Pending));
        // stream 0 skips chunk 0 while another stream is live
        assert_eq!(ledger.assign(0, 2).unwrap().span.index, 1);
        assert_eq!(ledger.assign(1, 2).unwrap().span.index, 0);
    }

    #[test]
    fn single_live_stream_takes_its_own_failures() {
        let ledger = ledger(1);
        let a = ledger.assign(0, 1).unwrap();
        ledger.fail(0, a.attempt, 0, ChunkFailure::network("reset"));
        assert_eq!(ledger.assign(0, 1).unwrap().attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn held_chunks_wait_for_backoff() {
        let ledger = ledger(1);
        let a = ledger.assign(0, 1).unwrap();
        ledger.fail(0, a.attempt, 0, ChunkFailure::io("EIO"));
        ledger.hold_until(
            0,
            tokio::time::Instant::now() + std::time::Duration::from_millis(100),
        );
        assert!(!ledger.has_assignable());
        assert!(ledger.assign(0, 1).is_none());
        tokio::time::advance(std::time::Duration::from_millis(100)).await;
        assert!(ledger.has_assignable());
        assert!(ledger.assign(0, 1).is_some());
    }

    #[test]
    fn permanent_failure_aborts() {
        let ledger = ledger(2);
        ledger.mark_verified(1, digest(1));
        ledger.fail_permanently(0, ChunkFailure::new(FailureKind::Integrity, "bad"));
        assert_eq!(ledger.outcome(), TransferOutcome::Aborted);
        assert_eq!(ledger.unfinished(), vec![0]);
        assert_eq!(ledger.last_failure(0).unwrap().kind, FailureKind::Integrity);
    }

    #[test]
    fn abandon_and_requeue() {
        let ledger = ledger(3);
        ledger.assign(0, 3).unwrap();
        ledger.assign(1, 3).unwrap();
        assert!(ledger.mark_verified(2, digest(2)));
        assert!(!ledger.mark_verified(2, digest(2)));
        assert_eq!(ledger.abandon_in_flight(ChunkFailure::cancelled()), vec![0, 1]);
        assert_eq!(ledger.snapshot().pending, 2);
        ledger.requeue(2);
        assert_eq!(ledger.snapshot().pending, 3);
        assert_eq!(ledger.snapshot().verified, 0);
    }

    #[test]
    fn empty_ledger_is_complete() {
        let ledger = Ledger::new(Vec::new());
        assert!(ledger.is_empty());
        assert_eq!(ledger.outcome(), TransferOutcome::Completed);
        assert!(!ledger.has_assignable());
    }
}
