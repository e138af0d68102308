//! Control channel messages and data frame header
//!
//! The control connection carries [`ControlMessage`]s in both directions: the manifest exchange
//! (with the resumed chunks in batches), per-chunk acknowledgements from the receiver and the final `Complete`/`Abort`. Data streams
//! only carry [`DataFrameHeader`] frames, each followed by `length` raw payload bytes.

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{AbortReason, ChunkFailure};
use crate::manifest::TransferManifest;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkOutcome {
    Verified,
    Rejected(ChunkFailure),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Sent by the source, echoed back by the destination once accepted
    Manifest(TransferManifest),
    /// One batch of chunks the destination already holds from a previous attempt
    ResumedChunks(Vec<(u64, Digest)>),
    /// Destination is ready for data; `resumed` counts the entries of all `ResumedChunks` batches
    ManifestAck { resumed: u64 },
    ChunkAck {
        index: u64,
        attempt: u32,
        outcome: ChunkOutcome,
    },
    Abort(AbortReason),
    /// Source: every chunk is acknowledged. Destination: data is durable, sidecar removed.
    Complete,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Manifest(_) => "Manifest",
            ControlMessage::ResumedChunks(_) => "ResumedChunks",
            ControlMessage::ManifestAck { .. } => "ManifestAck",
            ControlMessage::ChunkAck { .. } => "ChunkAck",
            ControlMessage::Abort(_) => "Abort",
            ControlMessage::Complete => "Complete",
        }
    }
}

/// Entries per `ResumedChunks` message, keeps every frame far below the codec's frame limit.
pub const RESUMED_BATCH_LEN: usize = 16 * 1024;

/// Sends the resumed chunks in bounded batches followed by the `ManifestAck` closing the list.
pub async fn send_resumed(sender: &ControlSender, verified: &[(u64, Digest)]) -> anyhow::Result<()> {
    for batch in verified.chunks(RESUMED_BATCH_LEN) {
        send_control(sender, &ControlMessage::ResumedChunks(batch.to_vec())).await?;
    }
    send_control(
        sender,
        &ControlMessage::ManifestAck {
            resumed: verified.len() as u64,
        },
    )
    .await
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrameHeader {
    pub index: u64,
    pub attempt: u32,
    pub length: u64,
    pub digest: Digest,
}

pub type ControlSender = remote::streams::BoxedSharedSendStream;

pub fn shared_control_sender(send: remote::streams::BoxedSendStream) -> ControlSender {
    std::sync::Arc::new(tokio::sync::Mutex::new(send))
}

pub async fn send_control(sender: &ControlSender, message: &ControlMessage) -> anyhow::Result<()> {
    sender.lock().await.send_control_message(message).await
}

#[derive(Debug)]
pub enum ControlEvent {
    Message(ControlMessage),
    /// Peer closed the control connection
    Closed,
    Failed(anyhow::Error),
}

/// Reads the control connection on a dedicated task.
///
/// `recv_object` is not cancel-safe, so it never runs inside a `select!`; consumers select on
/// the returned channel instead.
pub fn spawn_control_reader(
    mut recv: remote::streams::BoxedRecvStream,
) -> (
    tokio::sync::mpsc::Receiver<ControlEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = tokio::sync::mpsc::channel(1024);
    let task = tokio::spawn(async move {
        loop {
            let event = match recv.recv_object::<ControlMessage>().await {
                Ok(Some(message)) => ControlEvent::Message(message),
                Ok(None) => ControlEvent::Closed,
                Err(error) => ControlEvent::Failed(error),
            };
            let last = !matches!(event, ControlEvent::Message(_));
            if tx.send(event).await.is_err() || last {
                break;
            }
        }
        tracing::debug!("control reader finished");
    });
    (rx, task)
}

type Waiters = std::collections::HashMap<(u64, u32), tokio::sync::oneshot::Sender<ChunkOutcome>>;

/// Routes chunk acknowledgements from the control reader to the worker awaiting them.
#[derive(Debug, Default)]
pub struct AckRouter {
    waiters: std::sync::Mutex<Waiters>,
}

impl AckRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Must be called before the frame is sent so that a fast ack is never missed.
    pub fn register(
        &self,
        index: u64,
        attempt: u32,
    ) -> tokio::sync::oneshot::Receiver<ChunkOutcome> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.lock().insert((index, attempt), tx);
        rx
    }

    /// Delivers an acknowledgement; false if nobody waits for it (stale or unknown attempt).
    pub fn resolve(&self, index: u64, attempt: u32, outcome: ChunkOutcome) -> bool {
        match self.lock().remove(&(index, attempt)) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, index: u64, attempt: u32) {
        self.lock().remove(&(index, attempt));
    }

    /// Drops all waiters; they observe a closed channel.
    pub fn close(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acks_reach_the_registered_attempt_only() {
        let router = AckRouter::new();
        let first = router.register(3, 1);
        let second = router.register(3, 2);
        assert!(router.resolve(3, 2, ChunkOutcome::Verified));
        assert_eq!(second.await.unwrap(), ChunkOutcome::Verified);
        assert!(!router.resolve(3, 2, ChunkOutcome::Verified));
        router.close();
        assert!(first.await.is_err());
        assert!(!router.resolve(9, 1, ChunkOutcome::Verified));
    }

    #[tokio::test]
    async fn control_reader_forwards_messages_then_close() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut send, _) = remote::streams::boxed_pair(tokio::io::empty(), a);
        let (_, recv) = remote::streams::boxed_pair(b, tokio::io::sink());
        let (mut events, task) = spawn_control_reader(recv);
        send.send_control_message(&ControlMessage::ChunkAck {
            index: 1,
            attempt: 1,
            outcome: ChunkOutcome::Verified,
        })
        .await?;
        send.send_control_message(&ControlMessage::Complete).await?;
        send.close().await?;
        drop(send);
        assert!(matches!(
            events.recv().await,
            Some(ControlEvent::Message(ControlMessage::ChunkAck { index: 1, .. }))
        ));
        assert!(matches!(
            events.recv().await,
            Some(ControlEvent::Message(ControlMessage::Complete))
        ));
        assert!(matches!(events.recv().await, Some(ControlEvent::Closed)));
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn long_resume_lists_are_split_into_frames() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (send, _) = remote::streams::boxed_pair(tokio::io::empty(), a);
        let (_, recv) = remote::streams::boxed_pair(b, tokio::io::sink());
        let sender = shared_control_sender(send);
        let (mut events, _task) = spawn_control_reader(recv);
        let digest = Digest::compute(crate::digest::ChecksumAlgorithm::Sha256, b"chunk");
        // a single frame of this many entries exceeds the 8 MiB frame limit
        let verified: Vec<(u64, Digest)> = (0..250_000).map(|index| (index, digest)).collect();
        let writer = tokio::spawn({
            let sender = sender.clone();
            let verified = verified.clone();
            async move { send_resumed(&sender, &verified).await }
        });
        let mut received = Vec::new();
        loop {
            match events.recv().await {
                Some(ControlEvent::Message(ControlMessage::ResumedChunks(batch))) => {
                    assert!(batch.len() <= RESUMED_BATCH_LEN);
                    received.extend(batch);
                }
                Some(ControlEvent::Message(ControlMessage::ManifestAck { resumed })) => {
                    assert_eq!(resumed, 250_000);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        writer.await??;
        assert_eq!(received, verified);
        Ok(())
    }
}
