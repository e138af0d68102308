use bytes::Buf;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

/// Framed send stream for length-delimited messages.
///
/// Generic over the underlying writer type - works with TCP halves, in-memory duplex pipes or
/// any other AsyncWrite.
#[derive(Debug)]
pub struct SendStream<W = BoxedWrite> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    /// Queues one bincode-encoded frame, flushing only if the codec buffer fills up.
    pub async fn send_batch_message<T: serde::Serialize>(&mut self, obj: &T) -> anyhow::Result<()> {
        let bytes = bincode::serialize(obj)?;
        self.framed.feed(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Sends one bincode-encoded frame and flushes it to the peer.
    pub async fn send_control_message<T: serde::Serialize>(
        &mut self,
        obj: &T,
    ) -> anyhow::Result<()> {
        self.send_batch_message(obj).await?;
        SinkExt::<bytes::Bytes>::flush(&mut self.framed).await?;
        Ok(())
    }

    /// Sends a header frame followed by `payload` as raw bytes.
    ///
    /// The header is flushed before the payload is written so that the payload never ends up
    /// interleaved with codec-buffered data.
    #[instrument(level = "trace", skip(self, obj, payload), fields(len = payload.len()))]
    pub async fn send_message_with_payload<T: serde::Serialize>(
        &mut self,
        obj: &T,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.send_control_message(obj).await?;
        let data_stream = self.framed.get_mut();
        data_stream.write_all(payload).await?;
        data_stream.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        SinkExt::<bytes::Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

pub type SharedSendStream<W = BoxedWrite> = std::sync::Arc<tokio::sync::Mutex<SendStream<W>>>;

/// Type alias for boxed write stream (TCP half, duplex pipe, test wrappers)
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;
/// Type alias for boxed read stream
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
/// Send stream over boxed writer
pub type BoxedSendStream = SendStream<BoxedWrite>;
/// Recv stream over boxed reader
pub type BoxedRecvStream = RecvStream<BoxedRead>;
/// Shared send stream over boxed writer
pub type BoxedSharedSendStream = SharedSendStream<BoxedWrite>;

/// Framed receive stream for length-delimited messages.
#[derive(Debug)]
pub struct RecvStream<R = BoxedRead> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    /// Reads the next frame; `Ok(None)` means the peer closed the stream at a frame boundary.
    ///
    /// Not cancel-safe: dropping the future mid-frame loses the partially read frame.
    pub async fn recv_object<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = bincode::deserialize(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }

    /// Fills `buf` with exactly `buf.len()` raw bytes following the last frame.
    ///
    /// Bytes the codec already buffered are consumed first, the rest is read straight from the
    /// underlying stream, leaving it positioned at the next frame.
    #[instrument(level = "trace", skip(self, buf), fields(len = buf.len()))]
    pub async fn recv_payload(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let read_buffer = self.framed.read_buffer_mut();
        let buffered = read_buffer.len().min(buf.len());
        if buffered > 0 {
            buf[..buffered].copy_from_slice(&read_buffer[..buffered]);
            read_buffer.advance(buffered);
        }
        if buffered == buf.len() {
            return Ok(());
        }
        let data_stream = self.framed.get_mut();
        let mut filled = buffered;
        while filled < buf.len() {
            let n = data_stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "truncated payload: expected {} bytes, got {}",
                        buf.len(),
                        filled
                    ),
                ));
            }
            filled += n;
        }
        Ok(())
    }
}

/// Boxes both halves of a connection so that callers don't care about the transport.
pub fn boxed_pair<R, W>(read: R, write: W) -> (BoxedSendStream, BoxedRecvStream)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    (
        SendStream::new(Box::new(write) as BoxedWrite),
        RecvStream::new(Box::new(read) as BoxedRead),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Header {
        index: u64,
        length: u64,
    }

    #[tokio::test]
    async fn payload_follows_header_and_next_frame_follows_payload() -> anyhow::Result<()> {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let mut send = SendStream::new(client);
        let mut recv = RecvStream::new(server);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        send.send_message_with_payload(
            &Header {
                index: 7,
                length: payload.len() as u64,
            },
            &payload,
        )
        .await?;
        send.send_control_message(&Header {
            index: 8,
            length: 0,
        })
        .await?;
        let header: Header = recv.recv_object().await?.unwrap();
        assert_eq!(header.index, 7);
        let mut buf = vec![0u8; header.length as usize];
        recv.recv_payload(&mut buf).await?;
        assert_eq!(buf, payload);
        let next: Header = recv.recv_object().await?.unwrap();
        assert_eq!(next.index, 8);
        send.close().await?;
        assert!(recv.recv_object::<Header>().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() -> anyhow::Result<()> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut send = SendStream::new(client);
        let mut recv = RecvStream::new(server);
        send.send_control_message(&Header {
            index: 1,
            length: 100,
        })
        .await?;
        send.framed.get_mut().write_all(&[1u8; 40]).await?;
        drop(send);
        let header: Header = recv.recv_object().await?.unwrap();
        let mut buf = vec![0u8; header.length as usize];
        let err = recv.recv_payload(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        Ok(())
    }
}
