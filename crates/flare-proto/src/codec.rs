//! Length-prefixed message framing with deadlines.
//!
//! Each frame is a 4-byte big-endian length followed by a bincode-encoded
//! [`FlareMessage`]. Reads refuse frames larger than the stream's configured
//! maximum before allocating for the body.

use crate::error::ProtoError;
use crate::message::FlareMessage;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// A bidirectional byte stream that can be torn down abnormally
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Abort the stream so the remote side sees a reset rather than a
    /// graceful end of stream
    fn reset(self);
}

impl Stream for tokio::io::DuplexStream {
    fn reset(self) {}
}

/// Message-oriented view of a [`Stream`]
#[derive(Debug)]
pub struct MessageStream<S> {
    inner: S,
    max_frame: usize,
    deadline: Option<Instant>,
}

impl<S: Stream> MessageStream<S> {
    /// Wrap a stream, accepting frames of at most `max_frame` bytes
    pub fn new(inner: S, max_frame: usize) -> Self {
        Self {
            inner,
            max_frame,
            deadline: None,
        }
    }

    /// Change the largest frame this side accepts
    pub fn set_max_frame(&mut self, max_frame: usize) {
        self.max_frame = max_frame;
    }

    /// Bound every subsequent read and write to finish within `timeout`
    /// from now
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Remove the deadline
    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    async fn bounded<T>(
        deadline: Option<Instant>,
        fut: impl Future<Output = io::Result<T>>,
    ) -> Result<T, ProtoError> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| ProtoError::Timeout)?
                .map_err(ProtoError::from),
            None => fut.await.map_err(ProtoError::from),
        }
    }

    /// Read one message
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Closed`] on a clean end of stream before a
    /// frame header, [`ProtoError::FrameTooLarge`] for oversized frames,
    /// [`ProtoError::Timeout`] past the deadline, and
    /// [`ProtoError::Decode`] for malformed bodies.
    pub async fn read_message(&mut self) -> Result<FlareMessage, ProtoError> {
        let deadline = self.deadline;

        let mut header = [0u8; 4];
        match Self::bounded(deadline, self.inner.read_exact(&mut header)).await {
            Ok(_) => {}
            Err(ProtoError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ProtoError::Closed);
            }
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            return Err(ProtoError::FrameTooLarge {
                size: len,
                max: self.max_frame,
            });
        }

        let mut body = vec![0u8; len];
        Self::bounded(deadline, self.inner.read_exact(&mut body)).await?;

        FlareMessage::from_bytes(&body)
    }

    /// Write one message and flush it
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Timeout`] past the deadline or
    /// [`ProtoError::Io`] if the stream fails.
    pub async fn write_message(&mut self, msg: &FlareMessage) -> Result<(), ProtoError> {
        let body = msg.to_bytes()?;
        let len = u32::try_from(body.len()).map_err(|_| ProtoError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);

        let deadline = self.deadline;
        let inner = &mut self.inner;
        Self::bounded(deadline, async move {
            inner.write_all(&frame).await?;
            inner.flush().await
        })
        .await
    }

    /// Gracefully close the write side
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails or misses the deadline.
    pub async fn close(mut self) -> Result<(), ProtoError> {
        let deadline = self.deadline;
        Self::bounded(deadline, self.inner.shutdown()).await
    }

    /// Abort the stream
    pub fn reset(self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_HANDSHAKE_FRAME;
    use tokio::io::duplex;

    fn pair() -> (
        MessageStream<tokio::io::DuplexStream>,
        MessageStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = duplex(64 * 1024);
        (
            MessageStream::new(a, MAX_HANDSHAKE_FRAME),
            MessageStream::new(b, MAX_HANDSHAKE_FRAME),
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = pair();
        let msg = FlareMessage::GetPeers {
            domain: "TCP".to_string(),
        };

        a.write_message(&msg).await.unwrap();
        assert_eq!(b.read_message().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_clean_eof_is_closed() {
        let (a, mut b) = pair();
        a.close().await.unwrap();
        assert!(matches!(b.read_message().await, Err(ProtoError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut raw, b) = duplex(64 * 1024);
        let mut b = MessageStream::new(b, MAX_HANDSHAKE_FRAME);
        raw.write_all(&(MAX_HANDSHAKE_FRAME as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            b.read_message().await,
            Err(ProtoError::FrameTooLarge { size, max }) if size == MAX_HANDSHAKE_FRAME + 1 && max == MAX_HANDSHAKE_FRAME
        ));
    }

    #[tokio::test]
    async fn test_garbage_body_rejected() {
        let (mut raw, b) = duplex(1024);
        let mut b = MessageStream::new(b, MAX_HANDSHAKE_FRAME);
        raw.write_all(&3u32.to_be_bytes()).await.unwrap();
        raw.write_all(&[0xff, 0xff, 0xff]).await.unwrap();

        let err = b.read_message().await.unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let (_a, mut b) = pair();
        b.set_timeout(Duration::from_secs(60));

        let err = b.read_message().await.unwrap_err();
        assert!(err.is_timeout());
    }
}
