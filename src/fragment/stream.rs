//! Stream wrapper that fragments the first outbound record.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use super::tls::{find_sni_offset, split_handshake_record};
use super::{plan_chunks, FragmentConfig};

enum WriteState {
    /// Nothing written yet; the next write gets fragmented.
    First,
    /// First write accepted, chunks still going out.
    Draining {
        chunks: VecDeque<Bytes>,
        sleep: Option<Pin<Box<Sleep>>>,
        needs_flush: bool,
        accepted: usize,
    },
    /// Plain passthrough.
    Passthrough,
}

/// Applies fragmentation (and optional TLS record splitting) to the first
/// write on `S`; later writes pass straight through.
///
/// A fragmented write completes only after its last chunk reached the inner
/// stream, so callers that retry `poll_write` with the same buffer (as
/// `write_all` and TLS engines do) see ordinary semantics.
pub struct FragmentingStream<S> {
    inner: S,
    config: FragmentConfig,
    record_split: Option<usize>,
    state: WriteState,
}

impl<S> FragmentingStream<S> {
    /// Wrap `inner`, fragmenting its first write with `config`.
    pub fn new(inner: S, config: FragmentConfig) -> Self {
        Self {
            inner,
            config,
            record_split: None,
            state: WriteState::First,
        }
    }

    /// Wrap `inner` without touching any write.
    pub fn passthrough(inner: S) -> Self {
        Self {
            inner,
            config: FragmentConfig::disabled(),
            record_split: None,
            state: WriteState::Passthrough,
        }
    }

    /// Also re-frame the first handshake record into records of at most
    /// `max_payload` bytes.
    pub fn with_record_split(mut self, max_payload: Option<usize>) -> Self {
        self.record_split = max_payload.filter(|n| *n > 0);
        if self.record_split.is_some() && matches!(self.state, WriteState::Passthrough) {
            self.state = WriteState::First;
        }
        self
    }

    /// Reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap, discarding any undrained chunks.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn start(&mut self, buf: &[u8]) {
        let sni = find_sni_offset(buf);
        let (data, boundary) = match self
            .record_split
            .and_then(|max| split_handshake_record(buf, max, sni))
        {
            Some((split, mapped)) => (Bytes::from(split), mapped),
            None => (Bytes::copy_from_slice(buf), sni),
        };
        let boundary = boundary.unwrap_or(data.len() / 2);

        let chunks: VecDeque<Bytes> = plan_chunks(data.len(), boundary, &self.config)
            .into_iter()
            .map(|range| data.slice(range))
            .collect();

        tracing::trace!(
            "fragmenting first write: {} bytes in {} chunks (boundary {})",
            data.len(),
            chunks.len(),
            boundary
        );

        self.state = WriteState::Draining {
            chunks,
            sleep: None,
            needs_flush: false,
            accepted: buf.len(),
        };
    }
}

impl<S: AsyncWrite + Unpin> FragmentingStream<S> {
    /// Push queued chunks out; returns the byte count the first write accepted.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let delay = self.config.delay;
        let WriteState::Draining {
            chunks,
            sleep,
            needs_flush,
            accepted,
        } = &mut self.state
        else {
            return Poll::Ready(Ok(0));
        };

        loop {
            if *needs_flush {
                ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
                *needs_flush = false;
                if !chunks.is_empty() && !delay.is_zero() {
                    *sleep = Some(Box::pin(tokio::time::sleep(delay)));
                }
            }

            if let Some(timer) = sleep.as_mut() {
                ready!(timer.as_mut().poll(cx));
                *sleep = None;
            }

            let Some(front) = chunks.front_mut() else {
                let accepted = *accepted;
                self.state = WriteState::Passthrough;
                return Poll::Ready(Ok(accepted));
            };

            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, front))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            front.advance(n);
            if front.is_empty() {
                chunks.pop_front();
                *needs_flush = true;
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.state {
            WriteState::Passthrough => Pin::new(&mut this.inner).poll_write(cx, buf),
            WriteState::First if buf.is_empty() => Poll::Ready(Ok(0)),
            WriteState::First => {
                this.start(buf);
                let accepted = ready!(this.poll_drain(cx))?;
                Poll::Ready(Ok(accepted.min(buf.len())))
            }
            WriteState::Draining { .. } => {
                let accepted = ready!(this.poll_drain(cx))?;
                Poll::Ready(Ok(accepted.min(buf.len())))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::super::testing::RecordingWriter;
    use super::super::tls::sample_client_hello;
    use super::*;

    #[tokio::test]
    async fn test_only_first_write_fragmented() {
        let config = FragmentConfig::new(4, 6, Duration::ZERO);
        let mut stream = FragmentingStream::new(RecordingWriter::default(), config);

        stream.write_all(&[1u8; 20]).await.unwrap();
        let first_writes = stream.get_ref().writes.len();
        assert!(first_writes > 1);

        stream.write_all(&[2u8; 20]).await.unwrap();
        let inner = stream.into_inner();
        assert_eq!(inner.writes.len(), first_writes + 1);
        assert_eq!(inner.writes.last().unwrap(), &vec![2u8; 20]);
    }

    #[tokio::test]
    async fn test_record_split_keeps_handshake_bytes() {
        let hello = sample_client_hello("blocked.example");
        let mut stream =
            FragmentingStream::passthrough(RecordingWriter::default()).with_record_split(Some(32));

        stream.write_all(&hello).await.unwrap();
        let out = stream.into_inner().concat();
        assert!(out.len() > hello.len());

        let mut payload = Vec::new();
        let mut pos = 0;
        while pos < out.len() {
            let len = u16::from_be_bytes([out[pos + 3], out[pos + 4]]) as usize;
            payload.extend_from_slice(&out[pos + 5..pos + 5 + len]);
            pos += 5 + len;
        }
        assert_eq!(payload, &hello[5..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_over_duplex() {
        let (client, mut server) = tokio::io::duplex(64);
        let config = FragmentConfig::new(3, 5, Duration::from_millis(10));
        let mut stream = FragmentingStream::new(client, config);

        let payload: Vec<u8> = (0..200u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            stream.write_all(&payload).await.unwrap();
            stream.write_all(b"tail").await.unwrap();
            stream.shutdown().await.unwrap();
            stream
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();

        assert_eq!(&received[..200], &expected[..]);
        assert_eq!(&received[200..], b"tail");
    }
}
