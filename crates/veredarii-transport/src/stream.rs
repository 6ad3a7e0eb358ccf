use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::PeerId;

/// Versioned identifier of a stream protocol, e.g. `/veredarii/auth/1.0.0`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StreamProtocol(&'static str);

impl StreamProtocol {
    pub const fn new(id: &'static str) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Reset flag shared by both ends of one stream.
///
/// Once tripped, every read and write on either end fails with
/// `ConnectionReset`, including ones already parked on the pipe.
#[derive(Default)]
pub(crate) struct ResetState {
    reset: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl ResetState {
    pub(crate) fn trip(&self) {
        self.reset.store(true, Ordering::SeqCst);
        let wakers = std::mem::take(&mut *self.wakers.lock().unwrap_or_else(PoisonError::into_inner));
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    fn park(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}

fn reset_error() -> io::Error {
    io::Error::from(io::ErrorKind::ConnectionReset)
}

/// A bidirectional byte stream to one remote peer, negotiated for one protocol.
///
/// Dropping a stream closes it gracefully: the remote end reads end of
/// stream. [`Stream::reset`] aborts it instead and the remote end sees an
/// error.
pub struct Stream {
    remote: PeerId,
    protocol: StreamProtocol,
    io: Box<dyn StreamIo>,
    state: Arc<ResetState>,
}

impl Stream {
    pub fn new<T>(remote: PeerId, protocol: StreamProtocol, io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_state(remote, protocol, io, Arc::default())
    }

    pub(crate) fn with_state<T>(
        remote: PeerId,
        protocol: StreamProtocol,
        io: T,
        state: Arc<ResetState>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            remote,
            protocol,
            io: Box::new(io),
            state,
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn protocol(&self) -> StreamProtocol {
        self.protocol
    }

    /// Abort the stream in both directions without a graceful close.
    pub fn reset(self) {
        tracing::trace!(peer = %self.remote, protocol = %self.protocol, "stream reset");
        self.state.trip();
    }

    /// Whether this stream, or its remote end, was reset.
    pub fn is_reset(&self) -> bool {
        self.state.is_reset()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state.is_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Pending => {
                this.state.park(cx.waker());
                // A reset racing with the park must not be missed.
                if this.state.is_reset() {
                    return Poll::Ready(Err(reset_error()));
                }
                Poll::Pending
            }
            Poll::Ready(Err(_)) if this.state.is_reset() => Poll::Ready(Err(reset_error())),
            Poll::Ready(Ok(())) if buf.filled().len() == before && this.state.is_reset() => {
                Poll::Ready(Err(reset_error()))
            }
            ready => ready,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state.is_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        match Pin::new(&mut this.io).poll_write(cx, buf) {
            Poll::Pending => {
                this.state.park(cx.waker());
                if this.state.is_reset() {
                    return Poll::Ready(Err(reset_error()));
                }
                Poll::Pending
            }
            Poll::Ready(Err(_)) if this.state.is_reset() => Poll::Ready(Err(reset_error())),
            ready => ready,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state.is_reset() {
            return Poll::Ready(Err(reset_error()));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
