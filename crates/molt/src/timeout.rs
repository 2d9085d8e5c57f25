//! Per-connection read and write deadlines.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

/// Read and write timeouts applied to each accepted connection.
///
/// A zero duration disables enforcement for that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
}

impl Timeouts {
    /// No deadlines in either direction.
    pub const DISABLED: Timeouts = Timeouts {
        read: Duration::ZERO,
        write: Duration::ZERO,
    };
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
        }
    }
}

/// A deadline found expired this long before the stream was polled again
/// belonged to an operation that was dropped while pending.
const ABANDONED_AFTER: Duration = Duration::from_millis(10);

/// Stream wrapper that fails an operation with [`io::ErrorKind::TimedOut`]
/// if it does not complete within the configured timeout.
///
/// The deadline is armed when an operation first returns `Pending` and is
/// disarmed once it completes, so every read or write gets a fresh window.
/// An operation abandoned while pending (a losing `select!` branch, an outer
/// `timeout`) does not pass its deadline on to the next one. Flush and
/// shutdown count as writes.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeouts: Timeouts,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeouts: Timeouts) -> Self {
        Self {
            inner,
            timeouts,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }
}

/// Timer for the operation in progress in one direction.
///
/// The `Sleep` is allocated once and reset for each operation.
#[derive(Debug, Default)]
struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl Deadline {
    /// Poll the deadline for a pending operation, arming it if no
    /// operation is in progress.
    fn poll(
        &mut self,
        timeout: Duration,
        direction: &'static str,
        cx: &mut Context<'_>,
    ) -> Poll<io::Error> {
        if timeout.is_zero() {
            return Poll::Pending;
        }

        let now = Instant::now();
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(sleep_until(now + timeout)));
        if !self.armed || now > sleep.deadline() + ABANDONED_AFTER {
            sleep.as_mut().reset(now + timeout);
            self.armed = true;
        }

        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.armed = false;
                Poll::Ready(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{direction} timed out after {timeout:?}"),
                ))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline.disarm();
                Poll::Ready(result)
            }
            Poll::Pending => this
                .read_deadline
                .poll(this.timeouts.read, "read", cx)
                .map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> TimeoutStream<S> {
    fn poll_write_op<T>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut S>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        match op(Pin::new(&mut self.inner), &mut *cx) {
            Poll::Ready(result) => {
                self.write_deadline.disarm();
                Poll::Ready(result)
            }
            Poll::Pending => self
                .write_deadline
                .poll(self.timeouts.write, "write", cx)
                .map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_write_op(cx, |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_write_op(cx, |inner, cx| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_write_op(cx, |inner, cx| inner.poll_shutdown(cx))
    }
}
