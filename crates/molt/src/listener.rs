//! Listener abstraction and the single-use adapter.
//!
//! [`SingleUseListener`] lets a serve routine that normally loops over
//! `accept()` handle exactly one pre-accepted connection: the first
//! `accept()` yields it, every later call fails with [`Error::Exhausted`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::counter::WorkGuard;
use crate::error::{Error, Result};

/// A source of accepted connections.
pub trait Listener: Send + Sync + 'static {
    /// Stream type produced by `accept`.
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next connection.
    fn accept(&self) -> impl Future<Output = Result<(Self::Io, SocketAddr)>> + Send;

    /// Address the listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    fn accept(&self) -> impl Future<Output = Result<(TcpStream, SocketAddr)>> + Send {
        async move { TcpListener::accept(self).await.map_err(Error::from_accept) }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(TcpListener::local_addr(self)?)
    }
}

/// An accepted connection being handled as one request.
///
/// Holds the request census entry for as long as the handler keeps the
/// connection alive; dropping it marks the request finished.
pub struct Connection<S> {
    io: S,
    peer_addr: SocketAddr,
    _request: WorkGuard,
}

impl<S> Connection<S> {
    pub fn new(io: S, peer_addr: SocketAddr, request: WorkGuard) -> Self {
        Self {
            io,
            peer_addr,
            _request: request,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Connection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Connection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// A listener that yields one pre-accepted connection, then is exhausted.
pub struct SingleUseListener<S> {
    conn: Mutex<Option<Connection<S>>>,
    local_addr: SocketAddr,
}

impl<S> SingleUseListener<S> {
    /// Wrap `conn`. `local_addr` is the address of the listener that
    /// accepted it.
    pub fn new(conn: Connection<S>, local_addr: SocketAddr) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            local_addr,
        }
    }

    fn take(&self) -> Option<Connection<S>> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Close the wrapped connection unless it was already accepted or
    /// closed. Safe to call any number of times, from any task.
    pub fn close(&self) -> Result<()> {
        drop(self.take());
        Ok(())
    }

    /// Whether the connection has been handed out or closed.
    pub fn is_exhausted(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<S> Listener for SingleUseListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = Connection<S>;

    fn accept(&self) -> impl Future<Output = Result<(Connection<S>, SocketAddr)>> + Send {
        let result = match self.take() {
            Some(conn) => {
                let peer = conn.peer_addr();
                Ok((conn, peer))
            }
            None => Err(Error::Exhausted),
        };
        std::future::ready(result)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::WorkCounter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Stream that counts how many times it was closed (dropped).
    struct CountingStream {
        inner: DuplexStream,
        closes: Arc<AtomicUsize>,
    }

    impl Drop for CountingStream {
        fn drop(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for CountingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn single_use(
        counter: &WorkCounter,
    ) -> (SingleUseListener<CountingStream>, DuplexStream, Arc<AtomicUsize>) {
        let (client, server) = duplex(64);
        let closes = Arc::new(AtomicUsize::new(0));
        let stream = CountingStream {
            inner: server,
            closes: Arc::clone(&closes),
        };
        let conn = Connection::new(stream, addr(40000), counter.add());
        (SingleUseListener::new(conn, addr(8080)), client, closes)
    }

    #[tokio::test]
    async fn test_accept_yields_connection_once() {
        let counter = WorkCounter::new();
        let (listener, mut client, _) = single_use(&counter);

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, addr(40000));
        assert!(listener.is_exhausted());

        for _ in 0..5 {
            assert!(matches!(listener.accept().await, Err(Error::Exhausted)));
        }

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_concurrent_accept_has_single_winner() {
        let counter = WorkCounter::new();
        let (listener, _client, _) = single_use(&counter);
        let listener = Arc::new(listener);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let listener = Arc::clone(&listener);
                tokio::spawn(async move { listener.accept().await.map(|(conn, _)| conn) })
            })
            .collect();

        let mut accepted = Vec::new();
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(conn) => accepted.push(conn),
                Err(Error::Exhausted) => exhausted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(accepted.len(), 1);
        assert_eq!(exhausted, 15);
    }

    #[tokio::test]
    async fn test_concurrent_close_closes_once() {
        let counter = WorkCounter::new();
        let (listener, _client, closes) = single_use(&counter);
        let listener = Arc::new(listener);

        let a = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.close() })
        };
        let b = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.close() })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(counter.count(), 0);

        assert!(matches!(listener.accept().await, Err(Error::Exhausted)));
    }

    #[tokio::test]
    async fn test_close_after_accept_leaves_connection_alone() {
        let counter = WorkCounter::new();
        let (listener, _client, closes) = single_use(&counter);

        let (conn, _) = listener.accept().await.unwrap();
        listener.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(counter.count(), 1);

        drop(conn);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(counter.count(), 0);
    }

    #[tokio::test]
    async fn test_reports_original_listener_address() {
        let counter = WorkCounter::new();
        let (listener, _client, _) = single_use(&counter);
        assert_eq!(Listener::local_addr(&listener).unwrap(), addr(8080));
    }

    #[tokio::test]
    async fn test_tcp_listener_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = Listener::local_addr(&listener).unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(local).await.unwrap() });
        let (_stream, peer) = Listener::accept(&listener).await.unwrap();
        let client = client.await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
