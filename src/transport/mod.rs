//! Transport module - duplex byte streams and the strategy that dials them.
//!
//! A connection never opens sockets itself; it asks its [`Dialer`] for a
//! fresh stream on every (re)connect. The default is [`TcpDialer`], and
//! tests pass their own closures to inject latency or failures.

mod tcp;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{MemcacheError, Result};

pub use tcp::TcpDialer;

/// A duplex byte stream a connection can own.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream returned by a dialer.
pub type BoxedStream = Box<dyn Stream>;

/// Future returned by [`Dialer::dial`].
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

/// Strategy for opening a stream to `addr`.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, addr: &str) -> DialFuture;
}

impl<F, Fut> Dialer for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<BoxedStream>> + Send + 'static,
{
    fn dial(&self, addr: &str) -> DialFuture {
        Box::pin(self(addr.to_string()))
    }
}

/// Run `fut` under an optional deadline.
///
/// Expiry is reported as an `Io` error of kind `TimedOut`.
pub(crate) async fn with_deadline<T, F>(deadline: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(MemcacheError::from(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} deadline of {:?} exceeded", what, limit),
            ))),
        },
        None => fut.await,
    }
}
