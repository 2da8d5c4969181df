//! TCP dialer.
//!
//! # Example
//!
//! ```ignore
//! use metapipe::transport::{Dialer, TcpDialer};
//!
//! let dialer = TcpDialer::new(Some(Duration::from_secs(1)));
//! let stream = dialer.dial("127.0.0.1:11211").await?;
//! ```

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use super::{BoxedStream, DialFuture, Dialer};

/// Opens plain TCP connections with `TCP_NODELAY` set.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, addr: &str) -> DialFuture {
        let addr = addr.to_string();
        let timeout = self.connect_timeout;
        Box::pin(async move {
            let connect = TcpStream::connect(addr.as_str());
            let stream = match timeout {
                Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out after {:?}", addr, limit),
                    )
                })??,
                None => connect.await?,
            };
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
