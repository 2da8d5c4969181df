//! # metapipe
//!
//! Pipelined client engine for the memcached meta protocol
//! (`mg`/`ms`/`md`/`flush_all`/`version`).
//!
//! Many callers share a small pool of long-lived connections. Commands are
//! batched per [`Pipeline`], written with one vectored write per flush, and
//! matched back to their callers purely by order on the wire.
//!
//! ## Architecture
//!
//! - **Protocol**: request encoders, a ring-buffer framer and a response parser
//! - **Connection**: one write loop, one reader task and a reconnecting supervisor
//! - **Client**: a round-robin pool of connections plus an idle-connection health checker
//!
//! ## Example
//!
//! ```ignore
//! use metapipe::{Client, MGetOptions};
//!
//! #[tokio::main]
//! async fn main() -> metapipe::Result<()> {
//!     let client = Client::builder("127.0.0.1:11211").build()?;
//!
//!     let pipeline = client.pipeline();
//!     let hit = pipeline.mget("key01", MGetOptions { cas: true, ..Default::default() });
//!     println!("{:?}", hit.resolve().await?);
//!     pipeline.finish();
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

mod backpressure;
mod batch;
mod buffer_pool;
mod client;
mod connection;
mod health;
mod inflight;
mod pipeline;
mod writer;

pub use backpressure::{WriteLimiter, DEFAULT_WRITE_LIMIT};
pub use batch::DEFAULT_MAX_COMMANDS_PER_BATCH;
pub use buffer_pool::BufferPool;
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{MemcacheError, Result};
pub use inflight::DEFAULT_IN_FLIGHT_CAPACITY;
pub use pipeline::{
    Deferred, FlushAllResult, MDelResult, MGetResult, MSetResult, Pipeline, VersionResult,
};
pub use protocol::{
    FlushAllResponse, MDelOptions, MDelResponse, MDelResponseType, MGetOptions, MGetResponse,
    MGetResponseType, MSetOptions, MSetResponse, MSetResponseType, ResponseFlags,
    VersionResponse,
};
pub use transport::{BoxedStream, Dialer, TcpDialer};
