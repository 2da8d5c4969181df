//! Client configuration.
//!
//! Every field has a default, so a JSON document only needs to name what it
//! changes. Durations are written in milliseconds:
//!
//! ```json
//! {
//!   "addr": "127.0.0.1:11211",
//!   "num_conns": 8,
//!   "retry_duration_ms": 2000,
//!   "read_timeout_ms": 500
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backpressure::DEFAULT_WRITE_LIMIT;
use crate::batch::DEFAULT_MAX_COMMANDS_PER_BATCH;
use crate::connection::ConnectionOptions;
use crate::error::{MemcacheError, Result};
use crate::inflight::DEFAULT_IN_FLIGHT_CAPACITY;
use crate::protocol::{DEFAULT_FRAME_CAPACITY, DEFAULT_MAX_VALUE_SIZE};

/// Default number of connections per client.
pub const DEFAULT_NUM_CONNS: usize = 4;

/// Default delay between failed dials.
pub const DEFAULT_RETRY_DURATION: Duration = Duration::from_secs(10);

/// Default interval between health-check ticks.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default server address.
pub const DEFAULT_ADDR: &str = "127.0.0.1:11211";

/// Plain configuration values for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, `host:port`.
    pub addr: String,
    /// Number of connections in the pool.
    pub num_conns: usize,
    /// Socket read buffer and initial framer capacity, in bytes.
    pub buffer_size: usize,
    /// Sub-commands per batch before a sibling batch is started.
    pub max_commands_per_batch: usize,
    /// Sub-commands written but not yet answered before writes stall.
    pub write_limit: u64,
    /// Slots in each connection's in-flight ring.
    pub in_flight_capacity: usize,
    /// Largest `VA` body accepted from the server.
    pub max_value_size: usize,
    #[serde(rename = "retry_duration_ms", with = "millis")]
    pub retry_duration: Duration,
    /// Zero disables the health checker.
    #[serde(rename = "health_check_interval_ms", with = "millis")]
    pub health_check_interval: Duration,
    #[serde(rename = "connect_timeout_ms", with = "opt_millis")]
    pub connect_timeout: Option<Duration>,
    #[serde(rename = "read_timeout_ms", with = "opt_millis")]
    pub read_timeout: Option<Duration>,
    #[serde(rename = "write_timeout_ms", with = "opt_millis")]
    pub write_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            num_conns: DEFAULT_NUM_CONNS,
            buffer_size: DEFAULT_FRAME_CAPACITY,
            max_commands_per_batch: DEFAULT_MAX_COMMANDS_PER_BATCH,
            write_limit: DEFAULT_WRITE_LIMIT,
            in_flight_capacity: DEFAULT_IN_FLIGHT_CAPACITY,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            retry_duration: DEFAULT_RETRY_DURATION,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Default configuration for `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(MemcacheError::Config("addr must not be empty".into()));
        }
        if self.num_conns == 0 {
            return Err(MemcacheError::Config("num_conns must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(MemcacheError::Config("buffer_size must be at least 1".into()));
        }
        if self.max_commands_per_batch == 0 {
            return Err(MemcacheError::Config(
                "max_commands_per_batch must be at least 1".into(),
            ));
        }
        if self.write_limit == 0 {
            return Err(MemcacheError::Config("write_limit must be at least 1".into()));
        }
        if self.in_flight_capacity == 0 {
            return Err(MemcacheError::Config(
                "in_flight_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            buffer_size: self.buffer_size,
            write_limit: self.write_limit,
            in_flight_capacity: self.in_flight_capacity,
            max_value_size: self.max_value_size,
            retry_duration: self.retry_duration,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
