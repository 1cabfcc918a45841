//! sluice-core: the socket-free half of the sluice UDP proxy.
//! Allocators, buffers, sessions, routing, and configuration; the daemon
//! crate supplies sockets and a clock.

pub mod addr;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod pool;
pub mod selector;
pub mod session;

pub use buffer::{BufferPool, BufferRef, MAX_DATAGRAM_SIZE};
pub use config::{ConfigError, InstanceConfig, RuntimeConfig, SluiceConfig};
pub use engine::{Channel, EngineStats, ProxyEngine, Received, Transport};
pub use error::EngineError;
pub use filter::ObfuscationFilter;
pub use session::UpstreamId;
