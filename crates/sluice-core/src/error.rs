//! Engine error types.

use std::net::SocketAddr;

/// Per-datagram failures. None of these stop the engine; the datagram that
/// triggered them is dropped.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to open upstream socket for {client}: {source}")]
    Open {
        client: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
