//! `host:port` parsing and formatting.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::config::ConfigError;

/// Resolve a single `host:port` endpoint.
///
/// Literal addresses never touch the resolver. Hostnames are resolved once,
/// at startup, and the first result wins.
pub fn parse_endpoint(text: &str) -> Result<SocketAddr, ConfigError> {
    let text = text.trim();
    if let Ok(addr) = text.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let invalid = |reason: String| ConfigError::InvalidEndpoint {
        value: text.to_string(),
        reason,
    };

    match text.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            port.parse::<u16>()
                .map_err(|_| invalid(format!("bad port '{port}'")))?;
        }
        _ => return Err(invalid("expected host:port".to_string())),
    }

    text.to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host did not resolve".to_string()))
}

/// Resolve a comma-separated list of endpoints. Empty items are skipped.
pub fn parse_endpoint_list(text: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    text.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_endpoint)
        .collect()
}

/// Render an optional address for logs.
pub fn display_endpoint(addr: Option<&SocketAddr>) -> String {
    match addr {
        Some(addr) => addr.to_string(),
        None => "(unknown)".to_string(),
    }
}
