//! Client session table and idle eviction.
//!
//! One session per client endpoint seen on the listener. A session owns the
//! outbound socket used to talk to upstream on that client's behalf, so
//! upstream replies arriving on it map back to exactly one client.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use crate::error::EngineError;

/// Runtime handle of a session's dedicated outbound socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpstreamId(pub u64);

impl std::fmt::Display for UpstreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// Canonical table key for a client endpoint.
///
/// Carries the address family, every bit of the IP and the port, so two
/// distinct endpoints can never share a key. Flow info and scope id of IPv6
/// addresses are not part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    family: Family,
    ip: u128,
    port: u16,
}

impl SessionKey {
    pub fn family(&self) -> Family {
        self.family
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for SessionKey {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self {
                family: Family::V4,
                ip: u128::from(u32::from(*v4.ip())),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self {
                family: Family::V6,
                ip: u128::from(*v6.ip()),
                port: v6.port(),
            },
        }
    }
}

/// Forwarding state for one client.
#[derive(Debug, Clone)]
pub struct Session {
    /// Where replies go.
    pub client: SocketAddr,
    /// Dedicated outbound socket.
    pub upstream: UpstreamId,
    /// Monotonic milliseconds.
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    /// Client → upstream.
    pub datagrams_out: u64,
    pub bytes_out: u64,
    /// Upstream → client.
    pub datagrams_in: u64,
    pub bytes_in: u64,
}

impl Session {
    pub fn new(client: SocketAddr, upstream: UpstreamId, now_ms: u64) -> Self {
        Self {
            client,
            upstream,
            created_at_ms: now_ms,
            last_activity_ms: now_ms,
            datagrams_out: 0,
            bytes_out: 0,
            datagrams_in: 0,
            bytes_in: 0,
        }
    }

    pub fn touch(&mut self, now_ms: u64) {
        // never moves backwards
        self.last_activity_ms = self.last_activity_ms.max(now_ms);
    }

    pub fn record_out(&mut self, bytes: usize, now_ms: u64) {
        self.datagrams_out += 1;
        self.bytes_out += bytes as u64;
        self.touch(now_ms);
    }

    pub fn record_in(&mut self, bytes: usize, now_ms: u64) {
        self.datagrams_in += 1;
        self.bytes_in += bytes as u64;
        self.touch(now_ms);
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms)
    }

    pub fn is_idle(&self, now_ms: u64, timeout_ms: u64) -> bool {
        self.idle_ms(now_ms) >= timeout_ms
    }
}

/// Table counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub active: usize,
    pub created: u64,
    pub evicted: u64,
    pub lookups: u64,
    pub hits: u64,
}

/// All live sessions of one proxy instance.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionKey, Session>,
    created: u64,
    evicted: u64,
    lookups: u64,
    hits: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for `client`, created on a miss.
    ///
    /// `open` is only called on a miss and must return the handle of a
    /// freshly opened outbound socket that already has its receive path
    /// registered. If it fails, nothing is inserted. Returns the session and
    /// whether it was just created.
    pub fn get_or_create<F>(
        &mut self,
        client: SocketAddr,
        now_ms: u64,
        open: F,
    ) -> Result<(&mut Session, bool), EngineError>
    where
        F: FnOnce() -> io::Result<UpstreamId>,
    {
        self.lookups += 1;
        match self.sessions.entry(SessionKey::from(client)) {
            Entry::Occupied(entry) => {
                self.hits += 1;
                Ok((entry.into_mut(), false))
            }
            Entry::Vacant(entry) => {
                let upstream = open().map_err(|source| EngineError::Open { client, source })?;
                self.created += 1;
                Ok((entry.insert(Session::new(client, upstream, now_ms)), true))
            }
        }
    }

    pub fn get(&self, client: &SocketAddr) -> Option<&Session> {
        self.sessions.get(&SessionKey::from(*client))
    }

    pub fn get_mut(&mut self, client: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(&SessionKey::from(*client))
    }

    pub fn contains(&self, client: &SocketAddr) -> bool {
        self.sessions.contains_key(&SessionKey::from(*client))
    }

    /// Remove every session idle for at least `timeout_ms` and hand them back
    /// so the caller can tear down their sockets.
    ///
    /// Two passes: collect the expired keys, then remove them. The map is
    /// never mutated while it is being iterated.
    pub fn sweep(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<Session> {
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_idle(now_ms, timeout_ms))
            .map(|(key, _)| *key)
            .collect();

        let evicted: Vec<Session> = expired
            .iter()
            .filter_map(|key| self.sessions.remove(key))
            .collect();
        self.evicted += evicted.len() as u64;
        evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.sessions.len(),
            created: self.created,
            evicted: self.evicted,
            lookups: self.lookups,
            hits: self.hits,
        }
    }
}
