//! Proxy runtime: drives one [`ProxyEngine`] from real sockets.
//!
//! One task per proxy instance. The task owns the listener, every session
//! socket, and the engine, so the engine is only ever touched from here.
//! Each socket has at most one armed readiness future in `pending`; a
//! future resolves when its socket becomes readable or, for session
//! sockets, when the reaper closes it.
//!
//! One loop round:
//!   1. a socket is readable → read one datagram (or one batch)
//!   2. hand the read to the engine, re-arm the socket
//!   3. arm any session sockets the engine opened
//!   4. issue every queued send, report each completion

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use sluice_core::config::{InstanceConfig, RuntimeConfig};
use sluice_core::engine::{Channel, ProxyEngine, Received, Transport};
use sluice_core::session::UpstreamId;
use sluice_core::MAX_DATAGRAM_SIZE;

use crate::socket;

// ── Session sockets ──────────────────────────────────────────────────────────

struct Endpoint {
    socket: Arc<UdpSocket>,
    stop: Arc<Notify>,
    client: SocketAddr,
}

/// Session sockets of one instance, keyed by the handle the engine knows
/// them by.
struct SocketRegistry {
    endpoints: HashMap<UpstreamId, Endpoint>,
    next_id: u64,
    bind_addr: SocketAddr,
    recv_buffer: usize,
    send_buffer: usize,
    /// Opened since the last round; their readiness futures are not armed yet.
    opened: Vec<UpstreamId>,
}

impl SocketRegistry {
    fn new(bind_addr: SocketAddr, recv_buffer: usize, send_buffer: usize) -> Self {
        Self {
            endpoints: HashMap::new(),
            next_id: 0,
            bind_addr,
            recv_buffer,
            send_buffer,
            opened: Vec::new(),
        }
    }

    fn socket(&self, id: UpstreamId) -> Option<Arc<UdpSocket>> {
        self.endpoints.get(&id).map(|e| e.socket.clone())
    }

    fn client(&self, id: UpstreamId) -> Option<SocketAddr> {
        self.endpoints.get(&id).map(|e| e.client)
    }

    fn len(&self) -> usize {
        self.endpoints.len()
    }

    fn close_all(&mut self) {
        for (_, endpoint) in self.endpoints.drain() {
            endpoint.stop.notify_one();
        }
        self.opened.clear();
    }
}

impl Transport for SocketRegistry {
    fn open_upstream(&mut self, client: SocketAddr) -> io::Result<UpstreamId> {
        let socket = socket::bind_udp(self.bind_addr, self.recv_buffer, self.send_buffer)?;
        self.next_id += 1;
        let id = UpstreamId(self.next_id);
        tracing::debug!(%client, upstream = %id, local = ?socket.local_addr().ok(), "session socket opened");

        self.endpoints.insert(
            id,
            Endpoint {
                socket: Arc::new(socket),
                stop: Arc::new(Notify::new()),
                client,
            },
        );
        self.opened.push(id);
        Ok(id)
    }

    fn close_upstream(&mut self, id: UpstreamId) {
        // The readiness future holds the last other reference; the socket
        // closes once it observes the stop and is dropped.
        if let Some(endpoint) = self.endpoints.remove(&id) {
            endpoint.stop.notify_one();
        }
        self.opened.retain(|opened| *opened != id);
    }
}

// ── Readiness ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Source {
    Listener,
    Upstream(UpstreamId),
}

enum Readiness {
    Readable(Source, io::Result<()>),
    Stopped(UpstreamId),
}

fn watch_listener(socket: Arc<UdpSocket>) -> BoxFuture<'static, Readiness> {
    async move { Readiness::Readable(Source::Listener, socket.readable().await) }.boxed()
}

fn watch_upstream(id: UpstreamId, socket: Arc<UdpSocket>, stop: Arc<Notify>) -> BoxFuture<'static, Readiness> {
    async move {
        tokio::select! {
            _ = stop.notified() => Readiness::Stopped(id),
            r = socket.readable() => Readiness::Readable(Source::Upstream(id), r),
        }
    }
    .boxed()
}

/// Pause before re-arming a socket whose readiness poll failed.
const READINESS_RETRY: Duration = Duration::from_millis(100);

fn delayed(watch: BoxFuture<'static, Readiness>, delay: Duration) -> BoxFuture<'static, Readiness> {
    async move {
        tokio::time::sleep(delay).await;
        watch.await
    }
    .boxed()
}

// ── Runtime ──────────────────────────────────────────────────────────────────

pub struct ProxyRuntime {
    engine: ProxyEngine,
    listener: Arc<UdpSocket>,
    upstreams: SocketRegistry,
    reaper_interval: Duration,
    stats_interval: Option<Duration>,
    started: Instant,
    shutdown: broadcast::Receiver<()>,
}

impl ProxyRuntime {
    /// Bind the listener and build the engine. No session socket exists
    /// until the first client datagram arrives.
    pub fn bind(
        config: InstanceConfig,
        runtime: &RuntimeConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let engine = ProxyEngine::new(&config, runtime.pool_block_size)
            .with_context(|| format!("invalid proxy '{}'", config.name))?;
        let first = config
            .destinations
            .first()
            .with_context(|| format!("proxy '{}' has no destinations", config.name))?;

        let listener = socket::bind_udp(config.source, config.recv_buffer_size, config.send_buffer_size)
            .with_context(|| format!("failed to bind listener {}", config.source))?;
        let local = listener.local_addr().context("listener local_addr")?;

        tracing::info!(
            instance = %config.name,
            listen = %local,
            destinations = ?config.destinations,
            recv_batch = engine.recv_batch(),
            idle_timeout_secs = config.idle_timeout.as_secs(),
            obfuscation = config.obfuscation.is_enabled(),
            "proxy listening"
        );

        Ok(Self {
            engine,
            listener: Arc::new(listener),
            upstreams: SocketRegistry::new(
                socket::unspecified_for(first),
                config.recv_buffer_size,
                config.send_buffer_size,
            ),
            reaper_interval: Duration::from_secs(runtime.reaper_interval_secs.max(1)),
            stats_interval: (runtime.stats_interval_secs > 0)
                .then(|| Duration::from_secs(runtime.stats_interval_secs)),
            started: Instant::now(),
            shutdown,
        })
    }

    /// Address the listener actually bound, which differs from the
    /// configured one when port 0 was requested.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) -> Result<()> {
        let mut pending: FuturesUnordered<BoxFuture<'static, Readiness>> = FuturesUnordered::new();
        pending.push(watch_listener(self.listener.clone()));

        let mut reaper = tokio::time::interval_at(Instant::now() + self.reaper_interval, self.reaper_interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stats_period = self.stats_interval.unwrap_or(Duration::from_secs(3600));
        let mut stats = tokio::time::interval_at(Instant::now() + stats_period, stats_period);
        let stats_enabled = self.stats_interval.is_some();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(instance = %self.engine.name(), "proxy shutting down");
                    break;
                }

                _ = reaper.tick() => {
                    let now = self.now_ms();
                    let evicted = self.engine.on_tick(&mut self.upstreams, now);
                    if evicted > 0 {
                        tracing::debug!(
                            instance = %self.engine.name(),
                            evicted,
                            remaining = self.engine.sessions().len(),
                            "idle sweep"
                        );
                    }
                }

                _ = stats.tick(), if stats_enabled => self.log_stats(),

                Some(ready) = pending.next() => {
                    match ready {
                        Readiness::Readable(source, Ok(())) => {
                            if let Some(channel) = self.channel_for(source) {
                                self.receive(channel);
                                pending.push(self.rearm(source));
                            }
                        }
                        Readiness::Readable(source, Err(e)) => {
                            tracing::warn!(instance = %self.engine.name(), ?source, error = %e, "readiness failed");
                            if self.channel_for(source).is_some() {
                                pending.push(delayed(self.rearm(source), READINESS_RETRY));
                            }
                        }
                        Readiness::Stopped(id) => {
                            tracing::trace!(upstream = %id, "session socket closed");
                        }
                    }

                    for id in std::mem::take(&mut self.upstreams.opened) {
                        if let Some(endpoint) = self.upstreams.endpoints.get(&id) {
                            pending.push(watch_upstream(id, endpoint.socket.clone(), endpoint.stop.clone()));
                        }
                    }

                    self.flush().await;
                }
            }
        }

        self.upstreams.close_all();
        self.log_stats();
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Channel a readiness source reports on, or None if its socket is gone.
    fn channel_for(&self, source: Source) -> Option<Channel> {
        match source {
            Source::Listener => Some(Channel::Listener),
            Source::Upstream(id) => self
                .upstreams
                .client(id)
                .map(|client| Channel::Upstream { id, client }),
        }
    }

    fn rearm(&self, source: Source) -> BoxFuture<'static, Readiness> {
        match source {
            Source::Listener => watch_listener(self.listener.clone()),
            Source::Upstream(id) => match self.upstreams.endpoints.get(&id) {
                Some(endpoint) => watch_upstream(id, endpoint.socket.clone(), endpoint.stop.clone()),
                None => async move { Readiness::Stopped(id) }.boxed(),
            },
        }
    }

    fn socket_for(&self, channel: Channel) -> Option<Arc<UdpSocket>> {
        match channel {
            Channel::Listener => Some(self.listener.clone()),
            Channel::Upstream { id, .. } => self.upstreams.socket(id),
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// One read, or one batch of reads, from the socket behind `channel`.
    fn receive(&mut self, channel: Channel) {
        let Some(socket) = self.socket_for(channel) else {
            return;
        };
        let now = self.now_ms();
        let buf = self.engine.claim_recv_buffer();

        if self.engine.recv_batch() == 1 {
            let result = socket.try_recv_from(self.engine.recv_segment(&buf, 0));
            let event = match result {
                Ok((len, from)) => Received::Datagram { buf, len, from },
                Err(e) => {
                    log_recv_error(self.engine.name(), &e);
                    Received::Empty(buf)
                }
            };
            self.engine.on_receive(channel, event, &mut self.upstreams, now);
            return;
        }

        let mut received = 0;
        for segment in 0..self.engine.recv_batch() {
            let result = socket.try_recv_from(self.engine.recv_segment(&buf, segment));
            match result {
                Ok((len, from)) => {
                    received += 1;
                    let event = Received::Chunk {
                        buf: &buf,
                        offset: segment * MAX_DATAGRAM_SIZE,
                        len,
                        from,
                    };
                    self.engine.on_receive(channel, event, &mut self.upstreams, now);
                }
                Err(e) => {
                    log_recv_error(self.engine.name(), &e);
                    break;
                }
            }
        }

        let end = if received == 0 {
            Received::Empty(buf)
        } else {
            Received::BatchEnd(buf)
        };
        self.engine.on_receive(channel, end, &mut self.upstreams, now);
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    async fn flush(&mut self) {
        while let Some(request) = self.engine.next_send() {
            let result = match self.engine.send_parts(&request) {
                Some((via, dest, payload)) => match self.socket_for(via) {
                    Some(socket) => socket.send_to(payload, dest).await,
                    None => Err(io::Error::new(io::ErrorKind::NotConnected, "session socket closed")),
                },
                None => Err(io::Error::new(io::ErrorKind::InvalidInput, "incomplete send request")),
            };
            self.engine.complete_send(request, result);
        }
    }

    fn log_stats(&self) {
        let s = self.engine.stats();
        tracing::info!(
            instance = %self.engine.name(),
            sessions = s.sessions.active,
            sockets = self.upstreams.len(),
            sessions_created = s.sessions.created,
            sessions_evicted = s.sessions.evicted,
            from_clients = s.from_clients,
            from_upstreams = s.from_upstreams,
            to_upstreams = s.to_upstreams,
            to_clients = s.to_clients,
            bytes_sent = s.bytes_sent,
            send_failures = s.send_failures,
            open_failures = s.open_failures,
            buffers_in_use = s.buffers_in_use,
            buffer_capacity = s.buffer_capacity,
            "proxy stats"
        );
    }
}

fn log_recv_error(instance: &str, e: &io::Error) {
    if e.kind() != io::ErrorKind::WouldBlock {
        tracing::warn!(instance, error = %e, "recv failed");
    }
}
