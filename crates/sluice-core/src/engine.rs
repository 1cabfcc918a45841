//! Proxy engine: the per-instance forwarding state machine.
//!
//! The engine never touches a socket or a clock. The runtime hands it
//! receive events and the current monotonic time, opens and closes session
//! sockets on request through [`Transport`], and drains the send queue:
//!
//! ```text
//!   claim_recv_buffer ─► recv into buffer ─► on_receive ─► (filter, route)
//!                                                              │
//!   complete_send ◄── send_to(...).await ◄── send_parts ◄── next_send
//! ```
//!
//! Every event for one instance runs on one task, so nothing here is
//! synchronised.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::buffer::{BufferPool, BufferRef, PoolCounters, MAX_DATAGRAM_SIZE};
use crate::config::{ConfigError, InstanceConfig};
use crate::filter::ObfuscationFilter;
use crate::pool::{BlockAllocator, SlotId};
use crate::selector::DestinationSelector;
use crate::session::{SessionStats, SessionTable, UpstreamId};

/// Session sockets, opened and closed on the engine's behalf.
pub trait Transport {
    /// Bind a fresh outbound socket for `client` and start receiving on it.
    /// Datagrams arriving on it must be reported as
    /// `Channel::Upstream { id, client }`.
    fn open_upstream(&mut self, client: SocketAddr) -> io::Result<UpstreamId>;

    /// Stop receiving on the socket and close it. The runtime may finish
    /// reclaiming it later; the engine never refers to `id` again.
    fn close_upstream(&mut self, id: UpstreamId);
}

/// Where a datagram was received, or which socket a send goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The client-facing listening socket.
    Listener,
    /// A session's dedicated socket, with the client it belongs to.
    Upstream { id: UpstreamId, client: SocketAddr },
}

/// One receive completion.
#[derive(Debug)]
pub enum Received<'a> {
    /// A single read. The buffer's implicit reference moves to the send.
    Datagram { buf: BufferRef, len: usize, from: SocketAddr },
    /// One datagram of a batched read. The engine takes its own reference.
    Chunk {
        buf: &'a BufferRef,
        offset: usize,
        len: usize,
        from: SocketAddr,
    },
    /// End of a batched read; drops the implicit reference.
    BatchEnd(BufferRef),
    /// Nothing usable was read (no source, zero length, or an error).
    Empty(BufferRef),
}

/// Handle of a queued send.
#[derive(Debug)]
pub struct RequestId(SlotId);

/// A send in flight. Lives in its own allocator so the hot path never
/// allocates.
#[derive(Debug, Default)]
pub struct SendRequest {
    via: Option<Channel>,
    dest: Option<SocketAddr>,
    buffer: Option<BufferRef>,
    offset: usize,
    len: usize,
}

/// Snapshot of an engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub from_clients: u64,
    pub bytes_from_clients: u64,
    pub from_upstreams: u64,
    pub bytes_from_upstreams: u64,
    pub to_upstreams: u64,
    pub to_clients: u64,
    pub bytes_sent: u64,
    pub empty_receives: u64,
    pub open_failures: u64,
    pub send_failures: u64,
    pub queued_sends: usize,
    pub sessions: SessionStats,
    pub buffers: PoolCounters,
    pub buffer_capacity: usize,
    pub buffers_in_use: usize,
    pub request_capacity: usize,
    pub requests_in_use: usize,
}

#[derive(Debug, Default)]
struct Counters {
    from_clients: u64,
    bytes_from_clients: u64,
    from_upstreams: u64,
    bytes_from_upstreams: u64,
    to_upstreams: u64,
    to_clients: u64,
    bytes_sent: u64,
    empty_receives: u64,
    open_failures: u64,
    send_failures: u64,
}

/// Forwarding state of one proxy instance.
pub struct ProxyEngine {
    name: String,
    listen: SocketAddr,
    selector: DestinationSelector,
    filter: ObfuscationFilter,
    idle_timeout_ms: u64,
    recv_batch: usize,
    debug: bool,
    sessions: SessionTable,
    buffers: BufferPool,
    requests: BlockAllocator<SendRequest>,
    queue: VecDeque<RequestId>,
    counters: Counters,
}

impl ProxyEngine {
    /// Build an engine for a resolved instance. `pool_block_size` slots are
    /// pre-allocated in each pool.
    pub fn new(config: &InstanceConfig, pool_block_size: usize) -> Result<Self, ConfigError> {
        let selector = DestinationSelector::new(config.destinations.clone()).map_err(|_| {
            ConfigError::NoDestinations {
                instance: config.name.clone(),
            }
        })?;
        let recv_batch = config.recv_batch.max(1);

        Ok(Self {
            name: config.name.clone(),
            listen: config.source,
            selector,
            filter: config.obfuscation,
            idle_timeout_ms: duration_ms(config.idle_timeout),
            recv_batch,
            debug: config.debug,
            sessions: SessionTable::new(),
            buffers: BufferPool::new(pool_block_size, recv_batch),
            requests: BlockAllocator::new(pool_block_size),
            queue: VecDeque::with_capacity(pool_block_size),
            counters: Counters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    pub fn recv_batch(&self) -> usize {
        self.recv_batch
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Claim a buffer for the next read. The caller owns the implicit
    /// reference and must hand it back through [`ProxyEngine::on_receive`].
    pub fn claim_recv_buffer(&mut self) -> BufferRef {
        self.buffers.claim()
    }

    /// Receive area for datagram `segment` of a batched read.
    pub fn recv_segment(&mut self, buf: &BufferRef, segment: usize) -> &mut [u8] {
        let start = (segment * MAX_DATAGRAM_SIZE).min(self.buffers.buffer_size());
        let end = (start + MAX_DATAGRAM_SIZE).min(self.buffers.buffer_size());
        &mut self.buffers.bytes_mut(buf)[start..end]
    }

    /// Handle one receive completion on `channel`.
    pub fn on_receive<T: Transport>(
        &mut self,
        channel: Channel,
        event: Received<'_>,
        transport: &mut T,
        now_ms: u64,
    ) {
        match event {
            Received::Datagram { buf, len, from } => {
                if len == 0 {
                    self.drop_empty(buf);
                } else {
                    self.forward(channel, buf, 0, len, from, transport, now_ms);
                }
            }
            Received::Chunk {
                buf,
                offset,
                len,
                from,
            } => {
                if len == 0 || offset >= self.buffers.buffer_size() {
                    // The batch still owns `buf`; BatchEnd releases it.
                    self.counters.empty_receives += 1;
                } else {
                    let shared = self.buffers.share(buf);
                    self.forward(channel, shared, offset, len, from, transport, now_ms);
                }
            }
            Received::BatchEnd(buf) => {
                self.buffers.release(buf);
            }
            Received::Empty(buf) => self.drop_empty(buf),
        }
    }

    fn drop_empty(&mut self, buf: BufferRef) {
        self.counters.empty_receives += 1;
        self.buffers.release(buf);
    }

    /// Transform, route, and queue one datagram. `buf` is the reference the
    /// send will hold.
    #[allow(clippy::too_many_arguments)]
    fn forward<T: Transport>(
        &mut self,
        channel: Channel,
        buf: BufferRef,
        offset: usize,
        len: usize,
        from: SocketAddr,
        transport: &mut T,
        now_ms: u64,
    ) {
        let size = self.buffers.buffer_size();
        let offset = offset.min(size);
        let end = offset.saturating_add(len).min(size);
        self.filter.apply(&mut self.buffers.bytes_mut(&buf)[offset..end]);
        let len = end - offset;

        let (via, dest) = match channel {
            Channel::Listener => {
                self.counters.from_clients += 1;
                self.counters.bytes_from_clients += len as u64;

                let opened = self
                    .sessions
                    .get_or_create(from, now_ms, || transport.open_upstream(from));
                let session = match opened {
                    Ok((session, created)) => {
                        if created {
                            tracing::info!(
                                instance = %self.name,
                                client = %from,
                                upstream = %session.upstream,
                                "new client session"
                            );
                        }
                        session
                    }
                    Err(e) => {
                        self.counters.open_failures += 1;
                        tracing::warn!(instance = %self.name, error = %e, "dropping datagram");
                        self.buffers.release(buf);
                        return;
                    }
                };
                session.record_out(len, now_ms);
                let via = Channel::Upstream {
                    id: session.upstream,
                    client: session.client,
                };
                (via, self.selector.next())
            }
            Channel::Upstream { client, .. } => {
                self.counters.from_upstreams += 1;
                self.counters.bytes_from_upstreams += len as u64;

                if let Some(session) = self.sessions.get_mut(&client) {
                    session.record_in(len, now_ms);
                }
                (Channel::Listener, client)
            }
        };

        if self.debug {
            let payload = &self.buffers.bytes(&buf)[offset..end];
            tracing::trace!(
                instance = %self.name,
                %from,
                to = %dest,
                len,
                preview = %hex::encode(&payload[..payload.len().min(16)]),
                "forwarding datagram"
            );
        }

        self.enqueue(via, dest, buf, offset, len);
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    fn enqueue(&mut self, via: Channel, dest: SocketAddr, buf: BufferRef, offset: usize, len: usize) {
        let id = self.requests.claim();
        let request = self.requests.get_mut(&id);
        request.via = Some(via);
        request.dest = Some(dest);
        request.buffer = Some(buf);
        request.offset = offset;
        request.len = len;
        self.queue.push_back(RequestId(id));
    }

    /// Next send to issue, in queue order.
    pub fn next_send(&mut self) -> Option<RequestId> {
        self.queue.pop_front()
    }

    /// Socket, destination, and payload of a queued send.
    pub fn send_parts(&self, request: &RequestId) -> Option<(Channel, SocketAddr, &[u8])> {
        let request = self.requests.get(&request.0);
        let via = request.via?;
        let dest = request.dest?;
        let buffer = request.buffer.as_ref()?;
        let payload = &self.buffers.bytes(buffer)[request.offset..request.offset + request.len];
        Some((via, dest, payload))
    }

    /// A send finished. Releases the request slot and its buffer reference.
    /// Failures are counted and logged; there is no retry.
    pub fn complete_send(&mut self, request: RequestId, result: io::Result<usize>) {
        let slot = self.requests.get_mut(&request.0);
        let buffer = slot.buffer.take();
        let via = slot.via.take();
        let dest = slot.dest.take();
        self.requests.release(request.0);

        if let Some(buffer) = buffer {
            self.buffers.release(buffer);
        }

        match result {
            Ok(sent) => {
                self.counters.bytes_sent += sent as u64;
                match via {
                    Some(Channel::Listener) => self.counters.to_clients += 1,
                    Some(Channel::Upstream { .. }) => self.counters.to_upstreams += 1,
                    None => {}
                }
            }
            Err(e) => {
                self.counters.send_failures += 1;
                tracing::warn!(
                    instance = %self.name,
                    dest = %crate::addr::display_endpoint(dest.as_ref()),
                    error = %e,
                    "send failed"
                );
            }
        }
    }

    /// Sends queued but not yet issued.
    pub fn pending_sends(&self) -> usize {
        self.queue.len()
    }

    // ── Idle reaper ──────────────────────────────────────────────────────────

    /// Evict idle sessions and close their sockets. Returns how many went.
    pub fn on_tick<T: Transport>(&mut self, transport: &mut T, now_ms: u64) -> usize {
        let evicted = self.sessions.sweep(now_ms, self.idle_timeout_ms);
        for session in &evicted {
            tracing::info!(
                instance = %self.name,
                client = %session.client,
                upstream = %session.upstream,
                idle_ms = session.idle_ms(now_ms),
                datagrams_out = session.datagrams_out,
                datagrams_in = session.datagrams_in,
                "session evicted"
            );
            transport.close_upstream(session.upstream);
        }
        evicted.len()
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            from_clients: c.from_clients,
            bytes_from_clients: c.bytes_from_clients,
            from_upstreams: c.from_upstreams,
            bytes_from_upstreams: c.bytes_from_upstreams,
            to_upstreams: c.to_upstreams,
            to_clients: c.to_clients,
            bytes_sent: c.bytes_sent,
            empty_receives: c.empty_receives,
            open_failures: c.open_failures,
            send_failures: c.send_failures,
            queued_sends: self.queue.len(),
            sessions: self.sessions.stats(),
            buffers: self.buffers.counters(),
            buffer_capacity: self.buffers.capacity(),
            buffers_in_use: self.buffers.in_use(),
            request_capacity: self.requests.capacity(),
            requests_in_use: self.requests.in_use(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
