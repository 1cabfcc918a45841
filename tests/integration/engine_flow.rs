use std::collections::HashMap;

use rand::Rng;
use sluice_core::engine::Channel;
use sluice_core::filter::ObfuscationFilter;
use sluice_core::session::UpstreamId;

use crate::*;

/// Two clients talking to a DNS-like pair of upstreams; every reply must
/// reach the client that asked.
#[test]
fn test_replies_reach_their_own_client() {
    let config = instance(&["8.8.8.8:53", "9.9.9.9:53"], ObfuscationFilter::disabled(), 1);
    let mut engine = engine(&config);
    let mut io = SimTransport::default();

    let alice = addr("10.0.0.5:4000");
    let bob = addr("10.0.0.6:4000");

    deliver(&mut engine, &mut io, Channel::Listener, alice, b"alice?", 0);
    deliver(&mut engine, &mut io, Channel::Listener, bob, b"bob?", 1);
    let out = flush(&mut engine);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].dest, addr("8.8.8.8:53"));
    assert_eq!(out[1].dest, addr("9.9.9.9:53"));

    // upstreams answer on whichever session socket asked
    for sent in &out {
        let Channel::Upstream { id, client } = sent.via else {
            panic!("client datagram went out on the listener");
        };
        assert_eq!(io.open.get(&id), Some(&client));
        let mut answer = sent.payload.clone();
        answer.push(b'!');
        deliver(&mut engine, &mut io, sent.via, sent.dest, &answer, 2);
    }

    let replies = flush(&mut engine);
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|r| r.via == Channel::Listener));
    assert_eq!(replies[0].dest, alice);
    assert_eq!(replies[0].payload, b"alice?!");
    assert_eq!(replies[1].dest, bob);
    assert_eq!(replies[1].payload, b"bob?!");

    let stats = engine.stats();
    assert_eq!(stats.to_upstreams, 2);
    assert_eq!(stats.to_clients, 2);
    assert_eq!(stats.sessions.active, 2);
}

/// A chain of two obfuscating proxies with the same key restores the
/// original bytes at the far end.
#[test]
fn test_obfuscation_chain_is_transparent() {
    let filter = ObfuscationFilter::new(0x5C, 8);
    let mut near = engine(&instance(&["192.0.2.1:9000"], filter, 1));
    let mut far = engine(&instance(&["198.51.100.7:53"], filter, 1));
    let mut near_io = SimTransport::default();
    let mut far_io = SimTransport::default();

    let client = addr("10.0.0.5:4000");
    let query: Vec<u8> = (0u8..32).collect();

    deliver(&mut near, &mut near_io, Channel::Listener, client, &query, 0);
    let hop = flush(&mut near).remove(0);
    assert_ne!(hop.payload[..8], query[..8], "prefix is masked on the wire");
    assert_eq!(hop.payload[8..], query[8..], "tail is untouched");

    deliver(&mut far, &mut far_io, Channel::Listener, addr("192.0.2.200:5000"), &hop.payload, 0);
    let arrived = flush(&mut far).remove(0);
    assert_eq!(arrived.dest, addr("198.51.100.7:53"));
    assert_eq!(arrived.payload, query);
}

/// Short datagrams only get as much of the key as they are long.
#[test]
fn test_obfuscation_of_short_datagrams() {
    let mut engine = engine(&instance(&["8.8.8.8:53"], ObfuscationFilter::new(0xFF, 16), 1));
    let mut io = SimTransport::default();
    deliver(&mut engine, &mut io, Channel::Listener, addr("10.0.0.5:4000"), &[0x0F, 0xF0], 0);
    assert_eq!(flush(&mut engine)[0].payload, vec![0xF0, 0x0F]);
}

/// Sessions idle past the timeout are evicted, their sockets closed, and a
/// returning client starts over with a new socket.
#[test]
fn test_idle_eviction_and_return() {
    // idle timeout is 60s
    let mut engine = engine(&instance(&["8.8.8.8:53"], ObfuscationFilter::disabled(), 1));
    let mut io = SimTransport::default();

    let quiet = addr("10.0.0.5:4000");
    let chatty = addr("10.0.0.6:4000");
    deliver(&mut engine, &mut io, Channel::Listener, quiet, b"hi", 1_000);
    deliver(&mut engine, &mut io, Channel::Listener, chatty, b"hi", 1_000);
    let out = flush(&mut engine);
    let chatty_via = out[1].via;

    // chatty hears back from upstream at t=40s, which counts as activity
    deliver(&mut engine, &mut io, chatty_via, addr("8.8.8.8:53"), b"yo", 40_000);
    flush(&mut engine);

    assert_eq!(engine.on_tick(&mut io, 60_999), 0);
    assert_eq!(engine.on_tick(&mut io, 61_000), 1);
    assert_eq!(io.closed, vec![UpstreamId(1)]);
    assert!(!engine.sessions().contains(&quiet));
    assert!(engine.sessions().contains(&chatty));

    assert_eq!(engine.on_tick(&mut io, 100_000), 1);
    assert!(engine.sessions().is_empty());
    assert!(io.open.is_empty());

    deliver(&mut engine, &mut io, Channel::Listener, quiet, b"back", 120_000);
    flush(&mut engine);
    assert_eq!(engine.sessions().get(&quiet).unwrap().upstream, UpstreamId(3));
    assert_eq!(engine.stats().sessions.evicted, 2);
}

/// Eviction hands the session socket back to the transport to close; the
/// client's next datagram opens a new one.
#[test]
fn test_eviction_closes_the_session_socket() {
    let mut engine = engine(&instance(&["8.8.8.8:53"], ObfuscationFilter::disabled(), 1));
    let mut io = SimTransport::default();
    let client = addr("10.0.0.5:4000");

    deliver(&mut engine, &mut io, Channel::Listener, client, b"q", 0);
    let id = match flush(&mut engine)[0].via {
        Channel::Upstream { id, .. } => id,
        Channel::Listener => panic!("client datagram sent via the listener"),
    };
    assert!(io.open.contains_key(&id));

    assert_eq!(engine.on_tick(&mut io, 60_000), 1);
    assert!(engine.sessions().is_empty());
    assert_eq!(io.closed, vec![id]);
    assert!(!io.open.contains_key(&id));

    deliver(&mut engine, &mut io, Channel::Listener, client, b"again", 60_001);
    flush(&mut engine);
    assert_ne!(engine.sessions().get(&client).unwrap().upstream, id);
}

/// Port exhaustion for one client does not stall anyone else.
#[test]
fn test_open_failures_are_isolated() {
    let mut engine = engine(&instance(&["8.8.8.8:53"], ObfuscationFilter::disabled(), 1));
    let mut io = SimTransport {
        fail_opens: 2,
        ..Default::default()
    };

    for port in 4000..4004u16 {
        let client = addr(&format!("10.0.0.5:{port}"));
        deliver(&mut engine, &mut io, Channel::Listener, client, b"q", 0);
    }
    let out = flush(&mut engine);
    assert_eq!(out.len(), 2);

    let stats = engine.stats();
    assert_eq!(stats.open_failures, 2);
    assert_eq!(stats.sessions.active, 2);
    assert_eq!(stats.buffers.outstanding(), 0);
}

/// Random traffic from many clients with random flush points; at the end
/// every buffer and request is back in its pool and the upstreams saw an
/// even round-robin split.
#[test]
fn test_random_traffic_balances() {
    let destinations = ["10.1.0.1:53", "10.1.0.2:53", "10.1.0.3:53"];
    let mut engine = engine(&instance(&destinations, ObfuscationFilter::new(0x33, 3), 1));
    let mut io = SimTransport::default();
    let mut rng = rand::thread_rng();

    let clients: Vec<_> = (0..20u16).map(|i| addr(&format!("10.0.0.{}:{}", i % 5 + 1, 5000 + i))).collect();
    let mut per_dest: HashMap<_, usize> = HashMap::new();
    let mut now = 0;

    for _ in 0..600 {
        now += rng.gen_range(0..5);
        let client = clients[rng.gen_range(0..clients.len())];
        let len = rng.gen_range(1..512);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        deliver(&mut engine, &mut io, Channel::Listener, client, &payload, now);

        if rng.gen_bool(0.3) {
            for sent in flush(&mut engine) {
                *per_dest.entry(sent.dest).or_default() += 1;
            }
        }
    }
    for sent in flush(&mut engine) {
        *per_dest.entry(sent.dest).or_default() += 1;
    }

    for dest in destinations {
        assert_eq!(per_dest[&addr(dest)], 200, "uneven split for {dest}");
    }

    let stats = engine.stats();
    assert_eq!(stats.sessions.active, clients.len());
    assert_eq!(io.open.len(), clients.len());
    assert_eq!(stats.buffers.outstanding(), 0);
    assert_eq!(stats.buffers_in_use, 0);
    assert_eq!(stats.requests_in_use, 0);
    assert_eq!(stats.queued_sends, 0);
}
