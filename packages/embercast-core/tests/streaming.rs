//! End-to-end scenarios driven by hand-cranked ticks.
//!
//! No workers run here: each test builds an engine without a pool and
//! dispatches producer/listener ticks directly, with scripted in-memory
//! sockets standing in for the network.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use embercast_core::{
    add_listener, now_millis, startup, worker, ClientFlags, ClientHandle, ClientOp, Config, Engine,
    MountConfig, RequestHead, Socket, SourceFlags, Tick,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test transport
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Pipe {
    incoming: VecDeque<u8>,
    outgoing: Vec<u8>,
    closed: bool,
    broken: bool,
    write_budget: Option<usize>,
}

/// Cloneable in-memory socket; the test keeps one end to script traffic.
#[derive(Clone, Default)]
struct TestSocket(Arc<Mutex<Pipe>>);

impl TestSocket {
    fn new() -> Self {
        Self::default()
    }

    fn push(&self, bytes: &[u8]) {
        self.0.lock().incoming.extend(bytes.iter().copied());
    }

    fn sent(&self) -> Vec<u8> {
        self.0.lock().outgoing.clone()
    }

    fn break_pipe(&self) {
        self.0.lock().broken = true;
    }

    fn set_write_budget(&self, budget: Option<usize>) {
        self.0.lock().write_budget = budget;
    }
}

impl Socket for TestSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut p = self.0.lock();
        if p.broken {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "broken"));
        }
        if p.incoming.is_empty() {
            if p.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(p.incoming.len());
        for slot in buf.iter_mut().take(n) {
            *slot = p.incoming.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut p = self.0.lock();
        if p.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
        }
        let n = match p.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => buf.len().min(budget),
            None => buf.len(),
        };
        if let Some(budget) = p.write_budget.as_mut() {
            *budget -= n;
        }
        p.outgoing.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn readable(&mut self) -> io::Result<bool> {
        let p = self.0.lock();
        if p.broken {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "broken"));
        }
        Ok(!p.incoming.is_empty() || p.closed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

fn base_config() -> Config {
    Config {
        queue_size_limit: 500_000,
        min_queue_size: 65_536,
        burst_size: 16_384,
        ..Config::default()
    }
}

fn source_head() -> RequestHead {
    let mut head = RequestHead {
        method: "PUT".into(),
        uri: "/live".into(),
        ..RequestHead::default()
    };
    head.headers
        .insert("content-type".into(), "audio/mpeg".into());
    head
}

fn listener_head() -> RequestHead {
    RequestHead {
        method: "GET".into(),
        uri: "/live".into(),
        ..RequestHead::default()
    }
}

fn new_producer(engine: &Arc<Engine>, head: RequestHead) -> (ClientHandle, TestSocket) {
    let sock = TestSocket::new();
    let h = engine.new_client(
        Box::new(sock.clone()),
        "127.0.0.1".parse().unwrap(),
        head,
    );
    (h, sock)
}

/// Runs one tick with the schedule forced due.
fn tick(engine: &Arc<Engine>, h: &ClientHandle) -> Tick {
    h.lock().schedule_ms = 0;
    worker::dispatch(engine, h, now_millis())
}

/// Ticks until the client stops making visible progress.
fn drain(engine: &Arc<Engine>, h: &ClientHandle, sock: &TestSocket) {
    let mut last = usize::MAX;
    for _ in 0..200 {
        match tick(engine, h) {
            Tick::Done | Tick::Moved => return,
            Tick::Requeue(_) => {}
        }
        let len = sock.sent().len();
        if len == last {
            return;
        }
        last = len;
    }
}

/// Deterministic position-dependent stream bytes.
fn stream_bytes(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len).map(|i| (i % 251) as u8).collect()
}

/// Attaches a producer to `mount` and flushes its 200 OK preamble.
fn start_source(engine: &Arc<Engine>, mount: &str) -> (ClientHandle, TestSocket) {
    let mut head = source_head();
    head.uri = mount.to_string();
    let (h, sock) = new_producer(engine, head);
    startup(engine, &h, mount, false).expect("producer attach");
    tick(engine, &h);
    assert!(sock.sent().starts_with(b"HTTP/1.0 200 OK\r\n\r\n"));
    (h, sock)
}

/// Feeds `bytes` through the producer in tick-sized bites.
fn pump_stream(engine: &Arc<Engine>, producer: &ClientHandle, sock: &TestSocket, bytes: &[u8]) {
    sock.push(bytes);
    for _ in 0..(bytes.len() / 4096 + 4) {
        tick(engine, producer);
    }
}

/// Audio payload a listener received (everything after the response head).
fn audio_sent(sock: &TestSocket) -> Vec<u8> {
    let sent = sock.sent();
    let head_end = sent
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .unwrap_or(0);
    sent[head_end..].to_vec()
}

fn attach_listener(engine: &Arc<Engine>, mount: &str) -> (ClientHandle, TestSocket) {
    let mut head = listener_head();
    head.uri = mount.to_string();
    let sock = TestSocket::new();
    let h = engine.new_client(
        Box::new(sock.clone()),
        "10.0.0.9".parse().unwrap(),
        head,
    );
    add_listener(engine, mount, &h).expect("listener admitted");
    (h, sock)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn burst_on_connect_starts_near_tail_on_sync() {
    let engine = Engine::new(base_config());
    let (producer, psock) = start_source(&engine, "/live");

    let data = stream_bytes(0, 204_800);
    pump_stream(&engine, &producer, &psock, &data);

    let (listener, lsock) = attach_listener(&engine, "/live");
    drain(&engine, &listener, &lsock);

    let sent = lsock.sent();
    assert!(sent.starts_with(b"HTTP/1.0 200 OK\r\n"));
    let audio = audio_sent(&lsock);
    // The first delivered byte sits one burst (±1 block) behind the tail.
    assert!(audio.len() <= 16_384, "got {} bytes", audio.len());
    assert!(audio.len() > 16_384 - 4096, "got {} bytes", audio.len());
    assert_eq!(&audio[..], &data[data.len() - audio.len()..]);
}

#[test]
fn listener_burst_query_overrides_default() {
    let engine = Engine::new(base_config());
    let (producer, psock) = start_source(&engine, "/live");
    pump_stream(&engine, &producer, &psock, &stream_bytes(0, 204_800));

    let mut head = listener_head();
    head.query.insert("burst".into(), "4096".into());
    // The header loses to the query parameter.
    head.headers.insert("initial-burst".into(), "60000".into());
    let sock = TestSocket::new();
    let h = engine.new_client(Box::new(sock.clone()), "10.0.0.9".parse().unwrap(), head);
    add_listener(&engine, "/live", &h).unwrap();
    drain(&engine, &h, &sock);

    let audio = audio_sent(&sock);
    assert!(audio.len() <= 4096, "got {} bytes", audio.len());
}

#[test]
fn listener_stream_is_contiguous_suffix_while_live() {
    let engine = Engine::new(base_config());
    let (producer, psock) = start_source(&engine, "/live");
    pump_stream(&engine, &producer, &psock, &stream_bytes(0, 65_536));

    let (listener, lsock) = attach_listener(&engine, "/live");
    drain(&engine, &listener, &lsock);

    // Keep streaming while the listener rides along.
    let mut offset = 65_536;
    for _ in 0..10 {
        pump_stream(&engine, &producer, &psock, &stream_bytes(offset, 8192));
        offset += 8192;
        drain(&engine, &listener, &lsock);
    }

    let full = stream_bytes(0, offset);
    let audio = audio_sent(&lsock);
    assert!(!audio.is_empty());
    // Contiguous suffix of the producer's byte stream, no gaps or repeats.
    assert_eq!(&audio[..], &full[full.len() - audio.len()..]);
}

#[test]
fn slow_listener_is_marked_and_dropped() {
    let mut config = base_config();
    config.queue_size_limit = 16_384;
    config.min_queue_size = 8192;
    config.burst_size = 4096;
    let engine = Engine::new(config);
    let (producer, psock) = start_source(&engine, "/live");
    pump_stream(&engine, &producer, &psock, &stream_bytes(0, 16_384));

    let (listener, lsock) = attach_listener(&engine, "/live");
    drain(&engine, &listener, &lsock);
    // Stop accepting bytes; the cursor pins its block while the queue rolls.
    lsock.set_write_budget(Some(0));
    tick(&engine, &listener);

    pump_stream(&engine, &producer, &psock, &stream_bytes(16_384, 65_536));

    let mut released = false;
    for _ in 0..20 {
        if tick(&engine, &listener) == Tick::Done {
            released = true;
            break;
        }
    }
    assert!(released, "slow listener should be dropped");
    assert_eq!(listener.lock().op, ClientOp::Release);
    let src = engine.registry.find_raw("/live").unwrap();
    assert_eq!(src.lock().listener_count, 0);
    assert_eq!(
        engine.stats.get("/live", "slow_listeners"),
        Some(serde_json::json!(1))
    );
}

#[test]
fn listeners_follow_fallback_when_source_dies() {
    let mut config = base_config();
    config.mounts.insert(
        "/live".into(),
        MountConfig {
            fallback_mount: Some("/backup".into()),
            ..MountConfig::default()
        },
    );
    let engine = Engine::new(config);

    let (backup, bsock) = start_source(&engine, "/backup");
    pump_stream(&engine, &backup, &bsock, &stream_bytes(0, 65_536));
    let (live, lsock_p) = start_source(&engine, "/live");
    pump_stream(&engine, &live, &lsock_p, &stream_bytes(0, 65_536));

    let (listener, lsock) = attach_listener(&engine, "/live");
    drain(&engine, &listener, &lsock);

    // Kill the /live producer socket.
    lsock_p.break_pipe();
    tick(&engine, &live); // notices the error, drops RUNNING
    tick(&engine, &live); // enters the terminating path, wakes listeners
    tick(&engine, &listener); // acknowledges and moves to the fallback

    let backup_src = engine.registry.find_raw("/backup").unwrap();
    assert_eq!(backup_src.lock().listener_count, 1);
    assert!(listener
        .lock()
        .flags
        .contains(ClientFlags::HAS_MOVED));

    // Producer drains the sync and frees the mount.
    let mut freed = false;
    for _ in 0..10 {
        if tick(&engine, &live) == Tick::Done {
            freed = true;
            break;
        }
    }
    assert!(freed);
    assert!(engine.registry.find_raw("/live").is_none());

    // The moved listener keeps receiving audio, now from /backup.
    let before = lsock.sent().len();
    drain(&engine, &listener, &lsock);
    assert!(lsock.sent().len() > before);
}

#[test]
fn override_claims_fallback_listeners() {
    let mut config = base_config();
    config.mounts.insert(
        "/live".into(),
        MountConfig {
            fallback_mount: Some("/backup".into()),
            fallback_override: true,
            ..MountConfig::default()
        },
    );
    let engine = Engine::new(config);

    let (backup, bsock) = start_source(&engine, "/backup");
    pump_stream(&engine, &backup, &bsock, &stream_bytes(0, 65_536));

    let mut listeners = Vec::new();
    for _ in 0..3 {
        let (h, s) = attach_listener(&engine, "/backup");
        drain(&engine, &h, &s);
        listeners.push((h, s));
    }
    assert_eq!(
        engine.registry.find_raw("/backup").unwrap().lock().listener_count,
        3
    );

    // Starting /live overrides /backup and claims its listeners.
    let (live, live_sock) = start_source(&engine, "/live");
    tick(&engine, &live); // init runs the override
    for (h, _) in &listeners {
        tick(&engine, h);
    }

    let live_src = engine.registry.find_raw("/live").unwrap();
    let backup_src = engine.registry.find_raw("/backup").unwrap();
    assert_eq!(live_src.lock().listener_count, 3);
    assert_eq!(backup_src.lock().listener_count, 0);

    // New stream flows to the claimed listeners.
    pump_stream(&engine, &live, &live_sock, &stream_bytes(0, 65_536));
    for (h, s) in &listeners {
        drain(&engine, h, s);
        assert!(!audio_sent(s).is_empty());
    }
}

#[test]
fn hijacker_swaps_producer_and_listeners_resync() {
    let engine = Engine::new(base_config());
    let (old, old_sock) = start_source(&engine, "/live");
    pump_stream(&engine, &old, &old_sock, &stream_bytes(0, 65_536));

    let (listener, lsock) = attach_listener(&engine, "/live");
    drain(&engine, &listener, &lsock);
    let received_before = audio_sent(&lsock).len();

    let mut head = source_head();
    let hijack_sock = TestSocket::new();
    head.headers
        .insert("content-type".into(), "audio/mpeg".into());
    let new = engine.new_client(
        Box::new(hijack_sock.clone()),
        "127.0.0.1".parse().unwrap(),
        head,
    );
    new.lock().flags.insert(ClientFlags::HIJACKER);
    startup(&engine, &new, "/live", false).expect("hijack accepted");

    // Old producer is dropped on its next tick; identity is preserved.
    assert_eq!(old.lock().op, ClientOp::Release);
    assert_eq!(tick(&engine, &old), Tick::Done);
    let src = engine.registry.find_raw("/live").unwrap();
    assert_eq!(src.lock().listener_count, 1);
    assert_eq!(listener.lock().queue_pos, 0);

    // New producer streams; the listener re-syncs with a fresh burst.
    tick(&engine, &new); // flush 200 OK
    let fresh = stream_bytes(1_000_000, 65_536);
    pump_stream(&engine, &new, &hijack_sock, &fresh);
    drain(&engine, &listener, &lsock);
    let audio = audio_sent(&lsock);
    let new_bytes = &audio[received_before..];
    assert!(!new_bytes.is_empty());
    assert_eq!(new_bytes, &fresh[fresh.len() - new_bytes.len()..]);
}

#[test]
fn global_bandwidth_cap_rejects_with_redirect() {
    let mut config = base_config();
    config.max_bandwidth = 1_000_000;
    config.mounts.insert(
        "/live".into(),
        MountConfig {
            limit_rate: 256_000,
            ..MountConfig::default()
        },
    );
    let engine = Engine::new(config);
    let (producer, psock) = start_source(&engine, "/live");
    pump_stream(&engine, &producer, &psock, &stream_bytes(0, 65_536));

    let mut kept = Vec::new();
    for _ in 0..3 {
        let (h, s) = attach_listener(&engine, "/live");
        drain(&engine, &h, &s);
        kept.push((h, s));
    }

    // Simulate existing delivery load, then the 4th attach must bounce.
    engine.add_out_bytes(embercast_core::now_secs(), 400_000);
    let sock = TestSocket::new();
    let h = engine.new_client(
        Box::new(sock.clone()),
        "10.0.0.13".parse().unwrap(),
        listener_head(),
    );
    let err = add_listener(&engine, "/live", &h).unwrap_err();
    assert_eq!(err.http_status(), 403);
    assert_eq!(err.redirect_mount(), Some("/live"));

    embercast_core::send_reject(&engine, &h, &err);
    drain(&engine, &h, &sock);
    let sent = String::from_utf8_lossy(&sock.sent()).to_string();
    assert!(sent.starts_with("HTTP/1.0 403 Forbidden\r\n"));
    assert!(sent.contains("Location: http://localhost:8000/live\r\n"));

    // The three admitted listeners are untouched.
    let src = engine.registry.find_raw("/live").unwrap();
    assert_eq!(src.lock().listener_count, 3);
}

#[test]
fn fallback_chain_depth_is_bounded() {
    let mut config = base_config();
    for i in 0..15 {
        config.mounts.insert(
            format!("/m{i}"),
            MountConfig {
                fallback_mount: Some(format!("/m{}", i + 1)),
                ..MountConfig::default()
            },
        );
    }
    let engine = Engine::new(config);
    let sock = TestSocket::new();
    let h = engine.new_client(
        Box::new(sock.clone()),
        "10.0.0.2".parse().unwrap(),
        listener_head(),
    );
    let err = add_listener(&engine, "/m0", &h).unwrap_err();
    assert_eq!(err.http_status(), 403);
    assert_eq!(err.code(), "fallback_too_deep");
}

#[test]
fn second_producer_is_refused_without_hijack() {
    let engine = Engine::new(base_config());
    let (_p, _s) = start_source(&engine, "/live");
    let (other, _osock) = new_producer(&engine, source_head());
    let err = startup(&engine, &other, "/live", false).unwrap_err();
    assert_eq!(err.code(), "mount_in_use");
}

#[test]
fn source_limit_rejects_extra_producers() {
    let mut config = base_config();
    config.source_limit = 1;
    let engine = Engine::new(config);
    let (_p, _s) = start_source(&engine, "/live");
    let mut head = source_head();
    head.uri = "/second".into();
    let (other, _osock) = new_producer(&engine, head);
    let err = startup(&engine, &other, "/second", false).unwrap_err();
    assert_eq!(err.code(), "source_limit_reached");
    assert!(engine.registry.find_raw("/second").is_none());
}

#[test]
fn listener_count_tracks_membership() {
    let engine = Engine::new(base_config());
    let (producer, psock) = start_source(&engine, "/live");
    pump_stream(&engine, &producer, &psock, &stream_bytes(0, 32_768));

    let mut all = Vec::new();
    for _ in 0..5 {
        all.push(attach_listener(&engine, "/live"));
    }
    let src = engine.registry.find_raw("/live").unwrap();
    {
        let inner = src.lock();
        assert_eq!(inner.listener_count, inner.listeners.len());
        assert_eq!(inner.listener_count, 5);
    }

    // Error out two of them; counts stay consistent. The first tick trips
    // over the broken socket, the second observes the error and releases.
    all[0].1.break_pipe();
    all[3].1.break_pipe();
    for idx in [0, 3] {
        tick(&engine, &all[idx].0);
        tick(&engine, &all[idx].0);
    }
    let inner = src.lock();
    assert_eq!(inner.listener_count, inner.listeners.len());
    assert_eq!(inner.listener_count, 3);
}

#[test]
fn source_timeout_flag_set_when_idle_too_long() {
    let mut config = base_config();
    config.source_timeout = 0; // immediate timeout once last_read lapses
    let engine = Engine::new(config);
    let (producer, psock) = start_source(&engine, "/live");
    pump_stream(&engine, &producer, &psock, &stream_bytes(0, 4096));

    {
        // Backdate the last read so the idle check fires.
        let src = engine.registry.find_raw("/live").unwrap();
        src.lock().last_read = 1;
    }
    tick(&engine, &producer);
    let src = engine.registry.find_raw("/live").unwrap();
    let inner = src.lock();
    assert!(inner.flags.contains(SourceFlags::TIMEOUT));
    assert!(!inner.flags.contains(SourceFlags::RUNNING));
}
