//! Source lifecycle: startup, init, override, shutdown, hijack, free.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::sync::Arc;

use bytes::Bytes;

use crate::client::{ClientFlags, ClientHandle, ClientOp, NO_WORKER};
use crate::engine::Engine;
use crate::error::{CastError, CastResult};
use crate::format::{format_for_content_type, write_refbuf_to_client};
use crate::queue::RefBlock;
use crate::source::{
    wake_listeners, FallbackDescriptor, FallbackKind, Source, SourceFlags, SourceInner,
};
use crate::utils::{expand_time_pattern, now_millis};
use crate::worker::Tick;

/// Brings a reserved source up on the producer's first tick.
///
/// Opens the dump file, seeds counters and rate meters, lifts stream
/// metadata out of the producer's headers, and marks the source RUNNING.
/// Returns true when the mount wants to claim its fallback's listeners.
pub(crate) fn init(
    engine: &Engine,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    producer: &ClientHandle,
    now: u64,
) -> bool {
    inner.initialised = true;
    inner.connected_at = now;
    inner.last_read = now;
    inner.client_stats_update_at = now + inner.stats_interval;
    inner.worker_balance_recheck_at = now + (engine.source_count() as u64).max(6);
    inner.flags.insert(SourceFlags::RUNNING);
    inner
        .flags
        .remove(SourceFlags::ON_DEMAND | SourceFlags::TIMEOUT | SourceFlags::TERMINATING);

    if inner.dump_file.is_none() {
        if let Some(pattern) = inner.dump_filename.clone() {
            let path = expand_time_pattern(&pattern);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    log::info!("[Source] {} dumping to {path}", source.mount);
                    inner.dump_file = Some(file);
                }
                Err(e) => log::warn!("[Source] {} cannot open dump {path}: {e}", source.mount),
            }
        }
    }

    {
        let c = producer.lock();
        if let Some(info) = c.parser.header("ice-audio-info") {
            inner.audio_info = parse_audio_info(info);
        }
        let mc = &mut inner.mount_config;
        if mc.stream_name.is_none() {
            mc.stream_name = c.parser.header("ice-name").map(str::to_string);
        }
        if mc.stream_genre.is_none() {
            mc.stream_genre = c.parser.header("ice-genre").map(str::to_string);
        }
        if mc.stream_url.is_none() {
            mc.stream_url = c.parser.header("ice-url").map(str::to_string);
        }
        if mc.stream_description.is_none() {
            mc.stream_description = c.parser.header("ice-description").map(str::to_string);
        }
    }

    if inner.limit_rate == 0 {
        if let Some(kbps) = inner
            .audio_info
            .get("bitrate")
            .and_then(|b| b.parse::<u64>().ok())
        {
            inner.limit_rate = kbps * 1000;
        }
    }

    let mount = &source.mount;
    if let Some(name) = &inner.mount_config.stream_name {
        engine.stats.set(mount, "server_name", name.as_str());
    }
    if let Some(fmt) = inner.format.as_ref() {
        engine.stats.set(mount, "server_type", fmt.contenttype());
    }
    engine
        .stats
        .set(mount, "public", if inner.yp_public { 1 } else { 0 });
    for (key, value) in &inner.audio_info {
        if key == "bitrate" {
            engine.stats.set(mount, "bitrate", value.as_str());
        } else {
            engine
                .stats
                .set(mount, &format!("audio_{key}"), value.as_str());
        }
    }

    engine.auth.stream_start(mount);
    run_script(inner.mount_config.on_connect.as_deref(), mount);
    log::info!("[Source] {mount} running");

    inner.mount_config.fallback_override && inner.mount_config.fallback_mount.is_some()
}

/// Parses an `ice-audio-info` header value.
///
/// Pairs are `;`-separated. Only `ice-`-prefixed keys (prefix stripped) and
/// the bare `bitrate` key are kept; values are url-unescaped.
pub(crate) fn parse_audio_info(value: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in value.split(';') {
        let mut parts = pair.splitn(2, '=');
        let (Some(key), Some(val)) = (parts.next(), parts.next()) else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let key = if key == "bitrate" {
            key
        } else if let Some(stripped) = key.strip_prefix("ice-") {
            stripped.to_string()
        } else {
            continue;
        };
        let val = urlencoding::decode(val.trim())
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| val.trim().to_string());
        map.insert(key, val);
    }
    map
}

/// Points the listeners of whatever source serves `from_mount` at
/// `dest_mount`.
///
/// Applies only when the victim is live, has listeners, and shares the
/// codec type; otherwise the request is forwarded to the file server in
/// case a static file is being served there.
pub(crate) fn set_override(
    engine: &Engine,
    from_mount: &str,
    dest_mount: &str,
    dest_type: Option<&str>,
) {
    let Some(victim) = engine.registry.find_raw(from_mount) else {
        engine.fserve.set_override(from_mount, dest_mount);
        return;
    };
    let now_ms = now_millis();
    let mut v = victim.lock();
    let compatible = match (dest_type, v.format.as_ref().map(|f| f.contenttype())) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    };
    if v.producer.is_none() || v.listener_count == 0 || !compatible {
        log::debug!("[Source] override of {from_mount} skipped");
        return;
    }
    log::info!(
        "[Source] overriding {from_mount}, moving {} listeners to {dest_mount}",
        v.listener_count
    );
    let bitrate = if v.incoming_rate > 0 {
        v.incoming_rate * 8
    } else {
        v.limit_rate
    };
    v.fallback = Some(FallbackDescriptor {
        mount: dest_mount.to_string(),
        kind: FallbackKind::Override,
        bitrate,
        contenttype: dest_type.map(str::to_string),
    });
    v.termination_count = v.listener_count;
    v.timer_start_ms = now_ms;
    v.flags.insert(SourceFlags::LISTENERS_SYNC);
    wake_listeners(engine, &mut v, now_ms);
}

/// Starts the terminating path for a source that lost RUNNING.
pub(crate) fn shutdown(
    engine: &Engine,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    with_fallback: bool,
    now_ms: u64,
) {
    let mount = &source.mount;
    log::info!(
        "[Source] {mount} shutting down, {} listeners attached",
        inner.listener_count
    );
    inner
        .flags
        .remove(SourceFlags::ON_DEMAND | SourceFlags::TIMEOUT);
    inner
        .flags
        .insert(SourceFlags::TERMINATING | SourceFlags::LISTENERS_SYNC);
    inner.termination_count = inner.listener_count;
    inner.timer_start_ms = now_ms;

    publish_final_stats(engine, mount, inner);
    run_script(inner.mount_config.on_disconnect.as_deref(), mount);
    engine.auth.stream_end(mount);

    if with_fallback {
        install_fallback(inner, now_ms / 1000);
    }
    wake_listeners(engine, inner, now_ms);
}

fn publish_final_stats(engine: &Engine, mount: &str, inner: &SourceInner) {
    engine
        .stats
        .set(mount, "total_bytes_read", inner.bytes_read_total);
    engine
        .stats
        .set(mount, "total_bytes_sent", inner.bytes_sent_total);
    engine
        .stats
        .set(mount, "listener_peak", inner.peak_listeners as u64);
}

/// Installs the configured fallback with a bitrate hint.
///
/// The rolling in-rate is trustworthy only once the source has streamed a
/// while; younger sources fall back to the configured rate.
fn install_fallback(inner: &mut SourceInner, now: u64) {
    let dest = match &inner.mount_config.fallback_mount {
        Some(d) if !d.is_empty() => d.clone(),
        _ => return,
    };
    if inner.listener_count == 0 {
        return;
    }
    let bitrate = if now.saturating_sub(inner.connected_at) > 40 {
        inner.in_rate.average(now) * 8
    } else {
        inner.limit_rate
    };
    inner.fallback = Some(FallbackDescriptor {
        mount: dest,
        kind: FallbackKind::Fallback,
        bitrate,
        contenttype: inner.format.as_ref().map(|f| f.contenttype().to_string()),
    });
}

/// Final teardown once every listener has moved on or been released.
///
/// A mount holding paused listeners is parked instead of freed: it stays
/// registered so the next producer resumes it, and the parked listeners
/// pick the stream back up.
pub(crate) fn finish(engine: &Engine, source: &Arc<Source>, producer: &ClientHandle) -> Tick {
    {
        let mut inner = source.lock();
        if inner.listener_count > 0
            && inner.flags.contains(SourceFlags::PAUSE_LISTENERS)
            && engine.running()
        {
            log::info!(
                "[Source] {} parked with {} paused listeners",
                source.mount,
                inner.listener_count
            );
            inner.flags.remove(
                SourceFlags::TERMINATING | SourceFlags::RUNNING | SourceFlags::TIMEOUT,
            );
            inner.flags.insert(SourceFlags::ON_DEMAND);
            inner.producer = None;
            inner.format = None;
            inner.queue.clear();
            inner.total_queue_pos = 0;
            inner.initialised = false;
            inner.on_demand_woken = false;
            engine.source_slot_released();
            let mut c = producer.lock();
            c.shared_data = None;
            c.op = ClientOp::Release;
            return Tick::Done;
        }
    }
    free_source(engine, source);
    engine.source_slot_released();
    let mut c = producer.lock();
    c.shared_data = None;
    c.op = ClientOp::Release;
    log::info!(
        "[Source] {} producer gone, {} bytes received",
        source.mount,
        c.connection.sent_bytes
    );
    Tick::Done
}

/// Unlinks the source from the registry and releases its queue.
pub fn free_source(engine: &Engine, source: &Arc<Source>) {
    engine.registry.remove(&source.mount);
    let mut inner = source.lock();
    inner.queue.clear();
    inner.format = None;
    inner.producer = None;
    inner.listeners.clear();
    engine.stats.remove_mount(&source.mount);
    log::debug!("[Source] {} freed", source.mount);
}

/// Attaches a producer client to `mount`.
///
/// Reserves the mount (or hijacks a running one), accounts the source slot,
/// picks a format adapter from the declared content type, and queues the
/// `200 OK` preamble unless the producer speaks the shoutcast dialect.
pub fn startup(
    engine: &Engine,
    client: &ClientHandle,
    mount: &str,
    shoutcast: bool,
) -> CastResult<()> {
    let config = engine.config();
    let hijack = client.lock().flags.contains(ClientFlags::HIJACKER);
    let source = engine
        .registry
        .reserve(mount, hijack, &config)
        .ok_or_else(|| CastError::MountInUse(mount.to_string()))?;
    let now_ms = now_millis();

    let mut inner = source.lock();
    if hijack && inner.flags.contains(SourceFlags::RUNNING) && inner.producer.is_some() {
        hijack_swap(engine, &source, &mut inner, client, now_ms);
        drop(inner);
        schedule_producer(engine, client);
        return Ok(());
    }
    if inner.producer.is_some() {
        return Err(CastError::MountInUse(mount.to_string()));
    }

    if !engine.try_add_source(config.source_limit) {
        drop(inner);
        discard_reservation(engine, mount);
        return Err(CastError::TooManySources(config.source_limit));
    }

    let declared = {
        let c = client.lock();
        c.parser
            .header("content-type")
            .map(str::to_string)
            .or_else(|| inner.mount_config.stream_type.clone())
            .unwrap_or_else(|| "audio/mpeg".to_string())
    };
    let Some(format) = format_for_content_type(&declared) else {
        drop(inner);
        discard_reservation(engine, mount);
        engine.source_slot_released();
        return Err(CastError::UnsupportedContent(declared));
    };

    inner.format = Some(format);
    inner.producer = Some(client.clone());
    if shoutcast {
        inner.flags.insert(SourceFlags::SHOUTCAST_COMPAT);
    }
    let max_stream = inner.mount_config.max_stream_duration;
    {
        let mut c = client.lock();
        c.shared_data = Some(Arc::clone(&source));
        if max_stream > 0 && c.connection.discon_time == 0 {
            c.connection.discon_time = now_ms / 1000 + max_stream;
        }
        if shoutcast {
            c.op = ClientOp::Producer;
        } else {
            c.refbuf = Some(RefBlock::new(Bytes::from_static(
                b"HTTP/1.0 200 OK\r\n\r\n",
            )));
            c.pos = 0;
            c.op = ClientOp::ProducerHttpSend;
        }
        c.schedule_ms = now_ms;
    }
    drop(inner);
    schedule_producer(engine, client);
    log::info!("[Source] producer attached to {mount}");
    Ok(())
}

/// Drops a reservation that never got going, leaving parked shells with
/// listeners in place.
fn discard_reservation(engine: &Engine, mount: &str) {
    if let Some(src) = engine.registry.find_raw(mount) {
        let inner = src.lock();
        if inner.producer.is_none() && inner.listener_count == 0 {
            drop(inner);
            engine.registry.remove(mount);
        }
    }
}

fn schedule_producer(engine: &Engine, client: &ClientHandle) {
    if client.owner() == NO_WORKER {
        if let Some(w) = engine.workers.least_busy() {
            w.attach(client.clone());
        }
    } else if let Some(w) = engine.workers.get(client.owner()) {
        w.wake_client(client.clone());
    }
}

/// Replaces the current producer with `new` on a running mount.
///
/// The stream identity (mount, listener set) is preserved; the byte
/// timeline restarts at zero so every listener re-syncs with a fresh burst.
fn hijack_swap(
    engine: &Engine,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    new: &ClientHandle,
    now_ms: u64,
) {
    log::info!("[Source] {} hijacked by new producer", source.mount);
    if let Some(old) = inner.producer.take() {
        {
            let mut oc = old.lock();
            oc.flags.remove(ClientFlags::AUTHENTICATED);
            oc.shared_data = None;
            if let Some(fmt) = inner.format.as_ref() {
                oc.connection.sent_bytes = fmt.read_bytes();
            }
            oc.op = ClientOp::Release;
            oc.schedule_ms = now_ms;
        }
        if let Some(w) = engine.workers.get(old.owner()) {
            w.wake_client(old);
        }
    }
    if let Some(fmt) = inner.format.as_mut() {
        fmt.swap_client();
    }

    // Reset listener cursors before the queue so nobody holds a block that
    // is about to be marked for release.
    for h in inner.listeners.values() {
        let mut c = h.lock();
        c.drop_refbuf();
        c.queue_pos = 0;
        c.schedule_ms = now_ms;
    }
    inner.queue.clear();
    inner.total_queue_pos = 0;
    inner.initialised = false;

    inner.producer = Some(new.clone());
    {
        let mut c = new.lock();
        c.shared_data = Some(Arc::clone(source));
        c.refbuf = Some(RefBlock::new(Bytes::from_static(
            b"HTTP/1.0 200 OK\r\n\r\n",
        )));
        c.pos = 0;
        c.op = ClientOp::ProducerHttpSend;
        c.schedule_ms = now_ms;
    }
    wake_listeners(engine, inner, now_ms);
}

/// Producer preamble flush; switches to the pull loop once sent.
pub(crate) fn producer_http_send(engine: &Engine, h: &ClientHandle, now: u64) -> Tick {
    let mut c = h.lock();
    let n = write_refbuf_to_client(&mut c);
    if n < 0 || c.connection.is_error() {
        let src = c.shared_data.take();
        drop(c);
        if let Some(source) = src {
            let mut inner = source.lock();
            inner.producer = None;
            inner.flags.remove(SourceFlags::RUNNING);
            if inner.listener_count > 0 {
                // Hijack preamble failed with listeners attached; let them
                // drain themselves instead of freeing under their feet.
                inner.flags.insert(SourceFlags::TERMINATING);
                drop(inner);
            } else {
                drop(inner);
                free_source(engine, &source);
            }
            engine.source_slot_released();
        }
        return Tick::Done;
    }
    if c.refbuf.as_ref().map_or(true, |rb| c.pos >= rb.len()) {
        c.drop_refbuf();
        c.op = ClientOp::Producer;
        c.schedule_ms = now;
        return Tick::Requeue(now);
    }
    c.schedule_ms = now + 30;
    Tick::Requeue(now + 30)
}

/// Spawns a mount script detached; the child is never waited on.
fn run_script(script: Option<&str>, mount: &str) {
    let Some(path) = script else { return };
    match std::process::Command::new(path).arg(mount).spawn() {
        Ok(child) => drop(child),
        Err(e) => log::warn!("[Source] script {path} failed to spawn: {e}"),
    }
}
