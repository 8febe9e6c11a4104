//! Listener admission and the fallback resolver.
//!
//! Attaching a listener walks the fallback chain looking for a live source
//! while enforcing the bandwidth and listener caps; a chain ending with no
//! source may still be served from a static file when a rate hint exists.
//! Rejections become a 403 pointed back at the originally-requested mount
//! so clients retry the right place once capacity returns.

use std::sync::Arc;

use bytes::Bytes;

use crate::client::{CheckBuffer, ClientFlags, ClientHandle, ClientOp, NO_WORKER};
use crate::engine::Engine;
use crate::error::{CastError, CastResult};
use crate::queue::RefBlock;
use crate::registry::MAX_FALLBACK_DEPTH;
use crate::source::{FallbackDescriptor, Source, SourceFlags, SourceInner};
use crate::utils::{now_millis, now_secs, rate_hint_from_mount};

/// Attaches `client` to `mount`, hopping fallbacks as needed.
///
/// On error the caller is expected to answer the client, usually via
/// [`send_reject`].
pub fn add_listener(engine: &Engine, mount: &str, client: &ClientHandle) -> CastResult<()> {
    let config = engine.config();
    let original = mount.to_string();
    let mut name = mount.to_string();
    let is_slave = {
        let c = client.lock();
        c.flags
            .contains(ClientFlags::IS_SLAVE | ClientFlags::AUTHENTICATED)
    };

    for _hop in 0..MAX_FALLBACK_DEPTH {
        let mcfg = config.mount(&name);
        let live = engine.registry.find_raw(&name).filter(|s| s.available());
        let Some(source) = live else {
            if let Some(next) = mcfg.fallback_mount {
                name = next;
                continue;
            }
            // No live source anywhere on the chain; a rate hint lets the
            // static file server take over.
            let hinted = rate_hint_from_mount(&name);
            let rate = hinted.map(|(_, r)| r).or_else(|| {
                (mcfg.limit_rate > 0).then_some(mcfg.limit_rate)
            });
            if let Some(rate) = rate {
                let bare = hinted.map(|(m, _)| m).unwrap_or(&name).to_string();
                if engine.fserve.serve_fallback_file(client, &bare, rate) {
                    client.lock().flags.insert(ClientFlags::IN_FSERVE);
                    return Ok(());
                }
            }
            return Err(CastError::MountNotFound(original));
        };

        let mut inner = source.lock();
        if inner.producer.is_none() || inner.flags.contains(SourceFlags::TERMINATING) {
            // Lost the race with a shutdown; follow the chain.
            drop(inner);
            match config.mount(&name).fallback_mount {
                Some(next) => {
                    name = next;
                    continue;
                }
                None => return Err(CastError::MountNotFound(original)),
            }
        }

        if !is_slave {
            let now = now_secs();
            let share = if inner.incoming_rate > 0 {
                inner.incoming_rate * 8
            } else {
                inner.limit_rate
            };

            if config.max_bandwidth > 0 && engine.out_bitrate(now) + share > config.max_bandwidth {
                return Err(CastError::BandwidthExceeded {
                    mount: name,
                    redirect: Some(original),
                });
            }

            let username = client.lock().parser.username.clone();
            let existing: Vec<String> = inner
                .listeners
                .values()
                .filter_map(|l| l.lock().parser.username.clone())
                .collect();
            if !engine
                .auth
                .check_duplicate_logins(&name, username.as_deref(), &existing)
            {
                return Err(CastError::DuplicateLogin(name));
            }

            let out_bits = inner.out_rate.average(now) * 8;
            let mc = &inner.mount_config;
            let over_listeners =
                mc.max_listeners >= 0 && inner.listener_count as i64 + 1 > mc.max_listeners;
            let over_bandwidth =
                mc.max_bandwidth >= 0 && (out_bits + share) as i64 > mc.max_bandwidth;
            if over_listeners || over_bandwidth {
                if mc.fallback_when_full {
                    if let Some(next) = mc.fallback_mount.clone() {
                        drop(inner);
                        name = next;
                        continue;
                    }
                }
                return Err(CastError::Full {
                    mount: name,
                    redirect: Some(original),
                });
            }
        }

        {
            let mut c = client.lock();
            let duration = inner.mount_config.max_listener_duration;
            if duration > 0 && c.connection.discon_time == 0 {
                c.connection.discon_time = now_secs() + duration;
            }
        }

        setup_listener(engine, &source, &mut inner, client);
        drop(inner);
        engine.listener_connected();
        log::info!("[Admission] listener {} on {name}", client.id());
        return Ok(());
    }

    Err(CastError::FallbackTooDeep(original))
}

/// Inserts a listener into a source's set and arms its first tick.
pub(crate) fn setup_listener(
    engine: &Engine,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    client: &ClientHandle,
) {
    let now_ms = now_millis();
    let state = if inner.flags.contains(SourceFlags::LISTENERS_SYNC) {
        CheckBuffer::Wait
    } else if inner.flags.contains(SourceFlags::ON_DEMAND)
        && !inner.flags.contains(SourceFlags::RUNNING)
    {
        // First listener on an idle on-demand mount kicks its producer.
        if !inner.on_demand_woken {
            inner.on_demand_woken = true;
            if let Some(p) = &inner.producer {
                p.lock().schedule_ms = now_ms;
                if let Some(w) = engine.workers.get(p.owner()) {
                    w.wake_client(p.clone());
                }
            }
        }
        CheckBuffer::Pause
    } else {
        CheckBuffer::HttpHeaders
    };

    {
        let mut c = client.lock();
        c.shared_data = Some(Arc::clone(source));
        c.op = ClientOp::Listener;
        c.drop_refbuf();
        c.connection.sent_bytes = 0;
        c.queue_pos = 0;
        c.check_buffer = state;
        if state == CheckBuffer::Pause {
            c.timer_start = now_ms;
        }
        c.flags.remove(ClientFlags::HAS_INTRO_CONTENT);
        c.schedule_ms = now_ms;
    }

    inner.listeners.insert(client.id(), client.clone());
    inner.listener_count += 1;

    if client.owner() == NO_WORKER {
        if let Some(w) = engine.workers.least_busy() {
            w.attach(client.clone());
        }
    } else if let Some(w) = engine.workers.get(client.owner()) {
        w.wake_client(client.clone());
    }
}

/// Re-homes a listener leaving a dying or overridden mount.
///
/// Returns true when the listener landed somewhere (a live source on the
/// descriptor's chain, or the static file server).
pub(crate) fn move_listener(
    engine: &Engine,
    client: &ClientHandle,
    fallback: &FallbackDescriptor,
) -> bool {
    let config = engine.config();
    let Some(dest) = engine.registry.find_with_fallback(&fallback.mount, &config) else {
        if let Some((bare, rate)) = rate_hint_from_mount(&fallback.mount) {
            if engine.fserve.serve_fallback_file(client, bare, rate) {
                client
                    .lock()
                    .flags
                    .insert(ClientFlags::IN_FSERVE | ClientFlags::HAS_MOVED);
                return true;
            }
        }
        return false;
    };

    let mut inner = dest.lock();
    if inner.producer.is_none() {
        return false;
    }
    if let (Some(want), Some(have)) = (
        fallback.contenttype.as_deref(),
        inner.format.as_ref().map(|f| f.contenttype()),
    ) {
        if want != have {
            log::debug!(
                "[Admission] {} not moved to {}: codec mismatch",
                client.id(),
                dest.mount
            );
            return false;
        }
    }
    let mc = &inner.mount_config;
    if mc.max_listeners >= 0 && inner.listener_count as i64 + 1 > mc.max_listeners {
        return false;
    }

    setup_listener(engine, &dest, &mut inner, client);
    drop(inner);
    client.lock().flags.insert(ClientFlags::HAS_MOVED);
    log::info!("[Admission] listener {} moved to {}", client.id(), dest.mount);
    true
}

/// Queues an HTTP rejection on the client and schedules the drain.
pub fn send_reject(engine: &Engine, client: &ClientHandle, err: &CastError) {
    let config = engine.config();
    let status = err.http_status();
    let reason = match status {
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Error",
    };
    let body = format!("{err}\r\n");
    let mut head = format!(
        "HTTP/1.0 {status} {reason}\r\nServer: Embercast\r\nContent-Type: text/plain\r\n"
    );
    if let Some(mount) = err.redirect_mount() {
        head.push_str(&format!(
            "Location: http://{}:{}{}\r\n",
            config.hostname, config.port, mount
        ));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));

    {
        let mut c = client.lock();
        c.drop_refbuf();
        c.refbuf = Some(RefBlock::new(Bytes::from(head)));
        c.pos = 0;
        c.respcode = status;
        c.op = ClientOp::Drain;
        c.schedule_ms = now_millis();
    }
    if client.owner() == NO_WORKER {
        if let Some(w) = engine.workers.least_busy() {
            w.attach(client.clone());
        }
    } else if let Some(w) = engine.workers.get(client.owner()) {
        w.wake_client(client.clone());
    }
}
