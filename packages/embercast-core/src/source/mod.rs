//! Per-mount source state and the producer tick.
//!
//! A [`Source`] is one mount: the block queue, the producer client, the
//! listener set, and the flag word driving its state machine. One mutex
//! guards all of it; block payloads are immutable once queued, so listeners
//! read them lock-free. The producer tick ([`source_read`]) pulls blocks
//! from the format adapter, appends them to the queue, trims the head, and
//! paces itself with a backoff that stretches while the socket is quiet.

pub mod lifecycle;
pub mod listener;

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::client::ClientHandle;
use crate::config::Config;
use crate::engine::Engine;
use crate::format::FormatAdapter;
use crate::queue::SourceQueue;
use crate::rate::Rate;
use crate::utils::now_millis;
use crate::worker::{balance, Tick};

/// Window (seconds) of the incoming rate meter.
const IN_RATE_WINDOW: u64 = 60;

/// Window (seconds) of the outgoing rate meter.
const OUT_RATE_WINDOW: u64 = 9000;

/// How long (ms) a coordinated listener transition may take before it is
/// forced through.
const LISTENER_SYNC_DEADLINE_MS: u64 = 1500;

bitflags! {
    /// Source state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceFlags: u32 {
        /// Producer connected and streaming.
        const RUNNING = 0x0001;
        /// Mount reserved without an active producer yet.
        const ON_DEMAND = 0x0002;
        /// Tearing down; mutually exclusive with RUNNING in steady state.
        const TERMINATING = 0x0004;
        /// Coordinated listener transition (fallback/override) in flight.
        const LISTENERS_SYNC = 0x0008;
        /// Park listeners instead of dropping them on producer loss.
        const PAUSE_LISTENERS = 0x0010;
        /// Producer read timed out.
        const TIMEOUT = 0x0020;
        /// Producer speaks the shoutcast dialect; no HTTP preamble.
        const SHOUTCAST_COMPAT = 0x0040;
    }
}

/// Why listeners are being pointed at another mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    /// This mount died; listeners drain to the fallback.
    Fallback,
    /// Another mount started and claims this one's listeners.
    Override,
}

/// Where and how listeners leave a terminating or overridden mount.
#[derive(Debug, Clone)]
pub struct FallbackDescriptor {
    pub mount: String,
    pub kind: FallbackKind,
    /// Bitrate hint (bits/sec) for admission on the destination.
    pub bitrate: u64,
    /// Codec type the destination must share, when known.
    pub contenttype: Option<String>,
}

/// Everything mutable about a mount, behind the source lock.
pub struct SourceInner {
    pub flags: SourceFlags,
    pub queue: SourceQueue,
    pub format: Option<Box<dyn FormatAdapter>>,
    pub producer: Option<ClientHandle>,
    pub listeners: BTreeMap<u64, ClientHandle>,
    pub listener_count: usize,
    pub peak_listeners: usize,
    pub prev_listeners: usize,
    /// Listeners still to acknowledge the current coordinated transition.
    pub termination_count: usize,

    /// Unix seconds of the last successful producer read.
    pub last_read: u64,
    pub timeout_secs: u64,
    /// Producer poll backoff, ms.
    pub skip_ms: u64,
    pub stats_interval: u64,
    /// Next stats publication, Unix seconds.
    pub client_stats_update_at: u64,
    /// Next worker-balance consult, Unix seconds.
    pub worker_balance_recheck_at: u64,

    /// Configured rate hint, bits/sec (0 = unknown).
    pub limit_rate: u64,
    /// Rolling incoming rate, bytes/sec, refreshed each stats tick.
    pub incoming_rate: u64,
    /// Per-tick listener write budget, bytes.
    pub listener_send_trigger: usize,

    pub fallback: Option<FallbackDescriptor>,
    pub intro_filename: Option<String>,
    pub dump_file: Option<File>,
    pub dump_filename: Option<String>,
    pub audio_info: BTreeMap<String, String>,
    pub yp_public: bool,
    /// Idle listener pacing, ms.
    pub wait_time: u64,

    pub in_rate: Rate,
    pub out_rate: Rate,
    pub bytes_read_total: u64,
    pub bytes_sent_total: u64,
    pub bytes_sent_since_update: u64,
    pub slow_listeners: u64,

    /// Producer byte counter; a listener's lag is this minus its own.
    pub total_queue_pos: u64,
    /// Millisecond timestamp of the current transition, for the sync deadline.
    pub timer_start_ms: u64,
    /// The producer's next due time; caught-up listeners ride just behind it.
    pub producer_schedule_ms: u64,
    /// Unix seconds the producer connected.
    pub connected_at: u64,

    pub mount_config: crate::config::MountConfig,
    pub(crate) initialised: bool,
    pub(crate) on_demand_woken: bool,
}

/// One mount's source.
pub struct Source {
    pub mount: String,
    inner: Mutex<SourceInner>,
}

impl Source {
    /// Creates the source in its reserved (not running) state.
    pub fn new(mount: &str, config: &Config) -> Arc<Self> {
        let mc = config.mount(mount);
        let mut flags = SourceFlags::empty();
        if mc.on_demand {
            flags.insert(SourceFlags::ON_DEMAND);
        }
        if mc.pause_listeners {
            flags.insert(SourceFlags::PAUSE_LISTENERS);
        }
        Arc::new(Self {
            mount: mount.to_string(),
            inner: Mutex::new(SourceInner {
                flags,
                queue: SourceQueue::new(
                    config.min_queue_size_for(&mc),
                    config.burst_size_for(&mc),
                    config.queue_size_limit_for(&mc),
                ),
                format: None,
                producer: None,
                listeners: BTreeMap::new(),
                listener_count: 0,
                peak_listeners: 0,
                prev_listeners: 0,
                termination_count: 0,
                last_read: 0,
                timeout_secs: config.source_timeout_for(&mc),
                skip_ms: 30,
                stats_interval: config.stats_interval.max(1),
                client_stats_update_at: 0,
                worker_balance_recheck_at: 0,
                limit_rate: mc.limit_rate,
                incoming_rate: 0,
                listener_send_trigger: 4096,
                fallback: None,
                intro_filename: mc.intro_filename.clone(),
                dump_file: None,
                dump_filename: mc.dumpfile.clone(),
                audio_info: BTreeMap::new(),
                yp_public: mc.yp_public,
                wait_time: mc.wait_time.max(10),
                in_rate: Rate::new(IN_RATE_WINDOW),
                out_rate: Rate::new(OUT_RATE_WINDOW),
                bytes_read_total: 0,
                bytes_sent_total: 0,
                bytes_sent_since_update: 0,
                slow_listeners: 0,
                total_queue_pos: 0,
                timer_start_ms: 0,
                producer_schedule_ms: 0,
                connected_at: 0,
                mount_config: mc,
                initialised: false,
                on_demand_woken: false,
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, SourceInner> {
        self.inner.lock()
    }

    /// True when a listener can be fed from here: a producer is attached
    /// and the mount is not tearing down.
    pub fn available(&self) -> bool {
        let inner = self.inner.lock();
        inner.producer.is_some() && !inner.flags.contains(SourceFlags::TERMINATING)
    }
}

/// Wakes every listener so their next tick observes the current flags.
pub(crate) fn wake_listeners(engine: &Engine, inner: &mut SourceInner, now_ms: u64) {
    for h in inner.listeners.values() {
        {
            let mut c = h.lock();
            c.schedule_ms = now_ms;
        }
        if let Some(w) = engine.workers.get(h.owner()) {
            w.wake_client(h.clone());
        }
    }
}

/// Producer tick. Runs under the source lock; a `Moved` return means the
/// lock was already released by a worker migration.
pub fn source_read(engine: &Engine, source: &Arc<Source>, producer: &ClientHandle) -> Tick {
    let now_ms = now_millis();
    let now = now_ms / 1000;
    let mut inner = source.lock();

    // First tick after the preamble went out: bring the source up.
    if !inner.initialised {
        let wants_override = lifecycle::init(engine, source, &mut inner, producer, now);
        if wants_override {
            // Claiming another mount's listeners takes that mount's lock;
            // never hold two source locks at once.
            let from = inner.mount_config.fallback_mount.clone();
            let contenttype = inner.format.as_ref().map(|f| f.contenttype().to_string());
            drop(inner);
            if let Some(from) = from {
                lifecycle::set_override(engine, &from, &source.mount, contenttype.as_deref());
            }
            inner = source.lock();
        }
    }

    if !engine.running() {
        inner.flags.remove(SourceFlags::RUNNING);
    }

    {
        let c = producer.lock();
        if c.connection.is_error() {
            inner.flags.remove(SourceFlags::RUNNING);
        } else if c.connection.discon_time > 0 && now >= c.connection.discon_time {
            log::info!("[Source] {} stream duration reached", source.mount);
            inner.flags.remove(SourceFlags::RUNNING);
        }
    }

    if inner.flags.contains(SourceFlags::LISTENERS_SYNC) {
        if inner.termination_count > 0 {
            if now_ms.saturating_sub(inner.timer_start_ms) > LISTENER_SYNC_DEADLINE_MS {
                log::warn!(
                    "[Source] {} gave up waiting on {} listeners to move",
                    source.mount,
                    inner.termination_count
                );
                inner.termination_count = 0;
                inner
                    .flags
                    .remove(SourceFlags::RUNNING | SourceFlags::LISTENERS_SYNC);
            } else {
                inner.producer_schedule_ms = now_ms + 30;
                set_schedule(producer, now_ms + 30);
                return Tick::Requeue(now_ms + 30);
            }
        } else {
            inner.fallback = None;
            inner.flags.remove(SourceFlags::LISTENERS_SYNC);
        }
    }

    if inner.flags.contains(SourceFlags::TERMINATING) {
        drop(inner);
        return lifecycle::finish(engine, source, producer);
    }

    if !inner.flags.contains(SourceFlags::RUNNING) {
        lifecycle::shutdown(engine, source, &mut inner, true, now_ms);
        inner.producer_schedule_ms = now_ms + 30;
        set_schedule(producer, now_ms + 30);
        return Tick::Requeue(now_ms + 30);
    }

    // Publish listener-count changes.
    if inner.listener_count != inner.prev_listeners {
        inner.prev_listeners = inner.listener_count;
        if inner.listener_count > inner.peak_listeners {
            inner.peak_listeners = inner.listener_count;
            engine
                .stats
                .set(&source.mount, "listener_peak", inner.peak_listeners as u64);
        }
        engine
            .stats
            .set(&source.mount, "listeners", inner.listener_count as u64);
    }

    if now >= inner.client_stats_update_at {
        publish_stats(engine, &source.mount, &mut inner, now);
        inner.client_stats_update_at = now + inner.stats_interval;
    }

    if now >= inner.worker_balance_recheck_at {
        inner.worker_balance_recheck_at = now + (engine.source_count() as u64).max(6);
        match balance::source_change_worker(engine, source, inner, producer) {
            Ok(()) => return Tick::Moved,
            Err(guard) => inner = guard,
        }
    }

    // Poll the producer socket and pull at most two blocks.
    let mut processed = false;
    let mut queue_fault = false;
    {
        let mut c = producer.lock();
        if c.connection.readable() {
            inner.skip_ms = (inner.skip_ms * 9 / 10).max(10);
            let SourceInner {
                ref mut format,
                ref mut queue,
                ref mut dump_file,
                ref mut in_rate,
                ref mut last_read,
                ref mut bytes_read_total,
                ref mut total_queue_pos,
                ..
            } = *inner;
            if let Some(fmt) = format.as_mut() {
                for _ in 0..2 {
                    match fmt.get_buffer(&mut c) {
                        Some(block) => {
                            processed = true;
                            *last_read = now;
                            let len = block.len() as u64;
                            *bytes_read_total += len;
                            in_rate.add(now, len);
                            *total_queue_pos += len;
                            if let Some(file) = dump_file.as_mut() {
                                if let Err(e) = fmt.write_buf_to_file(file, &block) {
                                    log::warn!(
                                        "[Source] {} dump write failed: {e}, closing dump",
                                        source.mount
                                    );
                                    *dump_file = None;
                                }
                            }
                            if let Err(e) = queue.append(block) {
                                log::error!("[Source] {} queue fault: {e}", source.mount);
                                queue_fault = true;
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        } else if !c.connection.is_error() {
            if inner.last_read + 3 <= now {
                log::debug!("[Source] {} no data for a while", source.mount);
            }
            if inner.last_read + inner.timeout_secs < now {
                log::warn!("[Source] {} timed out waiting for data", source.mount);
                inner.flags.insert(SourceFlags::TIMEOUT);
                inner.flags.remove(SourceFlags::RUNNING);
            } else {
                inner.skip_ms = (inner.skip_ms * 13 / 10).min(400);
            }
        }
        if c.connection.is_error() {
            inner.flags.remove(SourceFlags::RUNNING);
        }
    }
    if queue_fault {
        // Queue invariants went bad; drop the source rather than the server.
        inner.flags.remove(SourceFlags::RUNNING);
    }

    inner.queue.trim();

    let next = if processed {
        now_ms + 15
    } else {
        now_ms + (inner.skip_ms | 0x0f)
    };
    inner.producer_schedule_ms = next;
    set_schedule(producer, next);
    Tick::Requeue(next)
}

fn set_schedule(h: &ClientHandle, due: u64) {
    h.lock().schedule_ms = due;
}

/// Refreshes the rolling rates and publishes the per-source counters.
fn publish_stats(engine: &Engine, mount: &str, inner: &mut SourceInner, now: u64) {
    inner.incoming_rate = inner.in_rate.average(now);
    let out_avg = inner.out_rate.average(now);
    engine
        .stats
        .set(mount, "incoming_bitrate", inner.incoming_rate * 8);
    engine
        .stats
        .set(mount, "outgoing_kbitrate", out_avg * 8 / 1024);
    engine
        .stats
        .set(mount, "total_bytes_read", inner.bytes_read_total);
    engine
        .stats
        .set(mount, "total_bytes_sent", inner.bytes_sent_total);
    engine
        .stats
        .set(mount, "queue_size", inner.queue.size() as u64);
    engine
        .stats
        .set(mount, "slow_listeners", inner.slow_listeners);
    if inner.incoming_rate > 0 {
        inner.listener_send_trigger = (inner.incoming_rate as usize / 4).clamp(1400, 65536);
    }
    inner.bytes_sent_since_update = 0;
}
