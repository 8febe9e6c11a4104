//! Listener fan-out state machine.
//!
//! Each listener tick runs under the source lock and dispatches on the
//! client's check-buffer state: response head, intro file, live queue,
//! paused, or waiting out a coordinated transition. The queue states hold
//! one logical reference on the block the cursor sits on; every transition
//! that abandons a block releases it.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::admission;
use crate::client::{CheckBuffer, Client, ClientHandle, ClientOp};
use crate::engine::Engine;
use crate::format::{write_refbuf_to_client, StreamDetails};
use crate::queue::{BlockFlags, RefBlock};
use crate::source::{Source, SourceFlags, SourceInner};
use crate::utils::now_millis;
use crate::worker::{balance, Tick};

/// Intro file read chunk.
const INTRO_CHUNK: usize = 4096;

/// How long a paused listener waits for its source to return, ms.
const PAUSE_DEADLINE_MS: u64 = 15_000;

/// Outcome of one check-buffer dispatch.
enum Run {
    /// Bytes moved (0 = state advanced without output).
    Wrote(usize),
    /// Cannot progress now; `schedule_ms` says when to retry.
    Blocked,
    /// The cursor fell off the queue tail.
    Slow,
    /// Unrecoverable; release the listener.
    Drop(&'static str),
}

/// Listener tick. Runs under the source lock; `Moved` means a worker
/// migration already released it.
pub fn send_listener(engine: &Engine, source: &Arc<Source>, h: &ClientHandle) -> Tick {
    let now_ms = now_millis();
    let now = now_ms / 1000;
    let mut inner = source.lock();
    let mut c = h.lock();

    // Parked states have their own clocks.
    match c.check_buffer {
        CheckBuffer::Pause => {
            if inner.flags.contains(SourceFlags::RUNNING) {
                log::debug!("[Listener] {} resuming on {}", h.id(), source.mount);
                c.check_buffer = resume_state(&c);
                c.drop_refbuf();
                c.timer_start = 0;
            } else if now_ms.saturating_sub(c.timer_start) > PAUSE_DEADLINE_MS {
                return release(engine, source, &mut inner, &mut c, h, "pause timeout");
            } else {
                c.schedule_ms = now_ms + 150;
                return Tick::Requeue(c.schedule_ms);
            }
        }
        CheckBuffer::Wait => {
            if inner.flags.contains(SourceFlags::LISTENERS_SYNC) {
                c.schedule_ms = now_ms + 150;
                return Tick::Requeue(c.schedule_ms);
            }
            c.check_buffer = resume_state(&c);
        }
        _ => {
            // A coordinated transition outranks normal sending.
            if inner.flags.contains(SourceFlags::LISTENERS_SYNC) {
                return listener_waiting_on_source(engine, source, inner, c, h, now_ms);
            }
        }
    }

    if c.connection.is_error() {
        return release(engine, source, &mut inner, &mut c, h, "socket error");
    }
    if c.connection.discon_time > 0 && now >= c.connection.discon_time {
        return release(engine, source, &mut inner, &mut c, h, "duration reached");
    }
    if !inner.flags.contains(SourceFlags::RUNNING) {
        if inner.flags.contains(SourceFlags::TERMINATING) {
            return release(engine, source, &mut inner, &mut c, h, "source ended");
        }
        c.schedule_ms = now_ms + 100;
        return Tick::Requeue(c.schedule_ms);
    }

    // Worker colocation, at most once per source stats tick.
    if c.balance_check != inner.client_stats_update_at {
        c.balance_check = inner.client_stats_update_at;
        let producer_elsewhere = inner
            .producer
            .as_ref()
            .is_some_and(|p| p.owner() != h.owner());
        if producer_elsewhere {
            drop(c);
            match balance::listener_change_worker(engine, source, inner, h) {
                Ok(()) => return Tick::Moved,
                Err(guard) => {
                    inner = guard;
                    c = h.lock();
                    if c.connection.is_error() {
                        return release(engine, source, &mut inner, &mut c, h, "socket error");
                    }
                }
            }
        }
    }

    // Per-tick write budget, shaped by lag and the global governor.
    let lag = inner.total_queue_pos.saturating_sub(c.queue_pos);
    let mut budget = inner.listener_send_trigger;
    if lag < inner.incoming_rate {
        budget = (budget / 2).max(1);
    }
    let mut loops = 12u32;
    let mut extra_ms = 0u64;
    match engine.throttle_level() {
        level if level > 2 => {
            c.schedule_ms = now_ms + 30;
            return Tick::Requeue(c.schedule_ms);
        }
        2 => {
            loops = 2;
            extra_ms = 50;
        }
        1 => {
            if lag > 2 * inner.incoming_rate.max(1) {
                extra_ms = 150;
            }
        }
        _ => {}
    }

    c.schedule_ms = now_ms + inner.wait_time;
    let mut total = 0usize;
    while loops > 0 && total < budget {
        loops -= 1;
        match check_buffer_tick(engine, source, &mut inner, &mut c, now_ms) {
            Run::Wrote(n) => total += n,
            Run::Blocked => break,
            Run::Slow => {
                return drop_slow(engine, source, &mut inner, &mut c, h);
            }
            Run::Drop(reason) => {
                return release(engine, source, &mut inner, &mut c, h, reason);
            }
        }
    }

    if total > 0 {
        inner.out_rate.add(now, total as u64);
        inner.bytes_sent_total += total as u64;
        inner.bytes_sent_since_update += total as u64;
        engine.add_out_bytes(now, total as u64);
        if loops == 0 || total >= budget {
            // Budget exhausted with data still pending.
            c.schedule_ms = now_ms + 15;
        }
    }

    // The trim loop may have swept past this cursor between writes.
    if c.check_buffer == CheckBuffer::QueueAdvance {
        if let Some(rb) = &c.refbuf {
            if rb.has_flag(BlockFlags::RELEASE_MARKER) {
                return drop_slow(engine, source, &mut inner, &mut c, h);
            }
        }
    }

    c.schedule_ms += extra_ms;
    Tick::Requeue(c.schedule_ms)
}

/// State to land in when leaving pause/wait: headers if none were sent,
/// otherwise back onto the queue.
fn resume_state(c: &Client) -> CheckBuffer {
    if c.respcode == 0 {
        CheckBuffer::HttpHeaders
    } else {
        CheckBuffer::QueueAdvance
    }
}

fn check_buffer_tick(
    engine: &Engine,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    c: &mut Client,
    now_ms: u64,
) -> Run {
    match c.check_buffer {
        CheckBuffer::HttpHeaders => tick_http_headers(source, inner, c, now_ms),
        CheckBuffer::Intro => tick_intro(inner, c),
        CheckBuffer::IntroFile => tick_intro_file(engine, inner, c, now_ms),
        CheckBuffer::QueueAdvance => tick_queue(source, inner, c, now_ms),
        // Parked states never reach the write loop.
        CheckBuffer::Pause | CheckBuffer::Wait => Run::Blocked,
    }
}

fn tick_http_headers(
    source: &Arc<Source>,
    inner: &mut SourceInner,
    c: &mut Client,
    now_ms: u64,
) -> Run {
    if c.refbuf.is_none() {
        if c.respcode != 0 {
            // Something upstream already answered this client.
            c.check_buffer = CheckBuffer::Intro;
            return Run::Wrote(0);
        }
        if inner.queue.is_empty() {
            // Postpone until data is on the queue.
            c.schedule_ms = now_ms + 500;
            return Run::Blocked;
        }
        let SourceInner {
            ref mut format,
            ref mount_config,
            ref audio_info,
            ..
        } = *inner;
        let Some(fmt) = format.as_mut() else {
            c.schedule_ms = now_ms + 500;
            return Run::Blocked;
        };
        let details = StreamDetails {
            mount: &source.mount,
            stream_name: mount_config.stream_name.as_deref(),
            stream_genre: mount_config.stream_genre.as_deref(),
            stream_url: mount_config.stream_url.as_deref(),
            stream_description: mount_config.stream_description.as_deref(),
            audio_info,
        };
        if fmt.create_client_data(&details, c) < 0 {
            return Run::Drop("no response for client");
        }
        c.respcode = 200;
        // Sentinel: the head is in flight; its bytes are excluded from the
        // intro accounting once it completes.
        c.intro_offset = -2;
    }

    let n = match inner.format.as_mut() {
        Some(fmt) => fmt.write_buf_to_client(c),
        None => write_refbuf_to_client(c),
    };
    if n < 0 {
        return Run::Blocked;
    }
    if let Some(rb) = c.refbuf.clone() {
        if c.pos >= rb.len() {
            if c.intro_offset == -2 {
                c.connection.sent_bytes = 0;
                c.intro_offset = -1;
            }
            match rb.next() {
                Some(next) => {
                    // Seeded intro chain; the successor's reference transfers.
                    if let Some(old) = c.refbuf.replace(next) {
                        RefBlock::release(old);
                    }
                    c.pos = 0;
                }
                None => {
                    c.drop_refbuf();
                    c.check_buffer = CheckBuffer::Intro;
                }
            }
        } else if n == 0 {
            c.schedule_ms = now_ms + 50;
            return Run::Blocked;
        }
    }
    Run::Wrote(n as usize)
}

fn tick_intro(inner: &mut SourceInner, c: &mut Client) -> Run {
    if c.connection.sent_bytes > 0 {
        // Seeded content already primed this listener.
        c.check_buffer = CheckBuffer::QueueAdvance;
        return Run::Wrote(0);
    }
    if inner.intro_filename.is_some() {
        c.intro_offset = 0;
        c.check_buffer = CheckBuffer::IntroFile;
    } else {
        c.check_buffer = CheckBuffer::QueueAdvance;
    }
    Run::Wrote(0)
}

fn tick_intro_file(engine: &Engine, inner: &mut SourceInner, c: &mut Client, now_ms: u64) -> Run {
    // Flush the block in flight before reading more.
    if let Some(rb) = c.refbuf.clone() {
        if c.pos < rb.len() {
            let n = match inner.format.as_mut() {
                Some(fmt) => fmt.write_buf_to_client(c),
                None => write_refbuf_to_client(c),
            };
            if n < 0 {
                return Run::Blocked;
            }
            if n == 0 {
                c.schedule_ms = now_ms + 50;
                return Run::Blocked;
            }
            return Run::Wrote(n as usize);
        }
        c.drop_refbuf();
    }

    let Some(name) = inner.intro_filename.clone() else {
        c.check_buffer = CheckBuffer::QueueAdvance;
        return Run::Wrote(0);
    };
    match engine
        .fserve
        .read_intro(&name, c.intro_offset.max(0) as u64, INTRO_CHUNK)
    {
        Ok(bytes) if bytes.is_empty() => {
            if inner.queue.is_empty() {
                // Loop the intro from the top until the stream is ready.
                c.intro_offset = 0;
                c.schedule_ms = now_ms + 100;
                Run::Blocked
            } else {
                c.check_buffer = CheckBuffer::QueueAdvance;
                Run::Wrote(0)
            }
        }
        Ok(bytes) => {
            c.intro_offset += bytes.len() as i64;
            c.refbuf = Some(RefBlock::new(bytes));
            c.pos = 0;
            Run::Wrote(0)
        }
        Err(e) => {
            log::warn!("[Listener] intro {name} unreadable: {e}");
            c.check_buffer = CheckBuffer::QueueAdvance;
            Run::Wrote(0)
        }
    }
}

fn tick_queue(source: &Arc<Source>, inner: &mut SourceInner, c: &mut Client, now_ms: u64) -> Run {
    if c.refbuf.is_none() && !locate_start_on_queue(&source.mount, inner, c) {
        c.schedule_ms = now_ms + 150;
        return Run::Blocked;
    }
    let Some(rb) = c.refbuf.clone() else {
        return Run::Blocked;
    };
    if rb.has_flag(BlockFlags::RELEASE_MARKER) {
        return Run::Slow;
    }
    if c.pos >= rb.len() {
        match rb.next() {
            Some(next) => {
                if let Some(old) = c.refbuf.replace(next.addref()) {
                    RefBlock::release(old);
                }
                c.pos = 0;
                return Run::Wrote(0);
            }
            None => {
                // Caught up; ride just behind the producer's next tick.
                let due = inner.producer_schedule_ms + 5;
                c.schedule_ms = if due > now_ms {
                    due
                } else {
                    now_ms + inner.wait_time
                };
                return Run::Blocked;
            }
        }
    }
    let n = match inner.format.as_mut() {
        Some(fmt) => fmt.write_buf_to_client(c),
        None => write_refbuf_to_client(c),
    };
    if n < 0 {
        return Run::Blocked;
    }
    if n == 0 {
        c.schedule_ms = now_ms + 50;
        return Run::Blocked;
    }
    c.queue_pos += n as u64;
    Run::Wrote(n as usize)
}

/// Chooses the sync-aligned block a joining listener starts from.
///
/// Honours a requested burst (`?burst=` wins over the `initial-burst:`
/// header, then the mount default), reduced by whatever the client was
/// already sent, then walks forward to the first sync point.
fn locate_start_on_queue(mount: &str, inner: &SourceInner, c: &mut Client) -> bool {
    let q = &inner.queue;
    let Some(tail) = q.tail() else { return false };
    let sent = c.connection.sent_bytes as usize;

    let (start, lag) = if sent > q.min_offset() && tail.has_flag(BlockFlags::SYNC) {
        // Enough preroll went out already; join at the live edge.
        let len = tail.len();
        (tail, len)
    } else {
        let want = c
            .parser
            .query_param("burst")
            .and_then(|v| v.parse::<usize>().ok())
            .or_else(|| {
                c.parser
                    .header("initial-burst")
                    .and_then(|v| v.parse::<usize>().ok())
            })
            .unwrap_or_else(|| q.burst_size())
            .saturating_sub(sent);
        let Some(mut block) = q.min_cursor() else {
            return false;
        };
        let mut remaining = q.min_offset();
        while remaining > want {
            let Some(next) = block.next() else { break };
            remaining -= block.len();
            block = next;
        }
        while !block.has_flag(BlockFlags::SYNC) {
            let Some(next) = block.next() else {
                return false;
            };
            remaining = remaining.saturating_sub(block.len());
            block = next;
        }
        (block, remaining)
    };

    c.drop_refbuf();
    c.refbuf = Some(start.addref());
    c.pos = 0;
    if lag as u64 > inner.total_queue_pos {
        log::warn!("[Listener] negative lag joining {mount}, clamping to live edge");
        c.queue_pos = 0;
    } else {
        c.queue_pos = inner.total_queue_pos - lag as u64;
    }
    c.intro_offset = -1;
    true
}

/// Acknowledges a coordinated transition: move to the fallback, park, or go.
fn listener_waiting_on_source(
    engine: &Engine,
    source: &Arc<Source>,
    mut inner: MutexGuard<'_, SourceInner>,
    mut c: MutexGuard<'_, Client>,
    h: &ClientHandle,
    now_ms: u64,
) -> Tick {
    inner.termination_count = inner.termination_count.saturating_sub(1);

    if c.connection.is_error() {
        return release(engine, source, &mut inner, &mut c, h, "socket error");
    }

    if let Some(fb) = inner.fallback.clone() {
        listener_detach(&mut inner, &mut c, h.id());
        drop(c);
        drop(inner);
        if admission::move_listener(engine, h, &fb) {
            return Tick::Requeue(now_ms);
        }
        // Move failed; rejoin and take whatever the terminating path gives.
        let mut inner = source.lock();
        let mut c = h.lock();
        inner.listeners.insert(h.id(), h.clone());
        inner.listener_count += 1;
        c.shared_data = Some(Arc::clone(source));
        c.check_buffer = CheckBuffer::Wait;
        c.schedule_ms = now_ms + 100;
        return Tick::Requeue(c.schedule_ms);
    }

    if inner.flags.contains(SourceFlags::TERMINATING)
        && inner.flags.contains(SourceFlags::PAUSE_LISTENERS)
        && engine.running()
    {
        c.check_buffer = CheckBuffer::Pause;
        c.timer_start = now_ms;
        c.drop_refbuf();
        c.schedule_ms = now_ms + 60;
        return Tick::Requeue(c.schedule_ms);
    }

    if !inner.flags.contains(SourceFlags::TERMINATING) {
        // Transition with nowhere to send us; wait for it to settle.
        c.check_buffer = CheckBuffer::Wait;
        c.schedule_ms = now_ms + 150;
        return Tick::Requeue(c.schedule_ms);
    }

    release(engine, source, &mut inner, &mut c, h, "source ended")
}

/// Unlinks a listener from the source's set.
///
/// A partially-written queue block is copied out so remaining writes finish
/// without retaining the shared block.
pub(crate) fn listener_detach(inner: &mut SourceInner, c: &mut Client, client_id: u64) {
    if c.check_buffer == CheckBuffer::QueueAdvance {
        if let Some(rb) = c.refbuf.take() {
            if rb.has_flag(BlockFlags::QUEUE_BLOCK) {
                if c.pos < rb.len() {
                    c.refbuf = Some(RefBlock::new(rb.data().slice(c.pos..)));
                    c.pos = 0;
                } else {
                    c.pos = 0;
                }
                RefBlock::release(rb);
            } else {
                c.refbuf = Some(rb);
            }
        }
    }
    if inner.listeners.remove(&client_id).is_some() {
        inner.listener_count -= 1;
    }
}

fn drop_slow(
    engine: &Engine,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    c: &mut Client,
    h: &ClientHandle,
) -> Tick {
    inner.slow_listeners += 1;
    engine
        .stats
        .set(&source.mount, "slow_listeners", inner.slow_listeners);
    release(engine, source, inner, c, h, "too far behind")
}

/// Detaches, accounts, and hands the client back to its worker for teardown.
pub(crate) fn release(
    engine: &Engine,
    source: &Arc<Source>,
    inner: &mut SourceInner,
    c: &mut Client,
    h: &ClientHandle,
    reason: &str,
) -> Tick {
    log::info!(
        "[Listener] {} leaving {} ({reason}), {} bytes sent",
        h.id(),
        source.mount,
        c.connection.sent_bytes
    );
    listener_detach(inner, c, h.id());
    c.drop_refbuf();
    c.shared_data = None;
    c.op = ClientOp::Release;
    if inner.listener_count == 0 {
        inner.out_rate.reduce(75);
    }
    engine.auth.release_listener(&source.mount, h.id());
    engine.listener_disconnected();
    Tick::Done
}
