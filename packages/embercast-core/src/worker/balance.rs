//! Worker balancing policy.
//!
//! Two movements: a source's producer drifts to the least-busy worker when
//! the gap is worth the handoff, and listeners drift toward their source's
//! worker for locality - but only while the source's worker is not already
//! piled up. Both release the source lock before moving; callers check the
//! result to know whether they still hold it.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::client::ClientHandle;
use crate::engine::Engine;
use crate::source::{Source, SourceInner};
use crate::worker::client_change_worker;

/// Moves the producer to the least-busy worker when that worker owns at
/// least `listeners + 10` fewer clients than the current one.
///
/// On `Ok` the move happened and the source lock is gone; on `Err` the
/// caller gets the lock back.
pub(crate) fn source_change_worker<'a>(
    engine: &Engine,
    source: &'a Arc<Source>,
    guard: MutexGuard<'a, SourceInner>,
    producer: &ClientHandle,
) -> Result<(), MutexGuard<'a, SourceInner>> {
    let listeners = guard.listener_count;
    let current_idx = producer.owner();
    let (best, current) = match (engine.workers.least_busy(), engine.workers.get(current_idx)) {
        (Some(b), Some(c)) => (b, c),
        _ => return Err(guard),
    };
    if best.index == current_idx {
        return Err(guard);
    }
    if current.count() < best.count() + listeners + 10 {
        return Err(guard);
    }
    drop(guard);
    if client_change_worker(engine, producer, &best) {
        log::debug!(
            "[Worker] source {} moved to worker {} ({} listeners)",
            source.mount,
            best.index,
            listeners
        );
        Ok(())
    } else {
        Err(source.lock())
    }
}

/// Migrates a listener onto its source's worker for locality.
///
/// Skipped when the source's worker is already `max(listeners + 10, 1000)`
/// clients ahead of the listener's - colocating then would only pile up.
pub(crate) fn listener_change_worker<'a>(
    engine: &Engine,
    source: &'a Arc<Source>,
    guard: MutexGuard<'a, SourceInner>,
    listener: &ClientHandle,
) -> Result<(), MutexGuard<'a, SourceInner>> {
    let listeners = guard.listener_count;
    let src_idx = match guard.producer.as_ref() {
        Some(p) => p.owner(),
        None => return Err(guard),
    };
    let my_idx = listener.owner();
    if src_idx == my_idx {
        return Err(guard);
    }
    let (src_worker, my_worker) = match (engine.workers.get(src_idx), engine.workers.get(my_idx)) {
        (Some(s), Some(m)) => (s, m),
        _ => return Err(guard),
    };
    let diff = src_worker.count() as i64 - my_worker.count() as i64;
    let trigger = (listeners as i64 + 10).max(1000);
    if diff >= trigger {
        return Err(guard);
    }
    drop(guard);
    if client_change_worker(engine, listener, &src_worker) {
        Ok(())
    } else {
        Err(source.lock())
    }
}
