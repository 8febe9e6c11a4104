//! Cooperative worker loops.
//!
//! A fixed pool of worker threads; every client is owned by exactly one
//! worker at a time. Each worker runs a single-threaded loop over a min-heap
//! keyed on `schedule_ms`: pop due clients, run one tick, re-queue at the
//! time the tick asks for. Handlers never block - the only "sleep" is the
//! returned reschedule time.
//!
//! Ownership moves between workers by message: the sender bumps the target's
//! client count, flips the owner index, and posts the handle; the old
//! worker's now-stale heap entries skip on the owner check. Waking a client
//! early is the same mechanism - a duplicate heap entry due immediately.

pub mod balance;

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::client::{ClientHandle, ClientOp, NO_WORKER};
use crate::engine::Engine;
use crate::format::write_refbuf_to_client;
use crate::source;
use crate::utils::now_millis;

/// Longest a worker parks before re-checking its heap, in ms.
const MAX_PARK_MS: u64 = 200;

/// Outcome of one client tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Run again at this time (ms).
    Requeue(u64),
    /// The client moved to another worker; this one forgets it.
    Moved,
    /// The client is finished; drop it.
    Done,
}

enum WorkerMsg {
    Attach(ClientHandle),
    Wake(ClientHandle),
    Nudge,
    Shutdown,
}

/// One cooperative event loop.
pub struct Worker {
    pub index: usize,
    tx: Sender<WorkerMsg>,
    count: AtomicUsize,
    time_ms: AtomicU64,
}

impl Worker {
    /// Number of clients this worker owns.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// The loop's cached wall clock in milliseconds.
    pub fn time_ms(&self) -> u64 {
        self.time_ms.load(Ordering::Acquire)
    }

    /// Interrupts the park so the loop recomputes its schedule.
    pub fn wakeup(&self) {
        let _ = self.tx.send(WorkerMsg::Nudge);
    }

    /// Queues an immediate tick for a client this worker owns.
    pub fn wake_client(&self, h: ClientHandle) {
        let _ = self.tx.send(WorkerMsg::Wake(h));
    }

    /// Takes ownership of a client and schedules its first tick.
    pub fn attach(&self, h: ClientHandle) {
        h.set_owner(self.index);
        self.count.fetch_add(1, Ordering::AcqRel);
        let _ = self.tx.send(WorkerMsg::Attach(h));
    }
}

/// Moves a client to `target`.
///
/// Callers must have released the source lock. Returns true when the move
/// happened; the old worker discards its stale schedule entries on the
/// owner check.
pub fn client_change_worker(engine: &Engine, h: &ClientHandle, target: &Arc<Worker>) -> bool {
    let old_idx = h.owner();
    if old_idx == target.index {
        return false;
    }
    if old_idx != NO_WORKER {
        match engine.workers.get(old_idx) {
            Some(old) => {
                old.count.fetch_sub(1, Ordering::AcqRel);
            }
            None => return false,
        }
    }
    target.attach(h.clone());
    true
}

/// Fixed pool of workers behind a read-mostly lock.
pub struct WorkerPool {
    workers: RwLock<Vec<Arc<Worker>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `n` worker threads. Called once at engine start.
    pub fn start(&self, n: usize, engine: &Arc<Engine>) {
        let mut workers = self.workers.write();
        let mut threads = self.threads.lock();
        for _ in 0..n.max(1) {
            let index = workers.len();
            let (tx, rx) = unbounded();
            let worker = Arc::new(Worker {
                index,
                tx,
                count: AtomicUsize::new(0),
                time_ms: AtomicU64::new(now_millis()),
            });
            workers.push(Arc::clone(&worker));
            let engine = Arc::clone(engine);
            threads.push(std::thread::spawn(move || run_worker(worker, engine, rx)));
        }
        log::info!("[Worker] {} workers started", workers.len());
    }

    pub fn get(&self, index: usize) -> Option<Arc<Worker>> {
        self.workers.read().get(index).cloned()
    }

    /// The worker owning the fewest clients.
    pub fn least_busy(&self) -> Option<Arc<Worker>> {
        self.workers.read().iter().min_by_key(|w| w.count()).cloned()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes the worker at `index`, if any.
    pub fn wake(&self, index: usize) {
        if let Some(w) = self.get(index) {
            w.wakeup();
        }
    }

    /// Stops every worker loop and joins the threads.
    pub fn shutdown(&self) {
        for w in self.workers.read().iter() {
            let _ = w.tx.send(WorkerMsg::Shutdown);
        }
        for t in self.threads.lock().drain(..) {
            let _ = t.join();
        }
    }
}

/// Heap entry; ordered so the earliest due time pops first.
struct Scheduled {
    due: u64,
    seq: u64,
    handle: ClientHandle,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn run_worker(worker: Arc<Worker>, engine: Arc<Engine>, rx: Receiver<WorkerMsg>) {
    log::debug!("[Worker] {} loop running", worker.index);
    let mut heap: BinaryHeap<Scheduled> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        // Drain control messages without blocking.
        loop {
            match rx.try_recv() {
                Ok(WorkerMsg::Attach(h)) | Ok(WorkerMsg::Wake(h)) => {
                    seq += 1;
                    heap.push(Scheduled {
                        due: now_millis(),
                        seq,
                        handle: h,
                    });
                }
                Ok(WorkerMsg::Nudge) => {}
                Ok(WorkerMsg::Shutdown) | Err(TryRecvError::Disconnected) => {
                    log::debug!("[Worker] {} stopping", worker.index);
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let now = now_millis();
        worker.time_ms.store(now, Ordering::Release);

        while heap.peek().is_some_and(|e| e.due <= now) {
            let Some(entry) = heap.pop() else { break };
            if entry.handle.owner() != worker.index {
                // Moved away or already released; counts were settled then.
                continue;
            }
            match dispatch(&engine, &entry.handle, now) {
                Tick::Requeue(due) => {
                    seq += 1;
                    heap.push(Scheduled {
                        due,
                        seq,
                        handle: entry.handle,
                    });
                }
                Tick::Moved => {}
                Tick::Done => {
                    entry.handle.set_owner(NO_WORKER);
                    worker.count.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        let park = heap
            .peek()
            .map(|e| e.due.saturating_sub(now_millis()))
            .unwrap_or(MAX_PARK_MS)
            .clamp(1, MAX_PARK_MS);
        match rx.recv_timeout(Duration::from_millis(park)) {
            Ok(WorkerMsg::Attach(h)) | Ok(WorkerMsg::Wake(h)) => {
                seq += 1;
                heap.push(Scheduled {
                    due: now_millis(),
                    seq,
                    handle: h,
                });
            }
            Ok(WorkerMsg::Nudge) | Err(RecvTimeoutError::Timeout) => {}
            Ok(WorkerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                log::debug!("[Worker] {} stopping", worker.index);
                return;
            }
        }
    }
}

/// Runs one tick for a client, routed by its current op.
pub fn dispatch(engine: &Engine, h: &ClientHandle, now: u64) -> Tick {
    let (op, shared, schedule) = {
        let c = h.lock();
        (c.op, c.shared_data.clone(), c.schedule_ms)
    };
    if schedule > now {
        // A wake-up fired early (or a stale duplicate entry); honour the
        // client's own schedule unless something reset it.
        return Tick::Requeue(schedule);
    }
    match op {
        ClientOp::Producer => match shared {
            Some(src) => source::source_read(engine, &src, h),
            None => Tick::Done,
        },
        ClientOp::Listener => match shared {
            Some(src) => source::listener::send_listener(engine, &src, h),
            None => Tick::Done,
        },
        ClientOp::ProducerHttpSend => source::lifecycle::producer_http_send(engine, h, now),
        ClientOp::Drain => drain_tick(h, now),
        ClientOp::Release => Tick::Done,
    }
}

/// Flushes a pending response (typically a rejection), then closes.
fn drain_tick(h: &ClientHandle, now: u64) -> Tick {
    let mut c = h.lock();
    let n = write_refbuf_to_client(&mut c);
    if n < 0 || c.connection.is_error() {
        return Tick::Done;
    }
    match &c.refbuf {
        Some(rb) if c.pos < rb.len() => Tick::Requeue(now + 50),
        _ => Tick::Done,
    }
}
