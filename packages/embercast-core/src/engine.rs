//! The engine: registry, worker pool, stats, config snapshot, and the
//! global counters shared by every mount.
//!
//! Tick code reaches everything through a borrowed `Engine`; nothing in the
//! core holds it across ticks. The config snapshot is reference-counted so
//! a reload swaps atomically and takes effect at the next tick boundary.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::auth::{AuthService, NoAuth};
use crate::client::{Client, ClientHandle, Connection, RequestHead};
use crate::config::Config;
use crate::fserve::{FileServe, WebrootFileServe};
use crate::net::Socket;
use crate::rate::Rate;
use crate::registry::MountRegistry;
use crate::stats::Stats;
use crate::worker::WorkerPool;

/// Window (seconds) of the server-wide outgoing rate meter.
const GLOBAL_OUT_WINDOW: u64 = 60;

/// Server-wide state and services.
pub struct Engine {
    config: RwLock<Arc<Config>>,
    pub registry: MountRegistry,
    pub workers: WorkerPool,
    pub stats: Stats,
    pub auth: Arc<dyn AuthService>,
    pub fserve: Arc<dyn FileServe>,

    running: AtomicBool,
    /// Active source count, guarded so check-and-increment is atomic.
    sources: Mutex<usize>,
    listeners: AtomicUsize,
    out_rate: Mutex<Rate>,
    /// Send governor level; raised by an operator or overload detection.
    throttle: AtomicU8,
    next_client_id: AtomicU64,
}

impl Engine {
    /// Builds an engine with default services (no auth, webroot files).
    pub fn new(config: Config) -> Arc<Self> {
        let fserve = Arc::new(WebrootFileServe::new(config.webroot_dir.clone()));
        Self::with_services(config, Arc::new(NoAuth), fserve)
    }

    /// Builds an engine with caller-provided auth and file serving.
    pub fn with_services(
        config: Config,
        auth: Arc<dyn AuthService>,
        fserve: Arc<dyn FileServe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            registry: MountRegistry::new(),
            workers: WorkerPool::new(),
            stats: Stats::new(),
            auth,
            fserve,
            running: AtomicBool::new(true),
            sources: Mutex::new(0),
            listeners: AtomicUsize::new(0),
            out_rate: Mutex::new(Rate::new(GLOBAL_OUT_WINDOW)),
            throttle: AtomicU8::new(0),
            next_client_id: AtomicU64::new(1),
        })
    }

    /// Spawns the cooperative worker pool.
    pub fn start_workers(self: &Arc<Self>, count: usize) {
        self.workers.start(count, self);
    }

    /// Current config snapshot; hold it for one tick at most.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Swaps in a new config; live sources keep their seeded limits.
    pub fn apply_config(&self, config: Config) {
        *self.config.write() = Arc::new(config);
        log::info!("[Engine] configuration applied");
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Begins global shutdown; sources observe it on their next tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        log::info!("[Engine] stopping");
    }

    /// Stops and joins the worker pool. Call after [`Engine::stop`] once
    /// sources have had a tick to wind down.
    pub fn shutdown_workers(&self) {
        self.workers.shutdown();
    }

    // ─── Send governor ───────────────────────────────────────────────────

    pub fn throttle_level(&self) -> u8 {
        self.throttle.load(Ordering::Relaxed)
    }

    pub fn set_throttle_level(&self, level: u8) {
        self.throttle.store(level, Ordering::Relaxed);
    }

    // ─── Global counters ─────────────────────────────────────────────────

    /// Claims a source slot; false when the server is at `limit`.
    pub fn try_add_source(&self, limit: usize) -> bool {
        let mut n = self.sources.lock();
        if *n >= limit {
            return false;
        }
        *n += 1;
        self.stats.set_global("sources", *n as u64);
        true
    }

    pub fn source_slot_released(&self) {
        let mut n = self.sources.lock();
        *n = n.saturating_sub(1);
        self.stats.set_global("sources", *n as u64);
    }

    pub fn source_count(&self) -> usize {
        *self.sources.lock()
    }

    pub fn listener_connected(&self) {
        let n = self.listeners.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.set_global("listeners", n as u64);
    }

    pub fn listener_disconnected(&self) {
        let n = self.listeners.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.stats.set_global("listeners", n as u64);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::Acquire)
    }

    /// Accounts bytes sent to any listener, for the bandwidth governor.
    pub fn add_out_bytes(&self, now: u64, bytes: u64) {
        self.out_rate.lock().add(now, bytes);
    }

    /// Server-wide outgoing rate in bits/sec.
    pub fn out_bitrate(&self, now: u64) -> u64 {
        self.out_rate.lock().average(now) * 8
    }

    // ─── Client construction ─────────────────────────────────────────────

    /// Wraps an accepted connection in a client handle.
    pub fn new_client(
        &self,
        socket: Box<dyn Socket>,
        ip: IpAddr,
        head: RequestHead,
    ) -> ClientHandle {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        ClientHandle::new(Client::new(Connection::new(id, ip, socket), head))
    }
}
