//! Embercast core - the per-mountpoint streaming heart of an audio
//! broadcast server.
//!
//! One producer pushes an encoded stream into a named mount; the recent
//! stream is held as a refcounted block queue; many listeners fan out from
//! per-listener cursors with burst-on-connect, intro files, fallback
//! redirection, override, and producer hijack. Clients are pinned to
//! cooperative worker loops and migrate between them under a balancing
//! policy.
//!
//! # Architecture
//!
//! - [`queue`]: refcounted stream blocks and the per-source queue
//! - [`registry`]: process-wide mount name -> source map
//! - [`source`]: source state machine, producer tick, lifecycle, listeners
//! - [`admission`]: listener attach, fallback resolution, caps
//! - [`worker`]: cooperative worker pool and balancing
//! - [`engine`]: global state, counters, config snapshot
//! - [`format`]: codec seam ([`FormatAdapter`]) and the raw adapter
//! - [`net`], [`auth`], [`fserve`]: transport, auth, and file-serving seams
//!
//! The core does not parse HTTP and never blocks inside a tick; front ends
//! hand in parsed request heads and non-blocking sockets, and every handler
//! suspends only by returning a reschedule time.

#![warn(clippy::all)]

pub mod admission;
pub mod auth;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod fserve;
pub mod net;
pub mod queue;
pub mod rate;
pub mod registry;
pub mod source;
pub mod stats;
pub mod utils;
pub mod worker;

// Re-export commonly used types at the crate root
pub use admission::{add_listener, send_reject};
pub use auth::{AuthService, NoAuth};
pub use client::{CheckBuffer, Client, ClientFlags, ClientHandle, ClientOp, RequestHead};
pub use config::{Config, MountConfig};
pub use engine::Engine;
pub use error::{CastError, CastResult};
pub use format::{FormatAdapter, GenericFormat, StreamDetails};
pub use fserve::{FileServe, NoFileServe, WebrootFileServe};
pub use net::Socket;
pub use queue::{BlockFlags, RefBlock, SourceQueue};
pub use registry::{MountRegistry, MAX_FALLBACK_DEPTH};
pub use source::lifecycle::startup;
pub use source::{FallbackDescriptor, FallbackKind, Source, SourceFlags};
pub use stats::Stats;
pub use utils::{now_millis, now_secs};
pub use worker::{client_change_worker, Tick, Worker, WorkerPool};
