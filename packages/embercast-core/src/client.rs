//! Client state shared by producers and listeners.
//!
//! A [`Client`] is one accepted connection: the socket, the parsed request
//! head, and the cursor/state fields the tick handlers mutate. Handlers run
//! on whichever worker currently owns the client; everything mutable lives
//! behind the handle's mutex, with the owning-worker index kept in an atomic
//! so workers can discard stale schedule entries without locking.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::net::{is_soft_error, Socket};
use crate::queue::RefBlock;
use crate::source::Source;
use crate::utils::now_secs;

/// Owner index meaning "not attached to any worker yet".
pub const NO_WORKER: usize = usize::MAX;

bitflags! {
    /// Per-client flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        /// Connection fully established; ticks may produce output.
        const ACTIVE = 0x0001;
        /// Passed authentication.
        const AUTHENTICATED = 0x0002;
        /// Producer allowed to take over a running mount.
        const HIJACKER = 0x0004;
        /// Response buffer carries seeded intro blocks chained via `next`.
        const HAS_INTRO_CONTENT = 0x0008;
        /// Listener has been moved to another mount at least once.
        const HAS_MOVED = 0x0010;
        /// Relay slave connection; exempt from admission caps.
        const IS_SLAVE = 0x0020;
        /// Handed off to the static file server.
        const IN_FSERVE = 0x0040;
    }
}

/// Parsed request head handed in by the front end.
///
/// The core does not parse HTTP; the acceptor fills this in. Header names
/// are stored lowercased.
#[derive(Debug, Default, Clone)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    /// Authenticated username, when the auth layer established one.
    pub username: Option<String>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }
}

/// Transport-level connection state.
pub struct Connection {
    pub id: u64,
    pub ip: IpAddr,
    socket: Box<dyn Socket>,
    pub sent_bytes: u64,
    /// Unix seconds the connection was accepted.
    pub con_time: u64,
    /// Unix seconds after which the connection is force-closed (0 = never).
    pub discon_time: u64,
    error: bool,
}

impl Connection {
    pub fn new(id: u64, ip: IpAddr, socket: Box<dyn Socket>) -> Self {
        Self {
            id,
            ip,
            socket,
            sent_bytes: 0,
            con_time: now_secs(),
            discon_time: 0,
            error: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn set_error(&mut self) {
        self.error = true;
    }

    /// Zero-timeout readability poll; hard errors mark the connection.
    pub fn readable(&mut self) -> bool {
        match self.socket.readable() {
            Ok(ready) => ready,
            Err(_) => {
                self.error = true;
                false
            }
        }
    }

    /// Non-blocking read. Returns bytes read; 0 can mean "no data yet".
    /// Peer close and hard errors mark the connection.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        match self.socket.read(buf) {
            Ok(0) => {
                self.error = true;
                0
            }
            Ok(n) => n,
            Err(e) if is_soft_error(&e) => 0,
            Err(_) => {
                self.error = true;
                0
            }
        }
    }

    /// Non-blocking write. Returns bytes accepted (possibly 0), or -1 on a
    /// hard error, which also marks the connection.
    pub fn send(&mut self, buf: &[u8]) -> i32 {
        if buf.is_empty() {
            return 0;
        }
        match self.socket.write(buf) {
            Ok(n) => {
                self.sent_bytes += n as u64;
                n as i32
            }
            Err(e) if is_soft_error(&e) => 0,
            Err(_) => {
                self.error = true;
                -1
            }
        }
    }
}

/// Which tick body runs for this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOp {
    /// Listener fan-out tick.
    Listener,
    /// Producer still flushing its `200 OK` preamble.
    ProducerHttpSend,
    /// Producer pull loop.
    Producer,
    /// Flush the pending refbuf (a rejection response), then close.
    Drain,
    /// Final teardown on the owning worker.
    Release,
}

/// Listener fan-out states, dispatched from the listener tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckBuffer {
    /// Send the HTTP response head (and any seeded intro chain).
    HttpHeaders,
    /// Decide between intro file and live queue.
    Intro,
    /// Replaying the configured intro file.
    IntroFile,
    /// Following the live queue cursor.
    QueueAdvance,
    /// Source paused; waiting for it to return or time out.
    Pause,
    /// Acknowledged a coordinated transition; waiting for the rest.
    Wait,
}

/// Mutable per-client state. Lives behind [`ClientHandle`]'s mutex.
pub struct Client {
    pub connection: Connection,
    pub parser: RequestHead,
    /// The source this client is attached to, when any.
    pub shared_data: Option<Arc<Source>>,
    /// Current buffer being written: a queue block, a response head, or a
    /// private copy made at detach.
    pub refbuf: Option<Arc<RefBlock>>,
    /// Write offset into `refbuf`.
    pub pos: usize,
    /// Monotonic bytes matched against the source timeline.
    pub queue_pos: u64,
    /// Read offset into the intro file; -1 once on the live queue.
    pub intro_offset: i64,
    /// HTTP status already produced for this client (0 = none yet).
    pub respcode: u16,
    pub check_buffer: CheckBuffer,
    pub op: ClientOp,
    /// Earliest time (ms) the owning worker should tick this client again.
    pub schedule_ms: u64,
    /// Millisecond timestamp marking the state the client is waiting in.
    pub timer_start: u64,
    /// Source stats boundary this listener last ran a worker-affinity check.
    pub balance_check: u64,
    pub flags: ClientFlags,
}

impl Client {
    pub fn new(connection: Connection, parser: RequestHead) -> Self {
        Self {
            connection,
            parser,
            shared_data: None,
            refbuf: None,
            pos: 0,
            queue_pos: 0,
            intro_offset: -1,
            respcode: 0,
            check_buffer: CheckBuffer::HttpHeaders,
            op: ClientOp::Listener,
            schedule_ms: 0,
            timer_start: 0,
            balance_check: 0,
            flags: ClientFlags::empty(),
        }
    }

    /// Drops the current refbuf, releasing its logical reference when it is
    /// a queue block the client held a cursor on.
    pub fn drop_refbuf(&mut self) {
        if let Some(rb) = self.refbuf.take() {
            RefBlock::release(rb);
        }
        self.pos = 0;
    }
}

struct ClientShared {
    id: u64,
    ip: IpAddr,
    owner: AtomicUsize,
    state: Mutex<Client>,
}

/// Shared, cloneable handle to one client.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<ClientShared>,
}

impl ClientHandle {
    pub fn new(client: Client) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                id: client.connection.id,
                ip: client.connection.ip,
                owner: AtomicUsize::new(NO_WORKER),
                state: Mutex::new(client),
            }),
        }
    }

    /// Stable connection id, readable without locking.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn ip(&self) -> IpAddr {
        self.shared.ip
    }

    /// Index of the worker that owns this client.
    pub fn owner(&self) -> usize {
        self.shared.owner.load(Ordering::Acquire)
    }

    pub fn set_owner(&self, worker: usize) {
        self.shared.owner.store(worker, Ordering::Release);
    }

    pub fn lock(&self) -> MutexGuard<'_, Client> {
        self.shared.state.lock()
    }

    pub fn same_client(&self, other: &ClientHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.shared.id)
            .field("ip", &self.shared.ip)
            .field("owner", &self.owner())
            .finish()
    }
}

/// Placeholder address for clients created without transport details.
pub fn unspecified_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
