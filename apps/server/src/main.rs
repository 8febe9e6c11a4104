//! Embercast server - standalone broadcast daemon.
//!
//! Wires the streaming core to a plain TCP acceptor: producers PUT (or
//! SOURCE) onto a mount, listeners GET it. Everything stream-shaped happens
//! inside `embercast-core`; this binary only accepts sockets, reads request
//! heads, and routes.

mod config;
mod http;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use embercast_core::{add_listener, send_reject, startup, Engine};

use crate::config::ServerConfig;

/// Embercast - Icecast-style audio broadcast server.
#[derive(Parser, Debug)]
#[command(name = "embercast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "EMBERCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "EMBERCAST_BIND_PORT")]
    port: Option<u16>,

    /// Worker thread count (overrides config file).
    #[arg(short = 'w', long, env = "EMBERCAST_WORKERS")]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Embercast Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.core.port = port;
    }
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }

    let engine = Engine::new(config.core.clone());
    engine.start_workers(config.workers);

    let bind = format!("{}:{}", config.bind_address, config.core.port);
    let listener = TcpListener::bind(&bind).with_context(|| format!("binding {bind}"))?;
    listener.set_nonblocking(true)?;
    log::info!("Listening on {bind}");

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        let engine = Arc::clone(&engine);
        ctrlc::set_handler(move || {
            log::info!("Shutdown requested");
            engine.stop();
            stop.store(true, Ordering::Release);
        })
        .context("installing signal handler")?;
    }

    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || handle_connection(engine, stream, addr));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::warn!("[Server] accept failed: {e}");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }

    // Sources notice the stop flag on their next tick; give them one.
    std::thread::sleep(Duration::from_millis(300));
    engine.shutdown_workers();
    log::info!("Bye");
    Ok(())
}

/// Reads the head and routes the connection into the core.
fn handle_connection(engine: Arc<Engine>, mut stream: TcpStream, addr: SocketAddr) {
    let (head, leftover) = match http::read_head(&mut stream) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::debug!("[Server] dropping {addr}: {e}");
            return;
        }
    };
    let method = head.method.clone();
    let mount = head.uri.clone();
    let socket = match http::TcpSocket::new(stream, leftover) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("[Server] socket setup failed for {addr}: {e}");
            return;
        }
    };
    let client = engine.new_client(Box::new(socket), addr.ip(), head);

    match method.as_str() {
        "PUT" | "SOURCE" => {
            log::info!("[Server] producer {addr} -> {mount}");
            if let Err(e) = startup(&engine, &client, &mount, false) {
                log::info!("[Server] producer rejected on {mount}: {e}");
                send_reject(&engine, &client, &e);
            }
        }
        "GET" => {
            log::debug!("[Server] listener {addr} -> {mount}");
            if let Err(e) = add_listener(&engine, &mount, &client) {
                log::info!("[Server] listener rejected on {mount}: {e}");
                send_reject(&engine, &client, &e);
            }
        }
        other => {
            log::debug!("[Server] {addr} used unsupported method {other}");
        }
    }
}
