mod correlate;
mod daemon;
mod filter;
mod launch;
mod layout;
mod monitors;
mod sway;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use swayproj_types::{client, default_config_dir, default_socket_path, Request, METHOD_PING};

use crate::daemon::{Daemon, LoopEvent, Store};
use crate::sway::SwayClient;

#[derive(Debug, Parser)]
#[command(name = "swayprojd", version, about = "Project and monitor daemon for sway")]
struct Args {
    /// Daemon IPC socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Directory holding projects, profiles, layouts, and the class registry.
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Compositor IPC socket (defaults to $SWAYSOCK).
    #[arg(long)]
    sway_socket: Option<String>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let socket_path = args
        .socket
        .or_else(|| std::env::var_os("SWAYPROJD_SOCKET").map(PathBuf::from))
        .unwrap_or_else(default_socket_path);
    let config_dir = args
        .config_dir
        .or_else(|| std::env::var_os("SWAYPROJD_CONFIG_DIR").map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let sway_socket = match args
        .sway_socket
        .or_else(|| std::env::var("SWAYPROJD_SWAY_SOCKET").ok())
        .or_else(|| std::env::var("SWAYSOCK").ok())
    {
        Some(socket) => socket,
        None => bail!("cannot locate compositor socket: set SWAYSOCK or pass --sway-socket"),
    };

    fs::create_dir_all(&config_dir)
        .with_context(|| format!("failed to create config dir: {}", config_dir.display()))?;
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory: {}", parent.display()))?;
    }

    let listener = bind_daemon_socket(&socket_path)?;
    listener
        .set_nonblocking(true)
        .context("failed to set listener as non-blocking")?;

    let running = Arc::new(AtomicBool::new(true));
    install_signal_handler(running.clone());

    let (sender, receiver) = mpsc::channel::<LoopEvent>();
    let _event_reader =
        sway::spawn_event_reader(sway_socket.clone(), running.clone(), sender.clone());

    let mut daemon = Daemon::new(Store::new(config_dir), SwayClient::new(sway_socket))?;
    info!("swayprojd listening on {}", socket_path.display());

    let mut next_client_id: u64 = 1;
    while running.load(Ordering::SeqCst) {
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    let client = next_client_id;
                    next_client_id += 1;
                    match stream.try_clone() {
                        Ok(reader_stream) => {
                            daemon.register_client(client, stream);
                            spawn_client_reader(client, reader_stream, sender.clone());
                        }
                        Err(err) => warn!("failed to clone client stream: {err}"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept error: {err}");
                    break;
                }
            }
        }

        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                daemon.handle_event(event);
                while let Ok(event) = receiver.try_recv() {
                    daemon.handle_event(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        daemon.tick(Instant::now());
        if daemon.should_shutdown() {
            running.store(false, Ordering::SeqCst);
        }
    }

    daemon.shutdown_cleanup();
    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }
    info!("swayprojd shutdown complete");
    Ok(())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("SWAYPROJD_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .try_init();
}

fn install_signal_handler(running: Arc<AtomicBool>) {
    static SIGNAL_FLAG: AtomicBool = AtomicBool::new(true);

    extern "C" fn handler(_sig: libc::c_int) {
        SIGNAL_FLAG.store(false, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
    }

    // The C handler can only flip the static flag; a polling thread
    // propagates it to the shared running flag.
    thread::spawn(move || {
        while SIGNAL_FLAG.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
        }
        info!("received signal, initiating graceful shutdown");
        running.store(false, Ordering::SeqCst);
    });
}

/// Bind the IPC socket, taking over a stale socket file when no live daemon
/// answers a ping on it.
fn bind_daemon_socket(socket_path: &Path) -> Result<UnixListener> {
    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            if daemon_is_reachable(socket_path) {
                bail!(
                    "failed to bind socket: {} (another swayprojd instance is already running)",
                    socket_path.display()
                );
            }
            if socket_path.exists() {
                fs::remove_file(socket_path).with_context(|| {
                    format!("failed to remove stale socket: {}", socket_path.display())
                })?;
            }
            UnixListener::bind(socket_path)
                .with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind socket: {}", socket_path.display()))
        }
    }
}

fn daemon_is_reachable(socket_path: &Path) -> bool {
    client::request(socket_path, METHOD_PING, Value::Null)
        .map(|response| response.is_ok())
        .unwrap_or(false)
}

/// Per-client reader thread: parses request lines and forwards them to the
/// main loop; parse failures and EOF become loop events too, so all client
/// state stays on the loop thread.
fn spawn_client_reader(client: u64, stream: UnixStream, sender: Sender<LoopEvent>) {
    let spawned = thread::Builder::new()
        .name(format!("ipc-client-{client}"))
        .spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let event = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => LoopEvent::Request { client, request },
                    Err(_) => LoopEvent::Malformed { client },
                };
                if sender.send(event).is_err() {
                    return;
                }
            }
            let _ = sender.send(LoopEvent::ClientClosed(client));
        });
    if let Err(err) = spawned {
        warn!("failed to spawn client reader thread: {err}");
    }
}
