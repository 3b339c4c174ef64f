//! Sway compositor client: i3 IPC binary framing with JSON payloads.
//!
//! One persistent request/response connection (lazily connected, retried once
//! with a short backoff) plus one subscription connection owned by a reader
//! thread that normalizes raw events into [`CompositorEvent`] values.
//!
//! Reference: sway-ipc(7).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::daemon::LoopEvent;

const IPC_MAGIC: &[u8; 6] = b"i3-ipc";
const IPC_HEADER_SIZE: usize = 14; // 6 (magic) + 4 (length) + 4 (type)

pub const IPC_RUN_COMMAND: u32 = 0;
pub const IPC_GET_WORKSPACES: u32 = 1;
pub const IPC_SUBSCRIBE: u32 = 2;
pub const IPC_GET_OUTPUTS: u32 = 3;
pub const IPC_GET_TREE: u32 = 4;

const IPC_EVENT_BIT: u32 = 1 << 31;
pub const IPC_EVENT_WORKSPACE: u32 = IPC_EVENT_BIT;
pub const IPC_EVENT_OUTPUT: u32 = IPC_EVENT_BIT | 1;
pub const IPC_EVENT_WINDOW: u32 = IPC_EVENT_BIT | 3;

const SUBSCRIBE_PAYLOAD: &[u8] = b"[\"window\", \"workspace\", \"output\"]";

const RECONNECT_INITIAL_MS: u64 = 500;
const RECONNECT_MAX_MS: u64 = 30_000;
const RECONNECT_MULTIPLIER: f64 = 1.5;

/// One retry after this backoff before a request counts as failed.
const REQUEST_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reject payloads larger than this to guard against bogus length fields.
const MAX_IPC_PAYLOAD: usize = 64 * 1024 * 1024;

pub fn ipc_send<W: Write>(writer: &mut W, msg_type: u32, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len() as u32;
    let mut header = [0u8; IPC_HEADER_SIZE];
    header[..6].copy_from_slice(IPC_MAGIC);
    header[6..10].copy_from_slice(&len.to_le_bytes());
    header[10..14].copy_from_slice(&msg_type.to_le_bytes());
    writer.write_all(&header)?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    writer.flush()
}

/// Read one framed message; returns (message type, payload bytes).
pub fn ipc_recv<R: Read>(reader: &mut R) -> std::io::Result<(u32, Vec<u8>)> {
    let mut header = [0u8; IPC_HEADER_SIZE];
    reader.read_exact(&mut header)?;

    if &header[..6] != IPC_MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid i3-ipc magic",
        ));
    }

    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
    let msg_type = u32::from_le_bytes([header[10], header[11], header[12], header[13]]);

    if len > MAX_IPC_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC payload too large: {len} bytes"),
        ));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload)?;
    }

    Ok((msg_type, payload))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Rect {
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WindowProperties {
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub instance: Option<String>,
}

/// One container in the compositor tree. Covers the fields this daemon needs;
/// everything else in the payload is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub num: Option<i32>,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub window_properties: Option<WindowProperties>,
    #[serde(default)]
    pub rect: Rect,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub floating_nodes: Vec<Node>,
}

impl Node {
    /// Application class: native `app_id`, falling back to the XWayland
    /// `window_properties.class`.
    pub fn window_class(&self) -> Option<&str> {
        if let Some(app_id) = self.app_id.as_deref() {
            if !app_id.is_empty() {
                return Some(app_id);
            }
        }
        self.window_properties
            .as_ref()
            .and_then(|props| props.class.as_deref())
            .filter(|class| !class.is_empty())
    }

    /// An application window is a leaf container with a pid (per sway-ipc,
    /// split containers never carry one).
    pub fn is_window(&self) -> bool {
        self.nodes.is_empty()
            && self.floating_nodes.is_empty()
            && self.pid.is_some_and(|pid| pid > 0)
    }

    /// Visit every application window below this node together with the
    /// number of the workspace it sits on.
    pub fn for_each_window<F>(&self, visit: &mut F)
    where
        F: FnMut(&Node, Option<u32>),
    {
        self.walk_windows(None, visit);
    }

    fn walk_windows<F>(&self, workspace: Option<u32>, visit: &mut F)
    where
        F: FnMut(&Node, Option<u32>),
    {
        let workspace = if self.node_type == "workspace" {
            self.num.and_then(|num| u32::try_from(num).ok())
        } else {
            workspace
        };

        if self.is_window() {
            visit(self, workspace);
            return;
        }

        for child in self.nodes.iter().chain(self.floating_nodes.iter()) {
            child.walk_windows(workspace, visit);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputInfo {
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub rect: Rect,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceInfo {
    #[serde(default)]
    pub num: i32,
    pub name: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowChange {
    New,
    Close,
    Focus,
    Move,
    Title,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceChange {
    Init,
    Empty,
    Focus,
    Move,
    Rename,
    Other,
}

/// Compositor events, decoded once at the transport boundary so handlers
/// match exhaustively instead of probing JSON fields.
#[derive(Debug, Clone)]
pub enum CompositorEvent {
    Window {
        change: WindowChange,
        container: Node,
    },
    Workspace {
        change: WorkspaceChange,
    },
    Output,
    /// The subscription connection was re-established; cached compositor
    /// state must be refetched.
    Reconnected,
}

#[derive(Debug, Deserialize)]
struct WindowEventPayload {
    change: String,
    container: Node,
}

#[derive(Debug, Deserialize)]
struct ChangeOnlyPayload {
    change: String,
}

pub fn decode_event(msg_type: u32, payload: &[u8]) -> Option<CompositorEvent> {
    match msg_type {
        IPC_EVENT_WINDOW => {
            let event: WindowEventPayload = serde_json::from_slice(payload).ok()?;
            let change = match event.change.as_str() {
                "new" => WindowChange::New,
                "close" => WindowChange::Close,
                "focus" => WindowChange::Focus,
                "move" => WindowChange::Move,
                "title" => WindowChange::Title,
                _ => WindowChange::Other,
            };
            Some(CompositorEvent::Window {
                change,
                container: event.container,
            })
        }
        IPC_EVENT_WORKSPACE => {
            let event: ChangeOnlyPayload = serde_json::from_slice(payload).ok()?;
            let change = match event.change.as_str() {
                "init" => WorkspaceChange::Init,
                "empty" => WorkspaceChange::Empty,
                "focus" => WorkspaceChange::Focus,
                "move" => WorkspaceChange::Move,
                "rename" => WorkspaceChange::Rename,
                _ => WorkspaceChange::Other,
            };
            Some(CompositorEvent::Workspace { change })
        }
        IPC_EVENT_OUTPUT => Some(CompositorEvent::Output),
        _ => {
            trace!("ignoring unhandled event type 0x{msg_type:x}");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandOutcome {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Persistent request/response connection to the compositor.
pub struct SwayClient {
    socket_path: String,
    stream: Option<UnixStream>,
}

impl SwayClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stream: None,
        }
    }

    fn connect(&mut self) -> Result<&mut UnixStream> {
        if self.stream.is_none() {
            let stream = UnixStream::connect(&self.socket_path).with_context(|| {
                format!("failed to connect to compositor socket {}", self.socket_path)
            })?;
            stream
                .set_read_timeout(Some(REQUEST_TIMEOUT))
                .context("failed to set compositor read timeout")?;
            stream
                .set_write_timeout(Some(REQUEST_TIMEOUT))
                .context("failed to set compositor write timeout")?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("stream populated above"))
    }

    fn roundtrip_once(&mut self, msg_type: u32, payload: &[u8]) -> Result<Value> {
        let stream = self.connect()?;
        ipc_send(stream, msg_type, payload).context("failed to send compositor request")?;
        let (_reply_type, data) =
            ipc_recv(stream).context("failed to read compositor response")?;
        serde_json::from_slice(&data).context("failed to parse compositor response JSON")
    }

    /// Request with one retry: on transport failure the stale connection is
    /// dropped, and a second attempt runs after a short backoff.
    fn roundtrip(&mut self, msg_type: u32, payload: &[u8]) -> Result<Value> {
        match self.roundtrip_once(msg_type, payload) {
            Ok(value) => Ok(value),
            Err(first) => {
                self.stream = None;
                thread::sleep(REQUEST_RETRY_BACKOFF);
                self.roundtrip_once(msg_type, payload)
                    .with_context(|| format!("compositor request failed after retry: {first:#}"))
            }
        }
    }

    pub fn get_tree(&mut self) -> Result<Node> {
        let value = self.roundtrip(IPC_GET_TREE, b"")?;
        serde_json::from_value(value).context("failed to decode compositor tree")
    }

    pub fn get_outputs(&mut self) -> Result<Vec<OutputInfo>> {
        let value = self.roundtrip(IPC_GET_OUTPUTS, b"")?;
        serde_json::from_value(value).context("failed to decode compositor outputs")
    }

    pub fn get_workspaces(&mut self) -> Result<Vec<WorkspaceInfo>> {
        let value = self.roundtrip(IPC_GET_WORKSPACES, b"")?;
        serde_json::from_value(value).context("failed to decode compositor workspaces")
    }

    /// Run a single command; each command in the reply is success-tagged.
    pub fn run_command(&mut self, command: &str) -> Result<()> {
        let value = self.roundtrip(IPC_RUN_COMMAND, command.as_bytes())?;
        let outcomes: Vec<CommandOutcome> =
            serde_json::from_value(value).context("failed to decode command outcomes")?;
        for outcome in &outcomes {
            if !outcome.success {
                let detail = outcome.error.as_deref().unwrap_or("unknown error");
                bail!("compositor rejected command '{command}': {detail}");
            }
        }
        Ok(())
    }

    /// Join multiple commands into one batch (a single IPC round trip).
    pub fn run_batch(&mut self, commands: &[String]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        self.run_command(&commands.join("; "))
    }
}

/// Spawn the subscription reader thread. It owns its own connection,
/// reconnects with exponential backoff, and feeds decoded events into the
/// main loop channel. A `Reconnected` marker is sent after every successful
/// (re)subscription so the loop can refetch compositor state.
pub fn spawn_event_reader(
    socket_path: String,
    running: Arc<AtomicBool>,
    sender: Sender<LoopEvent>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("sway-events".to_string())
        .spawn(move || event_reader_loop(&socket_path, &running, &sender))
        .expect("failed to spawn compositor event reader thread")
}

fn event_reader_loop(socket_path: &str, running: &AtomicBool, sender: &Sender<LoopEvent>) {
    let mut backoff_ms = RECONNECT_INITIAL_MS;

    while running.load(Ordering::SeqCst) {
        let mut stream = match UnixStream::connect(socket_path) {
            Ok(stream) => stream,
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    warn!("compositor connect failed: {err}; retrying in {backoff_ms}ms");
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms = next_backoff(backoff_ms);
                }
                continue;
            }
        };

        if let Err(err) = subscribe(&mut stream) {
            if running.load(Ordering::SeqCst) {
                warn!("compositor subscribe failed: {err:#}; retrying in {backoff_ms}ms");
                thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms = next_backoff(backoff_ms);
            }
            continue;
        }

        backoff_ms = RECONNECT_INITIAL_MS;
        debug!("subscribed to compositor events");
        if sender
            .send(LoopEvent::Compositor(CompositorEvent::Reconnected))
            .is_err()
        {
            return;
        }

        // 1s read timeout so the running flag is checked between events.
        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));

        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }

            match ipc_recv(&mut stream) {
                Ok((msg_type, payload)) => {
                    if let Some(event) = decode_event(msg_type, &payload) {
                        if sender.send(LoopEvent::Compositor(event)).is_err() {
                            return;
                        }
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    if running.load(Ordering::SeqCst) {
                        warn!("compositor event stream lost: {err}; reconnecting");
                    }
                    break;
                }
            }
        }
    }
}

fn subscribe(stream: &mut UnixStream) -> Result<()> {
    ipc_send(stream, IPC_SUBSCRIBE, SUBSCRIBE_PAYLOAD)
        .context("failed to send subscribe request")?;
    let (_msg_type, data) = ipc_recv(stream).context("failed to read subscribe response")?;
    let reply: Value =
        serde_json::from_slice(&data).context("failed to parse subscribe response")?;
    if !reply
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        bail!("compositor refused event subscription: {reply}");
    }
    Ok(())
}

fn next_backoff(current_ms: u64) -> u64 {
    ((current_ms as f64) * RECONNECT_MULTIPLIER).min(RECONNECT_MAX_MS as f64) as u64
}
