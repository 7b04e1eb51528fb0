// Socket sessions: who may command, and the per-connection tasks
//
// The arbiter lives inside the control task. Each connection gets a reader
// task (frames -> control events) and runs a writer loop that owns the write
// half and drains the connection's outbound channel.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::{encode, read_frame, Frame, FrameError};
use super::handshake::{http_response, read_body, read_request, upgrade_response, HandshakeError, Request};
use crate::messages::{error_payload, Command, ERR_BUSY};
use crate::runtime::{ControlError, ControlHandle, Origin};

// Frames queued for one connection before broadcasts to it start failing
const OUTBOUND_CAPACITY: usize = 32;
const ASLEEP_BODY: &str = "Vehicle is asleep. Use admin page to wake.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    /// Receives stop broadcasts, never commands
    Observer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    /// Send `{"error": reason}`, close, and end the connection
    Disconnect(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached(SessionId),
    Busy,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Control(#[from] ControlError),
}

struct OpenSocket {
    role: Role,
    outbound: mpsc::Sender<Outbound>,
}

/// Open sockets and the single controlling session
#[derive(Default)]
pub struct SessionArbiter {
    next_id: u64,
    controller: Option<SessionId>,
    sockets: BTreeMap<SessionId, OpenSocket>,
}

impl SessionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. A second controller is refused and not registered.
    pub fn attach(&mut self, role: Role, outbound: mpsc::Sender<Outbound>) -> AttachOutcome {
        if role == Role::Controller && self.controller.is_some() {
            return AttachOutcome::Busy;
        }
        self.next_id += 1;
        let id = SessionId(self.next_id);
        if role == Role::Controller {
            self.controller = Some(id);
        }
        self.sockets.insert(id, OpenSocket { role, outbound });
        AttachOutcome::Attached(id)
    }

    /// Forget a socket; unknown ids are ignored
    pub fn detach(&mut self, id: SessionId) -> bool {
        if self.controller == Some(id) {
            self.controller = None;
        }
        self.sockets.remove(&id).is_some()
    }

    pub fn is_controller(&self, id: SessionId) -> bool {
        self.controller == Some(id)
    }

    pub fn is_busy(&self) -> bool {
        self.controller.is_some()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Drop the controlling session and tell it why. False if there was none.
    pub fn force_disconnect(&mut self, reason: &'static str) -> bool {
        let Some(id) = self.controller.take() else {
            return false;
        };
        if let Some(socket) = self.sockets.remove(&id) {
            // If its queue is full the connection still ends once the
            // sender is gone, just without the error frame
            if socket.outbound.try_send(Outbound::Disconnect(reason)).is_err() {
                debug!("Session {} did not take the disconnect notice", id);
            }
        }
        info!("Session {} force disconnected", id);
        true
    }

    /// Send a text frame to every socket except `except`
    ///
    /// Observers that cannot take the frame are unregistered; the controller
    /// is never dropped here.
    pub fn broadcast(&mut self, except: Option<SessionId>, text: &str) {
        let mut failed = Vec::new();
        for (id, socket) in &self.sockets {
            if Some(*id) == except {
                continue;
            }
            let frame = Outbound::Frame(Frame::Text(text.to_string()));
            if socket.outbound.try_send(frame).is_err() {
                if socket.role == Role::Observer {
                    failed.push(*id);
                } else {
                    debug!("Broadcast to controller {} failed", id);
                }
            }
        }
        for id in failed {
            debug!("Dropping observer {} after failed broadcast", id);
            self.sockets.remove(&id);
        }
    }
}

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, control: ControlHandle) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let control = control.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, control).await {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Serve one TCP connection: status page, upgrade, then the session
pub async fn handle_connection(stream: TcpStream, control: ControlHandle) -> Result<(), SessionError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let request = read_request(&mut reader).await?;

    if request.method == "GET" && request.path == "/status" {
        let body = serde_json::to_string(&control.status().await?)?;
        return respond(&mut write_half, "200 OK", "application/json", &body).await;
    }
    // Reachable while asleep, so a sleeping vehicle can be woken
    if request.path == "/admin" {
        return admin(&request, &mut reader, &mut write_half, &control).await;
    }
    if !request.path.starts_with("/ws") {
        return respond(&mut write_half, "404 Not Found", "text/plain", "Not found").await;
    }
    let Some(key) = request.websocket_key() else {
        return respond(&mut write_half, "400 Bad Request", "text/plain", "Expected WebSocket upgrade").await;
    };
    if control.status().await?.asleep {
        return respond(&mut write_half, "503 Service Unavailable", "text/plain", ASLEEP_BODY).await;
    }

    let role = if request.has_query_flag("observe=1") {
        Role::Observer
    } else {
        Role::Controller
    };
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    // Registered before the 101 goes out, so a client that saw the upgrade
    // already holds its role
    let outcome = control.attach(role, outbound).await?;
    let upgraded = write_half.write_all(upgrade_response(key).as_bytes()).await;

    let id = match outcome {
        AttachOutcome::Busy => {
            info!("Refused second controller: vehicle is busy");
            upgraded?;
            send_frame(&mut write_half, &Frame::Text(error_payload(ERR_BUSY))).await?;
            send_frame(&mut write_half, &Frame::Close).await?;
            return Ok(());
        }
        AttachOutcome::Attached(id) => id,
    };
    if let Err(e) = upgraded {
        control.detach(id).await;
        return Err(e.into());
    }
    info!("Session {} opened as {:?}", id, role);

    let (pong_tx, pong_rx) = mpsc::channel(4);
    let reader_task = tokio::spawn(receive_loop(reader, id, control.clone(), pong_tx));
    let result = send_loop(&mut write_half, outbound_rx, pong_rx, reader_task).await;

    control.detach(id).await;
    info!("Session {} closed", id);
    result
}

/// Admin actions: `GET /admin?force_disconnect=1`, and `POST /admin` with `wake` in the body
async fn admin(
    request: &Request,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    control: &ControlHandle,
) -> Result<(), SessionError> {
    if request.method == "GET" && request.has_query_flag("force_disconnect=1") {
        let body = if control.force_disconnect().await? {
            "Force disconnect sent."
        } else {
            "No controlling session."
        };
        return respond(writer, "200 OK", "text/plain", body).await;
    }
    if request.method == "POST" && read_body(reader, request).await?.contains("wake") {
        control.wake().await?;
        info!("Woken by admin request");
        return respond(writer, "200 OK", "text/plain", "Vehicle awake.").await;
    }
    respond(writer, "400 Bad Request", "text/plain", "Unknown admin action").await
}

async fn respond(writer: &mut OwnedWriteHalf, status: &str, content_type: &str, body: &str) -> Result<(), SessionError> {
    writer
        .write_all(http_response(status, content_type, body).as_bytes())
        .await?;
    writer.shutdown().await?;
    Ok(())
}

async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    writer.write_all(&encode(frame)).await
}

/// Decode frames and forward commands until close or error
async fn receive_loop(
    mut reader: BufReader<OwnedReadHalf>,
    id: SessionId,
    control: ControlHandle,
    pongs: mpsc::Sender<Vec<u8>>,
) -> Result<(), FrameError> {
    loop {
        match read_frame(&mut reader).await? {
            Frame::Text(text) => match Command::parse(&text) {
                Ok(command) => {
                    if control.command(Origin::Session(id), command).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => debug!("Ignoring message on session {}: {}", id, e),
            },
            Frame::Ping(data) => {
                if pongs.send(data).await.is_err() {
                    return Ok(());
                }
            }
            Frame::Close => return Ok(()),
            other => debug!("Ignoring opcode {:#x} on session {}", other.opcode(), id),
        }
    }
}

/// Own the write half: outbound frames, pong replies, and the end of the session
async fn send_loop(
    writer: &mut OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
    mut pongs: mpsc::Receiver<Vec<u8>>,
    mut reader_task: JoinHandle<Result<(), FrameError>>,
) -> Result<(), SessionError> {
    let result = loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = send_frame(writer, &frame).await {
                        break Err(e.into());
                    }
                }
                Some(Outbound::Disconnect(reason)) => {
                    let _ = send_frame(writer, &Frame::Text(error_payload(reason))).await;
                    let _ = send_frame(writer, &Frame::Close).await;
                    break Ok(());
                }
                // Unregistered by the control task
                None => {
                    let _ = send_frame(writer, &Frame::Close).await;
                    break Ok(());
                }
            },
            Some(data) = pongs.recv() => {
                if let Err(e) = send_frame(writer, &Frame::Pong(data)).await {
                    break Err(e.into());
                }
            }
            finished = &mut reader_task => {
                let _ = send_frame(writer, &Frame::Close).await;
                return match finished {
                    Ok(result) => result.map_err(SessionError::from),
                    Err(e) => {
                        warn!("Session reader task failed: {}", e);
                        Ok(())
                    }
                };
            }
        }
    };
    reader_task.abort();
    let _ = writer.shutdown().await;
    result
}
