//! The messagelink state machine, send operations, and reader task
//! (spec §3 "Messagelink", §4.2, §4.5, §4.6).
//!
//! Grounded on `services/forwarder/src/uplink.rs` (`UplinkSession`: a
//! connect/send/recv client wrapping one long-lived socket) and
//! `services/receiver/src/session.rs` (the reader-loop/`SessionError`
//! shape), re-expressed over hand-rolled RFC 6455 frames instead of
//! `tokio-tungstenite` since this system's core is the protocol engine
//! itself.

use crate::addr::NetAddr;
use crate::error::{HandshakeError, LinkError, WsError};
use crate::http::{Request, Response};
use crate::ws::frame::{self, Frame, Opcode, Role};
use crate::ws::handshake;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Close-code semantics (spec §4.2).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_TYPE: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

const CLOSE_WAIT: Duration = Duration::from_secs(5);
const CLIENT_POST_CLOSE_DELAY: Duration = Duration::from_secs(4);
const READ_POLL: Duration = Duration::from_secs(1);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    ClientConnecting,
    ServerConnecting,
    Open,
    Closing,
    CloseReceived,
    Closed,
}

impl LinkState {
    fn name(self) -> &'static str {
        match self {
            LinkState::Created => "created",
            LinkState::ClientConnecting => "client-connecting",
            LinkState::ServerConnecting => "server-connecting",
            LinkState::Open => "open",
            LinkState::Closing => "closing",
            LinkState::CloseReceived => "close-received",
            LinkState::Closed => "closed",
        }
    }
}

pub type OnMessage = Arc<dyn Fn(Messagelink, Value) + Send + Sync>;
pub type OnClose = Arc<dyn Fn(Messagelink) + Send + Sync>;
pub type OnPong = Arc<dyn Fn(Messagelink, Vec<u8>) + Send + Sync>;

pub type LinkId = Uuid;

struct Sockets {
    write: OwnedWriteHalf,
    read: Option<OwnedReadHalf>,
}

struct Inner {
    id: LinkId,
    name: String,
    topic: String,
    role: Role,
    local_addr: NetAddr,
    remote_addr: NetAddr,
    sockets: Mutex<Option<Sockets>>,
    state: Mutex<LinkState>,
    close_code: AtomicU16,
    onclose_fired: AtomicBool,
    closed_notify: Notify,
    onmessage: Mutex<Option<OnMessage>>,
    onclose: Mutex<Option<OnClose>>,
    onpong: Mutex<Option<OnPong>>,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    /// Notifies the owning hub to drop this link from its set (spec §9:
    /// links hold a lookup key back to the hub, not a strong handle).
    hub_removal: Option<mpsc::UnboundedSender<LinkId>>,
}

/// A WebSocket-bearing bidirectional connection. Cheaply `Clone`-able; all
/// clones share the same underlying connection and state.
#[derive(Clone)]
pub struct Messagelink(Arc<Inner>);

impl Messagelink {
    fn new(
        name: String,
        topic: String,
        role: Role,
        local_addr: NetAddr,
        remote_addr: NetAddr,
        stream: TcpStream,
        state: LinkState,
        hub_removal: Option<mpsc::UnboundedSender<LinkId>>,
    ) -> Messagelink {
        let (read, write) = stream.into_split();
        Messagelink(Arc::new(Inner {
            id: Uuid::new_v4(),
            name,
            topic,
            role,
            local_addr,
            remote_addr,
            sockets: Mutex::new(Some(Sockets { write, read: Some(read) })),
            state: Mutex::new(state),
            close_code: AtomicU16::new(close_code::NO_STATUS),
            onclose_fired: AtomicBool::new(false),
            closed_notify: Notify::new(),
            onmessage: Mutex::new(None),
            onclose: Mutex::new(None),
            onpong: Mutex::new(None),
            user_data: Mutex::new(None),
            reader_handle: Mutex::new(None),
            hub_removal,
        }))
    }

    pub fn id(&self) -> LinkId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn topic(&self) -> &str {
        &self.0.topic
    }

    pub fn remote_addr(&self) -> &NetAddr {
        &self.0.remote_addr
    }

    pub fn local_addr(&self) -> &NetAddr {
        &self.0.local_addr
    }

    pub async fn state(&self) -> LinkState {
        *self.0.state.lock().await
    }

    pub fn close_code(&self) -> u16 {
        self.0.close_code.load(Ordering::SeqCst)
    }

    pub async fn set_onmessage(&self, cb: OnMessage) {
        *self.0.onmessage.lock().await = Some(cb);
    }

    pub async fn set_onclose(&self, cb: OnClose) {
        *self.0.onclose.lock().await = Some(cb);
    }

    pub async fn set_onpong(&self, cb: OnPong) {
        *self.0.onpong.lock().await = Some(cb);
    }

    pub async fn set_user_data<T: Any + Send + Sync>(&self, data: T) {
        *self.0.user_data.lock().await = Some(Arc::new(data));
    }

    pub async fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let guard = self.0.user_data.lock().await;
        guard.as_ref().and_then(|d| d.clone().downcast::<T>().ok())
    }

    // -- construction -----------------------------------------------------

    /// Client-side connect (spec §4.2/§4.3).
    pub async fn connect(name: &str, topic: &str, addr: &NetAddr) -> Result<Messagelink, LinkError> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await.map_err(HandshakeError::Io)?;
        let local_addr = local_addr_of(&stream);
        let link = Messagelink::new(
            name.to_owned(),
            topic.to_owned(),
            Role::Client,
            local_addr,
            addr.clone(),
            stream,
            LinkState::ClientConnecting,
            None,
        );

        if let Err(e) = link.do_client_handshake(&addr.host).await {
            link.force_closed_unopened().await;
            return Err(e.into());
        }
        *link.0.state.lock().await = LinkState::Open;
        Ok(link)
    }

    async fn do_client_handshake(&self, host: &str) -> Result<(), HandshakeError> {
        let key = handshake::generate_key();
        let request = handshake::build_request(host, &key);
        {
            let mut sockets = self.0.sockets.lock().await;
            let sockets = sockets.as_mut().expect("sockets present during handshake");
            sockets.write.write_all(&request).await?;
            sockets.write.flush().await?;
        }
        let mut read = self.take_read_half().await;
        let mut buffered = BufReader::new(&mut read);
        let response = Response::read_headers(&mut buffered).await.map_err(HandshakeError::Http)?;
        self.restore_read_half(read).await;
        handshake::validate_response(&response, &key)
    }

    /// Server-side accept, used by `Messagehub` after validating the
    /// upgrade request and sending the 101 reply (spec §4.4/§4.7).
    pub(crate) fn from_accepted(
        name: String,
        topic: String,
        local_addr: NetAddr,
        remote_addr: NetAddr,
        stream: TcpStream,
        hub_removal: mpsc::UnboundedSender<LinkId>,
    ) -> Messagelink {
        let link = Messagelink::new(
            name,
            topic,
            Role::Server,
            local_addr,
            remote_addr,
            stream,
            LinkState::Open,
            Some(hub_removal),
        );
        link
    }

    async fn take_read_half(&self) -> OwnedReadHalf {
        let mut sockets = self.0.sockets.lock().await;
        sockets.as_mut().and_then(|s| s.read.take()).expect("read half available")
    }

    async fn restore_read_half(&self, read: OwnedReadHalf) {
        let mut sockets = self.0.sockets.lock().await;
        if let Some(s) = sockets.as_mut() {
            s.read = Some(read);
        }
    }

    async fn force_closed_unopened(&self) {
        let mut state = self.0.state.lock().await;
        *state = LinkState::Closed;
        *self.0.sockets.lock().await = None;
    }

    // -- reader task --------------------------------------------------------

    /// Starts the background reader task; only meaningful once `onmessage`
    /// has been installed (spec §4.6). The `quit` flag is polled every
    /// second alongside the read itself.
    pub async fn spawn_reader(&self, quit: Arc<AtomicBool>) {
        if self.0.onmessage.lock().await.is_none() {
            return;
        }
        let read = self.take_read_half().await;
        let link = self.clone();
        let handle = tokio::spawn(async move { link.reader_loop(read, quit).await });
        *self.0.reader_handle.lock().await = Some(handle);
    }

    async fn reader_loop(self, mut read: OwnedReadHalf, quit: Arc<AtomicBool>) {
        loop {
            if self.state().await != LinkState::Open {
                break;
            }
            if quit.load(Ordering::SeqCst) {
                self.close(close_code::GOING_AWAY).await.ok();
                break;
            }
            match tokio::time::timeout(READ_POLL, frame::read_frame(&mut read, self.0.role)).await {
                Err(_elapsed) => continue,
                Ok(Ok(frame)) => {
                    if self.handle_frame(frame).await {
                        break;
                    }
                }
                Ok(Err(WsError::TooBig(_))) => {
                    self.send_control_frame(Opcode::Close, &close_code::TOO_BIG.to_be_bytes())
                        .await
                        .ok();
                    self.finish_close(close_code::TOO_BIG, false).await;
                    break;
                }
                Ok(Err(WsError::Unmasked)) => {
                    self.send_control_frame(Opcode::Close, &close_code::PROTOCOL_ERROR.to_be_bytes())
                        .await
                        .ok();
                    self.finish_close(close_code::PROTOCOL_ERROR, false).await;
                    break;
                }
                Ok(Err(_io_or_other)) => {
                    self.send_control_frame(Opcode::Close, &close_code::INTERNAL_ERROR.to_be_bytes())
                        .await
                        .ok();
                    self.finish_close(close_code::INTERNAL_ERROR, false).await;
                    break;
                }
            }
        }
        self.restore_read_half(read).await;
    }

    /// Dispatch one decoded frame. Returns `true` if the reader loop should
    /// stop after this frame.
    async fn handle_frame(&self, frame: Frame) -> bool {
        match frame.opcode {
            Opcode::Text => {
                match serde_json::from_slice::<Value>(&frame.payload) {
                    Ok(value) => {
                        if let Some(cb) = self.0.onmessage.lock().await.clone() {
                            cb(self.clone(), value);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(link = %self.0.id, error = %e, "dropping message: not valid JSON");
                    }
                }
                false
            }
            Opcode::Close => {
                self.handle_close_frame(&frame.payload).await;
                true
            }
            Opcode::Ping => {
                self.send_control_frame(Opcode::Pong, &frame.payload).await.ok();
                false
            }
            Opcode::Pong => {
                if let Some(cb) = self.0.onpong.lock().await.clone() {
                    cb(self.clone(), frame.payload);
                }
                false
            }
            Opcode::Binary | Opcode::Continuation => {
                // This system only ever sends whole text frames (spec §6).
                let _fire_and_forget = self.send_control_frame(
                    Opcode::Close,
                    &close_code::UNSUPPORTED_TYPE.to_be_bytes(),
                )
                .await;
                self.finish_close(close_code::UNSUPPORTED_TYPE, false).await;
                true
            }
        }
    }

    async fn handle_close_frame(&self, payload: &[u8]) {
        let code = if payload.len() >= 2 {
            u16::from_be_bytes([payload[0], payload[1]])
        } else {
            close_code::NO_STATUS
        };
        let mut state = self.0.state.lock().await;
        match *state {
            LinkState::Open => {
                *state = LinkState::CloseReceived;
                drop(state);
                // Fresh remote-initiated close: echo the code back.
                self.send_control_frame(Opcode::Close, &code.to_be_bytes()).await.ok();
                self.finish_close(code, true).await;
            }
            LinkState::Closing => {
                *state = LinkState::CloseReceived;
                drop(state);
                // This is the peer's reply to our own close; don't echo again.
                self.finish_close(code, true).await;
            }
            _ => {}
        }
    }

    // -- close --------------------------------------------------------------

    /// Owner-initiated close (spec §4.2). Idempotent.
    pub async fn close(&self, code: u16) -> Result<(), LinkError> {
        let was_open = {
            let mut state = self.0.state.lock().await;
            match *state {
                LinkState::Open => {
                    *state = LinkState::Closing;
                    true
                }
                LinkState::Closed | LinkState::Closing | LinkState::CloseReceived => return Ok(()),
                _ => {
                    *state = LinkState::Closed;
                    *self.0.sockets.lock().await = None;
                    return Ok(());
                }
            }
        };
        if !was_open {
            return Ok(());
        }

        self.send_control_frame(Opcode::Close, &code.to_be_bytes()).await.ok();

        let has_reader = self.0.reader_handle.lock().await.is_some();
        let replied = if has_reader {
            tokio::time::timeout(CLOSE_WAIT, self.0.closed_notify.notified()).await.is_ok()
        } else {
            self.wait_for_close_reply_directly(CLOSE_WAIT).await
        };

        if !replied {
            self.finish_close(code, false).await;
        }
        Ok(())
    }

    /// Used only when there is no reader task (e.g. a client link driven
    /// purely through `command`): read directly for the peer's close reply.
    async fn wait_for_close_reply_directly(&self, budget: Duration) -> bool {
        let mut read = self.take_read_half().await;
        let deadline = tokio::time::Instant::now() + budget;
        let result = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break false;
            }
            match tokio::time::timeout(remaining, frame::read_frame(&mut read, self.0.role)).await {
                Ok(Ok(frame)) if frame.opcode == Opcode::Close => {
                    let code = if frame.payload.len() >= 2 {
                        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                    } else {
                        close_code::NO_STATUS
                    };
                    self.finish_close(code, true).await;
                    break true;
                }
                Ok(Ok(frame)) if frame.opcode == Opcode::Ping => {
                    self.send_control_frame(Opcode::Pong, &frame.payload).await.ok();
                }
                Ok(Ok(_)) => {}
                _ => break false,
            }
        };
        self.restore_read_half(read).await;
        result
    }

    /// Final teardown: optional client-side grace delay, socket close,
    /// state transition, `onclose` (exactly once).
    async fn finish_close(&self, code: u16, apply_client_delay: bool) {
        {
            let mut state = self.0.state.lock().await;
            if *state == LinkState::Closed {
                return;
            }
            *state = LinkState::Closed;
        }
        self.0.close_code.store(code, Ordering::SeqCst);

        if apply_client_delay && self.0.role == Role::Client {
            tokio::time::sleep(CLIENT_POST_CLOSE_DELAY).await;
        }

        *self.0.sockets.lock().await = None;

        if !self.0.onclose_fired.swap(true, Ordering::SeqCst) {
            if let Some(cb) = self.0.onclose.lock().await.clone() {
                cb(self.clone());
            }
        }
        self.0.closed_notify.notify_waiters();

        if let Some(tx) = &self.0.hub_removal {
            let _ = tx.send(self.0.id);
        }
    }

    /// Blocks until any reader task has joined (spec §3 destruction rule).
    pub async fn join_reader(&self) {
        let handle = self.0.reader_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // -- send -----------------------------------------------------------------

    async fn send_control_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), LinkError> {
        self.write_frame(opcode, payload).await
    }

    async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), LinkError> {
        let masked = self.0.role == Role::Client;
        let bytes = frame::encode(opcode, masked, payload);
        let mut sockets = self.0.sockets.lock().await;
        match sockets.as_mut() {
            Some(s) => {
                s.write.write_all(&bytes).await.map_err(WsError::Io)?;
                s.write.flush().await.map_err(WsError::Io)?;
                Ok(())
            }
            None => Err(WsError::Closed.into()),
        }
    }

    async fn require_open(&self) -> Result<(), LinkError> {
        if self.state().await != LinkState::Open {
            return Err(LinkError::NotOpen(self.state().await.name()));
        }
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<(), LinkError> {
        self.require_open().await?;
        self.write_frame(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_obj<T: Serialize>(&self, value: &T) -> Result<(), LinkError> {
        let text = serde_json::to_string(value)?;
        self.send_text(&text).await
    }

    pub async fn send_num(&self, n: f64) -> Result<(), LinkError> {
        self.send_text(&n.to_string()).await
    }

    /// Sends a JSON-escaped string as a text frame (spec §4.5's "escaped
    /// string" payload shape).
    pub async fn send_escaped_str(&self, s: &str) -> Result<(), LinkError> {
        let escaped = serde_json::to_string(s)?;
        self.send_text(&escaped).await
    }

    pub async fn send_ping(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.require_open().await?;
        self.write_frame(Opcode::Ping, payload).await
    }

    /// A text send followed by a blocking read of one reply on the same
    /// link. Only permitted on client-side links with no `onmessage`
    /// handler and no reader task (spec §4.5).
    pub async fn command(&self, text: &str) -> Result<Value, LinkError> {
        if self.0.role != Role::Client {
            return Err(LinkError::CommandNotPermitted);
        }
        if self.0.onmessage.lock().await.is_some() || self.0.reader_handle.lock().await.is_some() {
            return Err(LinkError::CommandNotPermitted);
        }
        self.require_open().await?;
        self.write_frame(Opcode::Text, text.as_bytes()).await?;

        let mut read = self.take_read_half().await;
        let outcome = tokio::time::timeout(COMMAND_TIMEOUT, async {
            loop {
                let frame = frame::read_frame(&mut read, self.0.role).await?;
                match frame.opcode {
                    Opcode::Text => return Ok(serde_json::from_slice::<Value>(&frame.payload)?),
                    Opcode::Ping => continue,
                    Opcode::Close => return Err(LinkError::Ws(WsError::Closed)),
                    _ => continue,
                }
            }
        })
        .await;
        // Restore before interpreting the outcome: both the timeout and the
        // closed-during-command path must still leave the read half in
        // place for a subsequent `close()` to find.
        self.restore_read_half(read).await;
        outcome.map_err(|_elapsed| LinkError::Timeout)?
    }

    pub(crate) fn hub_removal_sender(&self) -> Option<mpsc::UnboundedSender<LinkId>> {
        self.0.hub_removal.clone()
    }
}

fn local_addr_of(stream: &TcpStream) -> NetAddr {
    match stream.local_addr() {
        Ok(std::net::SocketAddr::V4(a)) => NetAddr::new(a.ip().to_string(), a.port()),
        _ => NetAddr::new("0.0.0.0", 0),
    }
}

/// Accept an inbound connection as a server-side messagelink: perform the
/// server handshake, then return the open link. Separate from
/// `from_accepted` so `Messagehub` can first inspect the request headers to
/// decide HTTP-vs-upgrade routing (spec §4.4/§4.7).
pub(crate) async fn server_accept(
    name: String,
    topic: String,
    mut stream: TcpStream,
    request: &Request,
    hub_removal: mpsc::UnboundedSender<LinkId>,
) -> Result<Messagelink, (TcpStream, HandshakeError)> {
    let accept = match handshake::accept_for_request(request) {
        Ok(a) => a,
        Err(e) => return Err((stream, e)),
    };
    let response = handshake::accept_response(&accept);
    if let Err(e) = response.write_to(&mut stream).await {
        return Err((stream, HandshakeError::Io(e)));
    }
    let local_addr = local_addr_of(&stream);
    let remote_addr = match stream.peer_addr() {
        Ok(std::net::SocketAddr::V4(a)) => NetAddr::new(a.ip().to_string(), a.port()),
        _ => NetAddr::new("0.0.0.0", 0),
    };
    Ok(Messagelink::from_accepted(name, topic, local_addr, remote_addr, stream, hub_removal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_constants_match_spec() {
        assert_eq!(close_code::NORMAL, 1000);
        assert_eq!(close_code::GOING_AWAY, 1001);
        assert_eq!(close_code::PROTOCOL_ERROR, 1002);
        assert_eq!(close_code::UNSUPPORTED_TYPE, 1003);
        assert_eq!(close_code::NO_STATUS, 1005);
        assert_eq!(close_code::TOO_BIG, 1009);
        assert_eq!(close_code::INTERNAL_ERROR, 1011);
    }

    #[test]
    fn link_state_names_are_distinct() {
        let names = [
            LinkState::Created,
            LinkState::ClientConnecting,
            LinkState::ServerConnecting,
            LinkState::Open,
            LinkState::Closing,
            LinkState::CloseReceived,
            LinkState::Closed,
        ]
        .map(LinkState::name);
        let mut sorted = names.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len());
    }
}
