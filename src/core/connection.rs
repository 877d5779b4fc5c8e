//! Connection lifecycle and the per-connection worker
//!
//! A connection moves monotonically through CONNECTING, OPEN, CLOSING and
//! CLOSED. One background worker task owns the transport: it performs the
//! upgrade handshake, drives the read loop, flushes the outbound queue and
//! runs the close handshake. Callers never touch the socket directly, so
//! frame writes can never interleave on the wire.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::core::events::{Dispatcher, Event, Listener};
use crate::core::message::Message;
use crate::core::transport::{self, Transport};
use crate::error::{Result, SockletError};
use crate::protocol::close::{self, close_code, CloseFrame};
use crate::protocol::frame::{Frame, FrameCodec, Opcode};
use crate::protocol::handshake::{self, Target};
use crate::protocol::MessageAssembler;

/// Connection lifecycle phase. Transitions are monotonic; a connection
/// never regresses to an earlier phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    pub(crate) const fn rank(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    pub(crate) const fn bit(self) -> u8 {
        1 << self.rank()
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        write!(f, "{}", name)
    }
}

enum Command {
    Send(Message),
    Close(CloseFrame),
}

enum CloseAction {
    Abort,
    SendClose,
    Noop,
}

/// State shared between the public handle and the worker. The ready-state
/// watch channel doubles as the transition notifier for `wait_for_state`.
struct Shared {
    id: String,
    state: watch::Sender<ReadyState>,
    /// Bitmask of every state this connection has reached, so a waiter
    /// cannot miss a transition coalesced by the watch channel
    visited: AtomicU8,
    close_dispatched: AtomicBool,
    dispatcher: Dispatcher,
}

impl Shared {
    fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    fn has_visited(&self, state: ReadyState) -> bool {
        self.visited.load(Ordering::SeqCst) & state.bit() != 0
    }

    /// Advance the ready-state if `next` is later than the current phase.
    /// The visited bit is recorded before waiters are notified.
    fn transition(&self, next: ReadyState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|current| {
            if next.rank() > current.rank() {
                self.visited.fetch_or(next.bit(), Ordering::SeqCst);
                *current = next;
                moved = true;
                true
            } else {
                false
            }
        });
        if moved {
            debug!("[{}] ready-state is now {}", self.id, next);
        }
        moved
    }

    /// Atomically decide how a close request applies to the current state
    fn begin_close(&self) -> CloseAction {
        let mut action = CloseAction::Noop;
        self.state.send_if_modified(|current| match *current {
            ReadyState::Connecting => {
                self.visited
                    .fetch_or(ReadyState::Closed.bit(), Ordering::SeqCst);
                *current = ReadyState::Closed;
                action = CloseAction::Abort;
                true
            }
            ReadyState::Open => {
                self.visited
                    .fetch_or(ReadyState::Closing.bit(), Ordering::SeqCst);
                *current = ReadyState::Closing;
                action = CloseAction::SendClose;
                true
            }
            _ => false,
        });
        action
    }

    fn dispatch(&self, event: &Event) {
        self.dispatcher.dispatch(event);
    }

    fn close_event_sent(&self) -> bool {
        self.close_dispatched.load(Ordering::SeqCst)
    }

    /// Force CLOSED and deliver the terminal Close event exactly once
    fn emit_close(&self, code: u16, reason: &str) {
        self.transition(ReadyState::Closed);
        if !self.close_dispatched.swap(true, Ordering::SeqCst) {
            info!("[{}] closed with code {}", self.id, code);
            self.dispatch(&Event::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}

/// A WebSocket connection handle.
///
/// Construct with a target address, register listeners, then `start()`.
/// All methods may be called from any task; the worker serializes every
/// wire write through the outbound queue.
pub struct WebSocket {
    shared: Arc<Shared>,
    target: Target,
    config: ClientConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl WebSocket {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn with_config(url: &str, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let target = Target::parse(url)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ReadyState::Connecting);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4().to_string(),
            state: state_tx,
            visited: AtomicU8::new(ReadyState::Connecting.bit()),
            close_dispatched: AtomicBool::new(false),
            dispatcher: Dispatcher::new(),
        });
        Ok(Self {
            shared,
            target,
            config,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
        })
    }

    /// Unique identifier for log correlation
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_state()
    }

    /// Register a listener; listeners are invoked in registration order
    /// for every event
    pub fn add_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.shared.dispatcher.add(Arc::new(listener) as Listener);
    }

    /// Spawn the background worker that connects, performs the handshake
    /// and drives the connection. Must be called at most once, from within
    /// a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let receiver = {
            let mut slot = match self.cmd_rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        let Some(cmd_rx) = receiver else {
            return Err(SockletError::InvalidState(self.ready_state()));
        };
        if self.ready_state() != ReadyState::Connecting {
            return Err(SockletError::InvalidState(self.ready_state()));
        }

        let worker = Worker {
            shared: Arc::clone(&self.shared),
            target: self.target.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(worker.run(cmd_rx));
        Ok(())
    }

    /// Queue a message for the worker to write. Fails with `InvalidState`
    /// unless the connection is OPEN; nothing touches the wire on failure.
    pub fn send(&self, message: Message) -> Result<()> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(SockletError::InvalidState(state));
        }
        self.cmd_tx
            .send(Command::Send(message))
            .map_err(|_| SockletError::InvalidState(self.ready_state()))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::Binary(data.into()))
    }

    /// Request a close handshake. Idempotent: repeated calls while CLOSING
    /// or CLOSED are no-ops. Called before OPEN, the connection aborts
    /// straight to CLOSED and queued sends are discarded.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        let code = code.unwrap_or(close_code::NORMAL);
        if !close::is_sendable(code) {
            return Err(SockletError::Protocol(format!(
                "close code {} cannot be sent on the wire",
                code
            )));
        }
        let frame = CloseFrame::new(code, reason.unwrap_or(""));

        match self.shared.begin_close() {
            CloseAction::Abort => {
                info!("[{}] aborted before open", self.shared.id);
                self.shared.emit_close(frame.code, &frame.reason);
            }
            CloseAction::SendClose => {
                // Worker gone means the failure path already closed us
                let _ = self.cmd_tx.send(Command::Close(frame));
            }
            CloseAction::Noop => {}
        }
        Ok(())
    }

    /// Suspend until the connection reaches `target` or a terminal state.
    ///
    /// Fails with `Unreachable` when the connection reaches CLOSED without
    /// ever having been in `target`.
    pub async fn wait_for_state(&self, target: ReadyState) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        loop {
            if self.shared.has_visited(target) {
                return Ok(());
            }
            if self.shared.has_visited(ReadyState::Closed) {
                return Err(SockletError::Unreachable(target));
            }
            if rx.changed().await.is_err() {
                // Sender gone; the state can never change again
                return if self.shared.has_visited(target) {
                    Ok(())
                } else {
                    Err(SockletError::Unreachable(target))
                };
            }
        }
    }
}

/// Deadline placeholder while no close handshake is in flight
const IDLE_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

enum LoopOutcome {
    /// Close handshake finished (or timed out); deliver this Close event
    Clean(u16, String),
    /// Protocol or transport failure
    Fatal(SockletError),
}

struct Worker {
    shared: Arc<Shared>,
    target: Target,
    config: ClientConfig,
}

impl Worker {
    async fn run(self, cmd_rx: mpsc::UnboundedReceiver<Command>) {
        match self.establish().await {
            Ok((stream, leftover)) => {
                if !self.shared.transition(ReadyState::Open) {
                    // Aborted while connecting; the abort emitted the
                    // Close event already
                    debug!("[{}] dropping aborted connection", self.shared.id);
                    return;
                }
                info!(
                    "[{}] connection open to {}:{}",
                    self.shared.id, self.target.host, self.target.port
                );
                self.shared.dispatch(&Event::Open);
                self.read_loop(stream, leftover, cmd_rx).await;
            }
            Err(err) => {
                error!("[{}] failed to open: {}", self.shared.id, err);
                if !self.shared.close_event_sent() && !self.shared.has_visited(ReadyState::Closed)
                {
                    self.shared.dispatch(&Event::Error(err));
                }
                self.shared.emit_close(close_code::ABNORMAL, "");
            }
        }
    }

    /// Connect the transport and run the upgrade handshake, bounded by the
    /// connect timeout and raced against an abort
    async fn establish(&self) -> Result<(Transport, BytesMut)> {
        let mut state_rx = self.shared.state.subscribe();
        let connect = async {
            let mut stream = transport::connect(&self.target, &self.config).await?;
            let key = handshake::generate_key();
            let leftover = handshake::client_handshake(&mut stream, &self.target, &key).await?;
            Ok::<(Transport, BytesMut), SockletError>((stream, leftover))
        };

        tokio::select! {
            result = timeout(self.config.connect_timeout, connect) => match result {
                Ok(inner) => inner,
                Err(_) => Err(SockletError::Handshake(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                ))),
            },
            _ = async {
                loop {
                    if *state_rx.borrow_and_update() == ReadyState::Closed {
                        break;
                    }
                    if state_rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            } => Err(SockletError::Handshake(
                "connection aborted before open".to_string(),
            )),
        }
    }

    async fn read_loop(
        &self,
        stream: Transport,
        leftover: BytesMut,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let codec = FrameCodec::client().with_max_frame_size(self.config.max_frame_size);
        let mut assembler = MessageAssembler::new(self.config.max_message_size);
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut buf = leftover;
        let mut cmd_open = true;
        let mut close_sent: Option<CloseFrame> = None;
        let mut close_deadline: Option<Instant> = None;

        let outcome = 'outer: loop {
            // Drain every frame already buffered before reading more
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        match self
                            .handle_frame(frame, &mut assembler, &codec, &mut wr, &close_sent)
                            .await
                        {
                            Ok(Some((code, reason))) => {
                                break 'outer LoopOutcome::Clean(code, reason)
                            }
                            Ok(None) => {}
                            Err(err) => break 'outer LoopOutcome::Fatal(err),
                        }
                    }
                    Ok(None) => break,
                    Err(err) => break 'outer LoopOutcome::Fatal(err),
                }
            }

            if buf.capacity() - buf.len() < 1024 {
                buf.reserve(self.config.read_buffer_size);
            }
            let deadline =
                close_deadline.unwrap_or_else(|| Instant::now() + IDLE_DEADLINE);

            tokio::select! {
                maybe_cmd = cmd_rx.recv(), if cmd_open => match maybe_cmd {
                    Some(Command::Send(message)) => {
                        // The close command travels through the same queue,
                        // so sends accepted ahead of it still reach the wire;
                        // only frames dequeued after the close frame went out
                        // are discarded
                        if close_sent.is_none() {
                            let frame = match message {
                                Message::Text(text) => Frame::text(text),
                                Message::Binary(data) => Frame::binary(data),
                            };
                            if let Err(err) = write_frame(&codec, &mut wr, &frame).await {
                                break 'outer LoopOutcome::Fatal(err);
                            }
                        } else {
                            debug!("[{}] discarding queued send after close", self.shared.id);
                        }
                    }
                    Some(Command::Close(frame)) => {
                        if close_sent.is_none() {
                            let wire = Frame::close(frame.to_payload());
                            if let Err(err) = write_frame(&codec, &mut wr, &wire).await {
                                break 'outer LoopOutcome::Fatal(err);
                            }
                            close_deadline =
                                Some(Instant::now() + self.config.close_timeout);
                            close_sent = Some(frame);
                        }
                    }
                    None => {
                        cmd_open = false;
                        // Last handle dropped: leave instead of lingering
                        if close_sent.is_none()
                            && self.shared.ready_state() == ReadyState::Open
                        {
                            debug!("[{}] handle dropped, going away", self.shared.id);
                            self.shared.transition(ReadyState::Closing);
                            let frame =
                                CloseFrame::new(close_code::GOING_AWAY, "client went away");
                            let wire = Frame::close(frame.to_payload());
                            if let Err(err) = write_frame(&codec, &mut wr, &wire).await {
                                break 'outer LoopOutcome::Fatal(err);
                            }
                            close_deadline =
                                Some(Instant::now() + self.config.close_timeout);
                            close_sent = Some(frame);
                        }
                    }
                },
                result = rd.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        break 'outer LoopOutcome::Fatal(SockletError::Transport(
                            io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed by peer",
                            ),
                        ));
                    }
                    Ok(_) => {}
                    Err(err) => break 'outer LoopOutcome::Fatal(SockletError::Transport(err)),
                },
                _ = sleep_until(deadline), if close_deadline.is_some() => {
                    let frame = close_sent.clone().unwrap_or_else(CloseFrame::normal);
                    warn!(
                        "[{}] close handshake timed out after {:?}, forcing CLOSED",
                        self.shared.id, self.config.close_timeout
                    );
                    break 'outer LoopOutcome::Clean(frame.code, frame.reason);
                },
            }
        };

        match outcome {
            LoopOutcome::Clean(code, reason) => {
                let _ = wr.shutdown().await;
                self.shared.emit_close(code, &reason);
            }
            LoopOutcome::Fatal(err) => {
                let close_with = match err {
                    SockletError::Protocol(_) => close_code::PROTOCOL_ERROR,
                    _ => close_code::ABNORMAL,
                };
                if close_with == close_code::PROTOCOL_ERROR {
                    // Best effort; the peer may already be gone
                    let frame = CloseFrame::new(close_code::PROTOCOL_ERROR, "");
                    let _ =
                        write_frame(&codec, &mut wr, &Frame::close(frame.to_payload())).await;
                }
                let _ = wr.shutdown().await;
                error!("[{}] connection failed: {}", self.shared.id, err);
                if !self.shared.close_event_sent() {
                    self.shared.dispatch(&Event::Error(err));
                }
                self.shared.emit_close(close_with, "");
            }
        }
    }

    /// Handle one decoded frame. Returns the terminal close code and
    /// reason once the close handshake completes.
    async fn handle_frame<W>(
        &self,
        frame: Frame,
        assembler: &mut MessageAssembler,
        codec: &FrameCodec,
        wr: &mut W,
        close_sent: &Option<CloseFrame>,
    ) -> Result<Option<(u16, String)>>
    where
        W: AsyncWrite + Unpin,
    {
        match frame.opcode {
            Opcode::Ping => {
                debug!("[{}] ping ({} bytes)", self.shared.id, frame.payload.len());
                write_frame(codec, wr, &Frame::pong(frame.payload)).await?;
                Ok(None)
            }
            Opcode::Pong => {
                debug!("[{}] pong ({} bytes)", self.shared.id, frame.payload.len());
                Ok(None)
            }
            Opcode::Close => {
                let remote = CloseFrame::parse(&frame.payload)?;
                let (code, reason) = match &remote {
                    Some(frame) => (frame.code, frame.reason.clone()),
                    None => (close_code::NO_STATUS, String::new()),
                };
                if close_sent.is_none() {
                    // Remote initiated: acknowledge, then the connection
                    // is done
                    self.shared.transition(ReadyState::Closing);
                    let echo_payload = match &remote {
                        Some(frame) => CloseFrame::new(frame.code, "").to_payload(),
                        None => Bytes::new(),
                    };
                    write_frame(codec, wr, &Frame::close(echo_payload)).await?;
                }
                Ok(Some((code, reason)))
            }
            _ => {
                if let Some(message) = assembler.push_frame(frame)? {
                    self.shared.dispatch(&Event::Message(message));
                }
                Ok(None)
            }
        }
    }
}

async fn write_frame<W>(codec: &FrameCodec, wr: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    wr.write_all(&buf).await.map_err(SockletError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_closes(ws: &WebSocket) -> Arc<Mutex<Vec<(u16, String)>>> {
        let closes = Arc::new(Mutex::new(Vec::new()));
        let sink = closes.clone();
        ws.add_listener(move |event: &Event| {
            if let Event::Close { code, reason } = event {
                sink.lock().unwrap().push((*code, reason.clone()));
            }
        });
        closes
    }

    #[tokio::test]
    async fn test_send_before_start_is_invalid_state() {
        let ws = WebSocket::new("ws://127.0.0.1:9/").unwrap();
        let result = ws.send_text("too early");
        assert!(matches!(
            result,
            Err(SockletError::InvalidState(ReadyState::Connecting))
        ));
    }

    #[tokio::test]
    async fn test_abort_before_open_goes_straight_to_closed() {
        let ws = WebSocket::new("ws://127.0.0.1:9/").unwrap();
        let closes = record_closes(&ws);

        ws.close(None, None).unwrap();
        assert_eq!(ws.ready_state(), ReadyState::Closed);

        // Repeated closes are no-ops
        ws.close(None, None).unwrap();
        ws.close(Some(close_code::GOING_AWAY), Some("late")).unwrap();

        let closes = closes.lock().unwrap().clone();
        assert_eq!(closes, vec![(close_code::NORMAL, String::new())]);

        assert!(matches!(
            ws.send_text("after close"),
            Err(SockletError::InvalidState(ReadyState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_state_after_abort() {
        let ws = WebSocket::new("ws://127.0.0.1:9/").unwrap();
        ws.close(None, None).unwrap();

        ws.wait_for_state(ReadyState::Closed).await.unwrap();
        let result = ws.wait_for_state(ReadyState::Open).await;
        assert!(matches!(
            result,
            Err(SockletError::Unreachable(ReadyState::Open))
        ));
    }

    #[tokio::test]
    async fn test_unsendable_close_code_rejected() {
        let ws = WebSocket::new("ws://127.0.0.1:9/").unwrap();
        let result = ws.close(Some(close_code::ABNORMAL), None);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
        assert_eq!(ws.ready_state(), ReadyState::Connecting);
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let ws = WebSocket::new("ws://127.0.0.1:9/").unwrap();
        let shared = &ws.shared;
        assert!(shared.transition(ReadyState::Open));
        assert!(!shared.transition(ReadyState::Connecting));
        assert!(!shared.transition(ReadyState::Open));
        assert!(shared.transition(ReadyState::Closing));
        assert!(shared.transition(ReadyState::Closed));
        assert!(!shared.transition(ReadyState::Open));
        assert!(shared.has_visited(ReadyState::Open));
        assert!(shared.has_visited(ReadyState::Closing));
    }

    #[test]
    fn test_close_event_emitted_once() {
        let ws = WebSocket::new("ws://127.0.0.1:9/").unwrap();
        let closes = record_closes(&ws);
        ws.shared.emit_close(1000, "bye");
        ws.shared.emit_close(1006, "");
        assert_eq!(
            closes.lock().unwrap().clone(),
            vec![(1000, "bye".to_string())]
        );
    }

    #[test]
    fn test_ready_state_ordering() {
        assert!(ReadyState::Connecting.rank() < ReadyState::Open.rank());
        assert!(ReadyState::Open.rank() < ReadyState::Closing.rank());
        assert!(ReadyState::Closing.rank() < ReadyState::Closed.rank());
        assert_eq!(ReadyState::Closed.to_string(), "CLOSED");
    }
}
