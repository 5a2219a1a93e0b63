use crate::net::buffer::Buffer;
use crate::net::event::{ConnectionEvent, EventKind, PollPlan};
use crate::net::proto::{ClientMessage, ServerMessage};
use crate::net::support::{ErrorKind, NetError, NetResult};
use crate::signal::Signal;
use flint::logging;
use flint::{ConversationId, PersonId};
use mio::net::TcpStream;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const READ_BUF_SIZE: usize = 65536;
const WRITE_BUF_SIZE: usize = 65536;

// Inbound payloads are tiny (names, chat lines, tiles). Anything bigger is
// a framing desync.
const MAX_PAYLOAD_SIZE: usize = 4096;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(150);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(16);

const DEFAULT_ROOM: &str = "default";
const DEFAULT_LANGUAGE_CODE: &str = "en";

const WS_REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
\r\n";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    /// No socket. A backoff deadline may be pending while running.
    Disconnected,
    /// Nonblocking connect in flight.
    Connecting,
    /// Upgrade request sent, discarding the response up to the blank line.
    WsHandshake,
    /// Blank line seen. The hello (NEW_PLAYER / RECONNECT / JOIN_GAME) is
    /// sent from here, or the engine pauses until a player name arrives.
    Authenticating,
    /// HEADER received.
    Ready,
    /// LEAVE sent, waiting for the server to end the conversation.
    Draining,
}

/// The connection engine. Owns one TCP socket and the wire protocol state;
/// every call must happen under the worker's lock. Progress is driven by
/// [`Connection::wake_up`], which the worker invokes after its poll returns.
pub struct Connection {
    room: String,
    player_name: Option<String>,
    person_id: Option<PersonId>,
    conversation_id: Option<ConversationId>,
    default_language: Option<String>,
    typing: bool,

    running: bool,
    /// Set when the conversation ended (terminal error or END). A parked
    /// engine makes no further connection attempts until `reset()`.
    parked: bool,

    address: Option<SocketAddr>,
    stream: Option<TcpStream>,
    phase: Phase,

    read_buffer: Buffer,
    write_buffer: Buffer,
    scratch: Vec<u8>,

    synced: bool,
    sent_hello: bool,
    messages_received: u16,

    retry_at: Option<Instant>,
    retry_delay: Duration,
    keepalive_at: Option<Instant>,

    socket_generation: u64,
    poll_plan: PollPlan,

    events: Signal<ConnectionEvent>,

    log: logging::Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Connection {
        Connection {
            room: DEFAULT_ROOM.to_owned(),
            player_name: None,
            person_id: None,
            conversation_id: None,
            default_language: None,
            typing: false,
            running: false,
            parked: false,
            address: None,
            stream: None,
            phase: Phase::Disconnected,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            scratch: Vec::new(),
            synced: false,
            sent_hello: false,
            messages_received: 0,
            retry_at: None,
            retry_delay: RECONNECT_BASE_DELAY,
            keepalive_at: None,
            socket_generation: 0,
            poll_plan: PollPlan::idle(),
            events: Signal::new(),
            log: logging::child_or_discard(log),
        }
    }

    /// Fires on the thread that mutates the engine, with the worker lock
    /// held. Listeners must only hand the event off; they cannot call back
    /// into the engine.
    #[inline]
    pub fn event_signal(&self) -> &Signal<ConnectionEvent> {
        &self.events
    }

    #[inline]
    pub fn set_room(&mut self, room: &str) {
        self.room = room.to_owned();
    }

    pub fn set_player_name(&mut self, player_name: &str) {
        self.player_name = Some(player_name.to_owned());

        if self.phase == Phase::Authenticating && !self.sent_hello {
            self.send_hello();
            self.update_poll();
        }
    }

    pub fn set_person_id(&mut self, person_id: PersonId) {
        self.person_id = Some(person_id);

        if self.phase == Phase::Authenticating && !self.sent_hello {
            self.send_hello();
            self.update_poll();
        }
    }

    #[inline]
    pub fn person_id(&self) -> Option<PersonId> {
        self.person_id
    }

    #[inline]
    pub fn set_conversation_id(&mut self, conversation_id: ConversationId) {
        self.conversation_id = Some(conversation_id);
    }

    /// Stores the language preference applied when the engine creates a
    /// fresh game.
    #[inline]
    pub fn set_default_language(&mut self, code: &str) {
        self.default_language = Some(code.to_owned());
    }

    #[inline]
    pub fn get_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn get_typing(&self) -> bool {
        self.typing
    }

    pub fn set_typing(&mut self, typing: bool) {
        if self.typing == typing {
            return;
        }

        self.typing = typing;

        if typing {
            self.command(&ClientMessage::StartTyping);
        } else {
            self.command(&ClientMessage::StopTyping);
        }
    }

    pub fn set_address(&mut self, address: SocketAddr) {
        logging::debug!(self.log, "address set"; "context" => "set_address", "address" => %address);

        self.address = Some(address);

        if self.running && !self.parked && self.stream.is_none() && self.retry_at.is_none() {
            self.begin_connect();
        }

        self.update_poll();
    }

    pub fn set_running(&mut self, running: bool) {
        if self.running == running {
            return;
        }

        self.running = running;

        logging::debug!(self.log, "running state changed";
                        "context" => "set_running",
                        "running" => running);

        self.emit(EventKind::RunningStateChanged(running));

        if running {
            if !self.parked && self.stream.is_none() && self.address.is_some() {
                self.begin_connect();
            }
        } else {
            self.retry_at = None;
            self.close_socket();
            self.phase = Phase::Disconnected;
        }

        self.update_poll();
    }

    /// Resets the engine to a freshly constructed state, keeping the signal
    /// listeners, the server address, the room and the default language.
    /// The engine is left not running.
    pub fn reset(&mut self) {
        logging::debug!(self.log, "engine reset"; "context" => "reset");

        self.close_socket();
        self.phase = Phase::Disconnected;
        self.parked = false;

        self.player_name = None;
        self.person_id = None;
        self.conversation_id = None;
        self.typing = false;
        self.synced = false;
        self.sent_hello = false;
        self.messages_received = 0;
        self.retry_at = None;
        self.retry_delay = RECONNECT_BASE_DELAY;
        self.keepalive_at = None;

        if self.running {
            self.running = false;
            self.emit(EventKind::RunningStateChanged(false));
        }

        self.update_poll();
    }

    pub fn shout(&mut self) {
        self.command(&ClientMessage::Shout);
    }

    pub fn turn(&mut self) {
        self.command(&ClientMessage::Turn);
    }

    pub fn move_tile(&mut self, num: u8, x: i16, y: i16) {
        self.command(&ClientMessage::MoveTile { num, x, y });
    }

    pub fn set_n_tiles(&mut self, n_tiles: u8) {
        self.command(&ClientMessage::SetNTiles(n_tiles));
    }

    pub fn set_language(&mut self, code: &str) {
        self.command(&ClientMessage::SetLanguage(code));
    }

    pub fn send_message(&mut self, text: &str) {
        self.command(&ClientMessage::SendMessage(text));
    }

    pub fn leave(&mut self) {
        self.command(&ClientMessage::Leave);

        if self.phase == Phase::Ready {
            self.phase = Phase::Draining;
        }
    }

    /// The poll set the engine currently wants. The worker reads this under
    /// its lock after every mutation.
    #[inline]
    pub fn poll_plan(&self) -> PollPlan {
        self.poll_plan
    }

    /// The socket to register on the worker's poll, when one exists.
    #[inline]
    pub fn poll_source(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Drives the engine after a poll wake. `readable`/`writable` reflect
    /// the readiness the poll reported for the socket; both false for a
    /// pure timer wake.
    pub fn wake_up(&mut self, readable: bool, writable: bool) {
        let now = Instant::now();

        if let Some(at) = self.retry_at {
            if now >= at {
                self.retry_at = None;

                if self.running && !self.parked && self.stream.is_none() {
                    self.begin_connect();
                }
            }
        }

        if let Some(at) = self.keepalive_at {
            if now >= at {
                self.keepalive_at = None;

                if matches!(self.phase, Phase::Ready | Phase::Draining)
                    && self.write_buffer.is_empty()
                {
                    self.command(&ClientMessage::Keepalive);
                }
            }
        }

        if self.stream.is_some() {
            if self.phase == Phase::Connecting {
                if writable || readable {
                    self.finish_connect();
                }
            } else {
                if readable {
                    self.receive();
                }

                if self.stream.is_some() && !self.write_buffer.is_empty() {
                    self.flush_write();
                }
            }
        }

        if matches!(self.phase, Phase::Ready | Phase::Draining)
            && self.write_buffer.is_empty()
            && self.keepalive_at.is_none()
        {
            self.keepalive_at = Some(now + KEEPALIVE_INTERVAL);
        }

        self.update_poll();
    }

    fn begin_connect(&mut self) {
        let address = match self.address {
            Some(address) => address,
            None => return,
        };

        logging::debug!(self.log, "connecting"; "context" => "connect", "address" => %address);

        match TcpStream::connect(address) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.socket_generation += 1;
                self.phase = Phase::Connecting;
                self.synced = false;
                self.sent_hello = false;
                self.read_buffer.clear();
                self.write_buffer.clear();
                self.keepalive_at = None;
            }
            Err(err) => {
                logging::warn!(self.log, "connect failed";
                               "context" => "connect",
                               "error" => %err);
                self.io_error(ErrorKind::Io(err.kind()));
            }
        }

        self.update_poll();
    }

    fn finish_connect(&mut self) {
        let check = {
            let stream = self.stream.as_ref().expect("Connecting phase must have a stream");

            match stream.take_error() {
                Ok(Some(err)) | Err(err) => Err(err),
                Ok(None) => stream.peer_addr().map(|_| ()),
            }
        };

        match check {
            Ok(()) => {
                logging::debug!(self.log, "connected, starting handshake"; "context" => "connect");

                self.phase = Phase::WsHandshake;
                self.write_buffer.extend(WS_REQUEST);
                self.flush_write();
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::NotConnected => {
                // Still in flight
            }
            Err(err) => {
                self.io_error(ErrorKind::Io(err.kind()));
            }
        }
    }

    fn receive(&mut self) {
        let result = {
            let stream = self.stream.as_mut().expect("receive requires a stream");
            self.read_buffer.ingress(stream)
        };

        let eof = match result {
            Ok((_, eof)) => eof,
            Err(err) => {
                self.io_error(ErrorKind::Io(err.kind()));
                return;
            }
        };

        if let Err(error) = self.process_input() {
            match error {
                NetError::Wait => (),
                NetError::Fatal(kind) if kind.is_conversation_fatal() => {
                    self.conversation_error(kind);
                    return;
                }
                NetError::Fatal(kind) => {
                    self.io_error(kind);
                    return;
                }
            }
        }

        if eof && self.stream.is_some() {
            self.io_error(ErrorKind::ConnectionClosed);
        }
    }

    /// Consumes as much of the read buffer as possible. Returns `Wait` when
    /// a partial frame remains, `Fatal` on protocol violations. A clean stop
    /// (END consumed the socket) returns Ok.
    fn process_input(&mut self) -> NetResult<()> {
        loop {
            match self.phase {
                Phase::WsHandshake => {
                    let end = find_blank_line(self.read_buffer.read_slice());

                    match end {
                        Some(end) => {
                            self.read_buffer.move_head(end);
                            self.phase = Phase::Authenticating;

                            logging::debug!(self.log, "websocket handshake complete";
                                            "context" => "handshake");

                            self.send_hello();
                        }
                        None => {
                            if self.read_buffer.free_capacity() == 0 {
                                return Err(NetError::Fatal(ErrorKind::BadData));
                            }

                            return Err(NetError::Wait);
                        }
                    }
                }
                Phase::Authenticating | Phase::Ready | Phase::Draining => {
                    let (consumed, message) = {
                        let data = self.read_buffer.read_slice();

                        let (header_len, payload_len) = frame_extent(data)?;

                        if data.len() < header_len + payload_len {
                            return Err(NetError::Wait);
                        }

                        let message =
                            ServerMessage::parse(&data[header_len..header_len + payload_len])?;

                        (header_len + payload_len, message)
                    };

                    self.read_buffer.move_head(consumed);

                    if !self.dispatch(message)? {
                        return Ok(());
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Applies one inbound message. Returns Ok(false) when the message
    /// consumed the socket and processing must stop.
    fn dispatch(&mut self, message: ServerMessage) -> NetResult<bool> {
        logging::trace!(self.log, "server message"; "context" => "dispatch", "message" => ?message);

        match message {
            ServerMessage::Header { person_id, self_num } => {
                self.person_id = Some(person_id);
                self.phase = Phase::Ready;
                self.retry_delay = RECONNECT_BASE_DELAY;
                self.emit(EventKind::Header { person_id, self_num });
            }
            ServerMessage::Message { player_num, text } => {
                self.messages_received = self.messages_received.wrapping_add(1);
                self.emit(EventKind::Message { player_num, text });
            }
            ServerMessage::NTiles(n_tiles) => self.emit(EventKind::NTilesChanged(n_tiles)),
            ServerMessage::Tile {
                num,
                x,
                y,
                letter,
                last_player_moved,
            } => self.emit(EventKind::TileChanged {
                num,
                x,
                y,
                letter,
                last_player_moved,
            }),
            ServerMessage::PlayerName { player_num, name } => {
                self.emit(EventKind::PlayerNameChanged { player_num, name })
            }
            ServerMessage::PlayerFlags { player_num, flags } => {
                self.emit(EventKind::PlayerFlagsChanged { player_num, flags })
            }
            ServerMessage::PlayerShouted(player_num) => {
                self.emit(EventKind::PlayerShouted { player_num })
            }
            ServerMessage::Sync => self.synced = true,
            ServerMessage::End => {
                self.emit(EventKind::End);
                self.park();
                return Ok(false);
            }
            ServerMessage::ConversationId(id) => {
                self.conversation_id = Some(id);
                self.emit(EventKind::ConversationId(id));
            }
            ServerMessage::BadPlayerId => return Err(NetError::Fatal(ErrorKind::BadPlayerId)),
            ServerMessage::Language(code) => self.emit(EventKind::LanguageChanged(code)),
            ServerMessage::ConversationFull => {
                return Err(NetError::Fatal(ErrorKind::ConversationFull))
            }
        }

        Ok(true)
    }

    /// Sends the identity message appropriate for the pinned state, or
    /// pauses if no player name is known yet.
    fn send_hello(&mut self) {
        if let Some(person_id) = self.person_id {
            let n_messages_received = self.messages_received;
            self.enqueue(&ClientMessage::Reconnect {
                person_id,
                n_messages_received,
            });
        } else {
            let player_name = match self.player_name.clone() {
                Some(name) => name,
                None => {
                    logging::debug!(self.log, "waiting for a player name";
                                    "context" => "hello");
                    return;
                }
            };

            // A fresh seat; no history to index.
            self.messages_received = 0;

            if let Some(conversation_id) = self.conversation_id {
                self.enqueue(&ClientMessage::JoinGame {
                    conversation_id,
                    player_name: &player_name,
                });
            } else {
                let room = self.room.clone();
                self.enqueue(&ClientMessage::NewPlayer {
                    room: &room,
                    player_name: &player_name,
                });

                match self.default_language.clone() {
                    Some(ref code) if code != DEFAULT_LANGUAGE_CODE => {
                        self.enqueue(&ClientMessage::SetLanguage(code));
                    }
                    _ => (),
                }
            }
        }

        self.sent_hello = true;
        self.flush_write();
    }

    #[inline]
    fn can_send(&self) -> bool {
        self.sent_hello
            && matches!(self.phase, Phase::Authenticating | Phase::Ready | Phase::Draining)
    }

    /// Queues a gameplay command. Commands issued while no authenticated
    /// socket exists are dropped; the server state is re-synchronised on
    /// reconnect.
    fn command(&mut self, message: &ClientMessage) {
        if !self.can_send() {
            logging::debug!(self.log, "command dropped while disconnected";
                            "context" => "command",
                            "message" => ?message);
            return;
        }

        self.enqueue(message);
        self.update_poll();
    }

    fn enqueue(&mut self, message: &ClientMessage) {
        let mut payload = std::mem::take(&mut self.scratch);
        payload.clear();
        message.encode(&mut payload);

        let header_len = if payload.len() < 126 { 2 } else { 4 };

        if self.write_buffer.free_capacity() < header_len + payload.len() {
            logging::warn!(self.log, "transmit queue full, dropping command";
                           "context" => "enqueue",
                           "payload_size" => payload.len());
            self.scratch = payload;
            return;
        }

        // Frames this client emits are unmasked binary frames.
        if payload.len() < 126 {
            self.write_buffer.extend(&[0x82, payload.len() as u8]);
        } else {
            let len = payload.len() as u16;
            self.write_buffer.extend(&[0x82, 126, (len >> 8) as u8, len as u8]);
        }

        self.write_buffer.extend(&payload);
        self.scratch = payload;
    }

    fn flush_write(&mut self) {
        let result = {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return,
            };

            self.write_buffer.egress(stream)
        };

        if let Err(err) = result {
            self.io_error(ErrorKind::Io(err.kind()));
        }
    }

    /// Socket-level failure: emit, close, back off and retry while running.
    fn io_error(&mut self, kind: ErrorKind) {
        logging::debug!(self.log, "connection error";
                        "context" => "error",
                        "kind" => ?kind,
                        "running" => self.running);

        self.emit(EventKind::Error(kind));
        self.close_socket();
        self.phase = Phase::Disconnected;

        if self.running && !self.parked {
            self.retry_at = Some(Instant::now() + self.retry_delay);
            self.retry_delay = (self.retry_delay * 2).min(RECONNECT_MAX_DELAY);
        }

        self.update_poll();
    }

    /// Conversation-level failure: emit and park until reset.
    fn conversation_error(&mut self, kind: ErrorKind) {
        logging::debug!(self.log, "conversation error"; "context" => "error", "kind" => ?kind);

        self.emit(EventKind::Error(kind));
        self.park();
    }

    fn park(&mut self) {
        self.close_socket();
        self.phase = Phase::Disconnected;
        self.parked = true;
        self.retry_at = None;
        self.update_poll();
    }

    fn close_socket(&mut self) {
        if self.stream.take().is_some() {
            self.socket_generation += 1;
        }

        self.read_buffer.clear();
        self.write_buffer.clear();
        self.keepalive_at = None;
        self.sent_hello = false;
    }

    #[inline]
    fn emit(&self, kind: EventKind) {
        self.events.emit(&ConnectionEvent {
            synced: self.synced,
            kind,
        });
    }

    /// Recomputes the wanted poll set and announces a change to the worker.
    fn update_poll(&mut self) {
        let (readable, writable) = match (&self.stream, self.phase) {
            (Some(_), Phase::Connecting) => (false, true),
            (Some(_), _) => (true, !self.write_buffer.is_empty()),
            (None, _) => (false, false),
        };

        let wakeup = match (self.retry_at, self.keepalive_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        let plan = PollPlan {
            generation: self.socket_generation,
            readable,
            writable,
            wakeup,
        };

        if plan != self.poll_plan {
            self.poll_plan = plan;
            self.emit(EventKind::PollChanged(plan));
        }
    }
}

/// Returns the offset just past the first `\r\n\r\n`, if present.
fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Measures the frame at the head of `data`: (header length, payload
/// length). `Wait` when the header itself is incomplete.
fn frame_extent(data: &[u8]) -> NetResult<(usize, usize)> {
    if data.len() < 2 {
        return Err(NetError::Wait);
    }

    if data[0] != 0x82 {
        return Err(NetError::Fatal(ErrorKind::BadData));
    }

    // A masked server frame is a protocol violation.
    if data[1] & 0x80 != 0 {
        return Err(NetError::Fatal(ErrorKind::BadData));
    }

    let (header_len, payload_len) = match data[1] {
        126 => {
            if data.len() < 4 {
                return Err(NetError::Wait);
            }

            (4, u16::from_be_bytes([data[2], data[3]]) as usize)
        }
        127 => {
            if data.len() < 10 {
                return Err(NetError::Wait);
            }

            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&data[2..10]);

            let len = u64::from_be_bytes(len_bytes);

            if len > MAX_PAYLOAD_SIZE as u64 {
                return Err(NetError::Fatal(ErrorKind::BadData));
            }

            (10, len as usize)
        }
        len => (2, len as usize),
    };

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(NetError::Fatal(ErrorKind::BadData));
    }

    Ok((header_len, payload_len))
}
