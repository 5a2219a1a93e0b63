use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level error plumbing for the engine internals. `Wait` means the
/// operation cannot make progress yet (short read, full buffer, would
/// block); `Fatal` carries the typed error kinds that reach the host.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// Malformed frame or payload.
    BadData,
    /// The remote end closed the connection.
    ConnectionClosed,
    /// The server rejected the person id carried by a RECONNECT.
    BadPlayerId,
    /// The server rejected the conversation id carried by a JOIN_GAME.
    BadConversationId,
    /// The conversation has no free seats.
    ConversationFull,
    Io(io::ErrorKind),
}

impl ErrorKind {
    /// True for errors that end the current conversation rather than the
    /// current socket. The game-state layer reacts to these by scheduling a
    /// reset.
    #[inline]
    pub fn is_conversation_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::BadPlayerId | ErrorKind::BadConversationId | ErrorKind::ConversationFull
        )
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}
