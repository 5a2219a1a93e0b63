use crate::net::support::{ErrorKind, NetError, NetResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

// Server → client message types. The type byte is the first byte of every
// WebSocket binary payload.
pub const HEADER: u8 = 0x00;
pub const MESSAGE: u8 = 0x01;
pub const N_TILES: u8 = 0x02;
pub const TILE: u8 = 0x03;
pub const PLAYER_NAME: u8 = 0x04;
pub const PLAYER_FLAGS: u8 = 0x05;
pub const PLAYER_SHOUTED: u8 = 0x06;
pub const SYNC: u8 = 0x07;
pub const END: u8 = 0x08;
pub const CONVERSATION_ID: u8 = 0x09;
pub const N_TILES_ALT: u8 = 0x0a;
pub const BAD_PLAYER_ID: u8 = 0x0b;
pub const LANGUAGE: u8 = 0x0c;
pub const CONVERSATION_FULL: u8 = 0x0d;

// Client → server commands. High bit set.
pub const NEW_PLAYER: u8 = 0x80;
pub const RECONNECT: u8 = 0x81;
pub const KEEPALIVE: u8 = 0x83;
pub const LEAVE: u8 = 0x84;
pub const SEND_MESSAGE: u8 = 0x85;
pub const START_TYPING: u8 = 0x86;
pub const STOP_TYPING: u8 = 0x87;
pub const MOVE_TILE: u8 = 0x88;
pub const TURN: u8 = 0x89;
pub const SHOUT: u8 = 0x8a;
pub const SET_N_TILES: u8 = 0x8b;
pub const JOIN_GAME: u8 = 0x8d;
pub const SET_LANGUAGE: u8 = 0x8e;

/// A decoded server-to-client message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ServerMessage {
    Header { person_id: u64, self_num: u8 },
    Message { player_num: u8, text: String },
    NTiles(u8),
    Tile {
        num: u8,
        x: i16,
        y: i16,
        letter: char,
        last_player_moved: u8,
    },
    PlayerName { player_num: u8, name: String },
    PlayerFlags { player_num: u8, flags: u8 },
    PlayerShouted(u8),
    Sync,
    End,
    ConversationId(u64),
    BadPlayerId,
    Language(String),
    ConversationFull,
}

impl ServerMessage {
    /// Parses one complete binary payload. The payload excludes the
    /// WebSocket frame header; byte 0 is the message type.
    pub fn parse(payload: &[u8]) -> NetResult<ServerMessage> {
        if payload.is_empty() {
            return Err(NetError::Fatal(ErrorKind::BadData));
        }

        let mut cursor = Cursor::new(&payload[1..]);

        let message = match payload[0] {
            HEADER => {
                let person_id = cursor.read_u64::<LittleEndian>().map_err(bad_data)?;
                let self_num = cursor.read_u8().map_err(bad_data)?;
                // An optional trailing string may follow. It is accepted and
                // discarded.
                ServerMessage::Header { person_id, self_num }
            }
            MESSAGE => ServerMessage::Message {
                player_num: cursor.read_u8().map_err(bad_data)?,
                text: read_cstring(&mut cursor)?,
            },
            N_TILES | N_TILES_ALT => ServerMessage::NTiles(cursor.read_u8().map_err(bad_data)?),
            TILE => {
                let num = cursor.read_u8().map_err(bad_data)?;
                let x = cursor.read_i16::<LittleEndian>().map_err(bad_data)?;
                let y = cursor.read_i16::<LittleEndian>().map_err(bad_data)?;
                let letter_str = read_cstring(&mut cursor)?;
                let mut chars = letter_str.chars();
                let letter = chars.next().ok_or(NetError::Fatal(ErrorKind::BadData))?;
                if chars.next().is_some() {
                    return Err(NetError::Fatal(ErrorKind::BadData));
                }
                let last_player_moved = cursor.read_u8().map_err(bad_data)?;

                ServerMessage::Tile {
                    num,
                    x,
                    y,
                    letter,
                    last_player_moved,
                }
            }
            PLAYER_NAME => ServerMessage::PlayerName {
                player_num: cursor.read_u8().map_err(bad_data)?,
                name: read_cstring(&mut cursor)?,
            },
            PLAYER_FLAGS => ServerMessage::PlayerFlags {
                player_num: cursor.read_u8().map_err(bad_data)?,
                flags: cursor.read_u8().map_err(bad_data)?,
            },
            PLAYER_SHOUTED => ServerMessage::PlayerShouted(cursor.read_u8().map_err(bad_data)?),
            SYNC => ServerMessage::Sync,
            END => ServerMessage::End,
            CONVERSATION_ID => {
                ServerMessage::ConversationId(cursor.read_u64::<LittleEndian>().map_err(bad_data)?)
            }
            BAD_PLAYER_ID => ServerMessage::BadPlayerId,
            LANGUAGE => ServerMessage::Language(read_cstring(&mut cursor)?),
            CONVERSATION_FULL => ServerMessage::ConversationFull,
            _ => return Err(NetError::Fatal(ErrorKind::BadData)),
        };

        Ok(message)
    }
}

/// A client-to-server command, encoded into a binary payload by
/// [`ClientMessage::encode`].
#[derive(Debug, Eq, PartialEq)]
pub enum ClientMessage<'a> {
    NewPlayer { room: &'a str, player_name: &'a str },
    Reconnect { person_id: u64, n_messages_received: u16 },
    Keepalive,
    Leave,
    SendMessage(&'a str),
    StartTyping,
    StopTyping,
    MoveTile { num: u8, x: i16, y: i16 },
    Turn,
    Shout,
    SetNTiles(u8),
    JoinGame { conversation_id: u64, player_name: &'a str },
    SetLanguage(&'a str),
}

impl<'a> ClientMessage<'a> {
    /// Appends the payload bytes (type byte included) to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            ClientMessage::NewPlayer { room, player_name } => {
                out.push(NEW_PLAYER);
                write_cstring(out, room);
                write_cstring(out, player_name);
            }
            ClientMessage::Reconnect {
                person_id,
                n_messages_received,
            } => {
                out.push(RECONNECT);
                out.write_u64::<LittleEndian>(person_id).unwrap();
                out.write_u16::<LittleEndian>(n_messages_received).unwrap();
            }
            ClientMessage::Keepalive => out.push(KEEPALIVE),
            ClientMessage::Leave => out.push(LEAVE),
            ClientMessage::SendMessage(text) => {
                out.push(SEND_MESSAGE);
                write_cstring(out, text);
            }
            ClientMessage::StartTyping => out.push(START_TYPING),
            ClientMessage::StopTyping => out.push(STOP_TYPING),
            ClientMessage::MoveTile { num, x, y } => {
                out.push(MOVE_TILE);
                out.push(num);
                out.write_i16::<LittleEndian>(x).unwrap();
                out.write_i16::<LittleEndian>(y).unwrap();
            }
            ClientMessage::Turn => out.push(TURN),
            ClientMessage::Shout => out.push(SHOUT),
            ClientMessage::SetNTiles(n) => {
                out.push(SET_N_TILES);
                out.push(n);
            }
            ClientMessage::JoinGame {
                conversation_id,
                player_name,
            } => {
                out.push(JOIN_GAME);
                out.write_u64::<LittleEndian>(conversation_id).unwrap();
                write_cstring(out, player_name);
            }
            ClientMessage::SetLanguage(code) => {
                out.push(SET_LANGUAGE);
                write_cstring(out, code);
            }
        }
    }
}

#[inline]
fn bad_data<E>(_: E) -> NetError {
    NetError::Fatal(ErrorKind::BadData)
}

/// Reads a NUL-terminated UTF-8 string, leaving the cursor just past the
/// terminator.
fn read_cstring(cursor: &mut Cursor<&[u8]>) -> NetResult<String> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();

    let nul = data[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(NetError::Fatal(ErrorKind::BadData))?;

    let text = std::str::from_utf8(&data[start..start + nul])
        .map_err(bad_data)?
        .to_owned();

    cursor.set_position((start + nul + 1) as u64);

    Ok(text)
}

#[inline]
fn write_cstring(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(text.as_bytes());
    out.push(0);
}
