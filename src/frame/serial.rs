use std::io::Write;
use std::str::SplitAsciiWhitespace;

use super::*;

const KEYWORD_CLIENT: &str = "CLIENT";
const KEYWORD_UPLOAD: &str = "UPLOAD";
const KEYWORD_RETRANSMIT: &str = "RETRANSMIT";
const KEYWORD_KEEPALIVE: &str = "KEEPALIVE";
const KEYWORD_ACK: &str = "ACK";
const KEYWORD_DATA: &str = "DATA";

/// Longest header any message kind can produce: `DATA` plus three `u32` fields.
pub const HEADER_SIZE_MAX: usize = 4 + 3 * 11 + 1;

struct Fields<'h> {
    tokens: SplitAsciiWhitespace<'h>,
    kind: MessageKind,
}

impl<'h> Fields<'h> {
    fn new(tokens: SplitAsciiWhitespace<'h>, kind: MessageKind) -> Self {
        Self { tokens, kind }
    }

    fn next_u32(&mut self) -> Result<u32, DecodeError> {
        self.tokens
            .next()
            .and_then(|token| token.parse::<u32>().ok())
            .ok_or(DecodeError::BadField(self.kind))
    }

    fn finish(mut self) -> Result<(), DecodeError> {
        match self.tokens.next() {
            None => Ok(()),
            Some(_) => Err(DecodeError::BadField(self.kind)),
        }
    }
}

/// Splits a datagram at its first newline, returning the header (without the newline) and the
/// payload following it.
pub fn split_header(datagram: &[u8]) -> Result<(&str, &[u8]), DecodeError> {
    let newline_idx = datagram
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(DecodeError::MissingNewline)?;

    let header_bytes = &datagram[..newline_idx];

    if !header_bytes.is_ascii() {
        return Err(DecodeError::BadHeader);
    }

    // ASCII is always valid UTF-8
    let header = std::str::from_utf8(header_bytes).map_err(|_| DecodeError::BadHeader)?;

    return Ok((header, &datagram[newline_idx + 1..]));
}

/// Decodes a single datagram. The returned message borrows its payload from `datagram`.
pub fn read(datagram: &[u8]) -> Result<Message<'_>, DecodeError> {
    let (header, payload) = split_header(datagram)?;

    let mut tokens = header.split_ascii_whitespace();

    let keyword = tokens.next().ok_or(DecodeError::UnknownKind)?;

    let message = match keyword {
        KEYWORD_CLIENT => {
            let mut fields = Fields::new(tokens, MessageKind::Client);
            let id = fields.next_u32()?;
            fields.finish()?;

            Message::Client { id }
        }
        KEYWORD_UPLOAD => {
            let mut fields = Fields::new(tokens, MessageKind::Upload);
            let nr = fields.next_u32()?;
            fields.finish()?;

            Message::Upload { nr, payload }
        }
        KEYWORD_RETRANSMIT => {
            let mut fields = Fields::new(tokens, MessageKind::Retransmit);
            let nr = fields.next_u32()?;
            fields.finish()?;

            Message::Retransmit { nr }
        }
        KEYWORD_KEEPALIVE => {
            Fields::new(tokens, MessageKind::Keepalive).finish()?;

            Message::Keepalive
        }
        KEYWORD_ACK => {
            let mut fields = Fields::new(tokens, MessageKind::Ack);
            let ack = fields.next_u32()?;
            let win = fields.next_u32()?;
            fields.finish()?;

            Message::Ack { ack, win }
        }
        KEYWORD_DATA => {
            let mut fields = Fields::new(tokens, MessageKind::Data);
            let nr = fields.next_u32()?;
            let ack = fields.next_u32()?;
            let win = fields.next_u32()?;
            fields.finish()?;

            Message::Data {
                nr,
                ack,
                win,
                payload,
            }
        }
        _ => return Err(DecodeError::UnknownKind),
    };

    return Ok(message);
}

/// Appends the encoded form of `message` to `buf`.
pub fn write(message: &Message, buf: &mut Vec<u8>) {
    // Writes into a Vec are infallible
    let _ = match *message {
        Message::Client { id } => writeln!(buf, "{} {}", KEYWORD_CLIENT, id),
        Message::Upload { nr, .. } => writeln!(buf, "{} {}", KEYWORD_UPLOAD, nr),
        Message::Retransmit { nr } => writeln!(buf, "{} {}", KEYWORD_RETRANSMIT, nr),
        Message::Keepalive => writeln!(buf, "{}", KEYWORD_KEEPALIVE),
        Message::Ack { ack, win } => writeln!(buf, "{} {} {}", KEYWORD_ACK, ack, win),
        Message::Data { nr, ack, win, .. } => {
            writeln!(buf, "{} {} {} {}", KEYWORD_DATA, nr, ack, win)
        }
    };

    match *message {
        Message::Upload { payload, .. } | Message::Data { payload, .. } => {
            buf.extend_from_slice(payload);
        }
        _ => (),
    }
}

pub fn write_boxed(message: &Message) -> Box<[u8]> {
    let payload_len = match *message {
        Message::Upload { payload, .. } | Message::Data { payload, .. } => payload.len(),
        _ => 0,
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE_MAX + payload_len);

    write(message, &mut buf);

    return buf.into_boxed_slice();
}
