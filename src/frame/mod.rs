pub mod serial;

/// A protocol message, as carried by a single UDP datagram or a TCP control line.
///
/// Every message is a newline-terminated ASCII header. `Upload` and `Data` carry a raw payload
/// running from just past the newline to the end of the datagram.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Message<'a> {
    /// `CLIENT <id>`: id assignment (TCP, server to client) and endpoint binding (UDP).
    Client { id: u32 },
    /// `UPLOAD <nr>`: a chunk of client audio.
    Upload { nr: u32, payload: &'a [u8] },
    /// `RETRANSMIT <nr>`: request for every retained remix starting at `nr`.
    Retransmit { nr: u32 },
    /// `KEEPALIVE`: liveness only.
    Keepalive,
    /// `ACK <ack> <win>`: upload acknowledgement and advertised window.
    Ack { ack: u32, win: u32 },
    /// `DATA <nr> <ack> <win>`: one numbered remix, with piggybacked upload state.
    Data {
        nr: u32,
        ack: u32,
        win: u32,
        payload: &'a [u8],
    },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageKind {
    Client,
    Upload,
    Retransmit,
    Keepalive,
    Ack,
    Data,
}

/// Reasons a datagram could not be decoded. None of these are fatal; the datagram is dropped.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("no newline in datagram")]
    MissingNewline,
    #[error("header is not ASCII")]
    BadHeader,
    #[error("unknown message kind")]
    UnknownKind,
    #[error("malformed {0:?} header")]
    BadField(MessageKind),
}

impl<'a> Message<'a> {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Client { .. } => MessageKind::Client,
            Self::Upload { .. } => MessageKind::Upload,
            Self::Retransmit { .. } => MessageKind::Retransmit,
            Self::Keepalive => MessageKind::Keepalive,
            Self::Ack { .. } => MessageKind::Ack,
            Self::Data { .. } => MessageKind::Data,
        }
    }
}
