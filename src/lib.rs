/*

Campfire relays live audio between a group of clients. Every client uploads raw PCM to a central
server, and the server periodically mixes what it has received and broadcasts the mix back to
everyone.

# Channels

Each client holds two connections to the server:

  TCP  control: the server sends `CLIENT <id>` once, then a human-readable report every second.
  UDP  data:    uploads, acks, mixes and keepalives, all as text-headed datagrams.

A client binds its UDP endpoint by sending `CLIENT <id>` over UDP with the id it received over
TCP. Datagrams from endpoints that have not been bound this way are dropped.

# Upload flow control

The server keeps a FIFO of at most `fifo_size` bytes per client, and an `ack` counter equal to
the number of uploads it has accepted. Every ACK it sends carries `ack` and the window, the free
space in the FIFO:

  ACK <ack> <fifo_size - fifo.len()>

An upload is accepted only if its number equals `ack` and its payload fits in the window. Anything
else is dropped without a reply. The client numbers each upload with `next_ack - 1`, where
`next_ack` is one past the greatest ack it has seen, and sends at most one window's worth of data.

Every mix datagram also carries the recipient's current ack and window:

  DATA <nr> <ack> <win>

so a client waiting on an ACK which was lost will see its stale ack repeated. After two such
duplicates it resends its last upload.

# Buffering

A client's FIFO only contributes to the mix while ACTIVE. It becomes ACTIVE once it has filled to
the high watermark and drops back to FILLING once the mixer drains it to the low watermark:

  FILLING --(len >= high)--> ACTIVE --(len <= low)--> FILLING

The hysteresis keeps a client whose audio arrives in bursts from flickering in and out of the mix.

# Mixing

Every `tx_interval` milliseconds the server sums one interval of samples from every ACTIVE FIFO,
saturating at the i16 range, numbers the result, and sends it to every bound client. The last
`buf_len` mixes are kept so that clients can request them again.

# Download ordering

Clients play mixes as they arrive, without a reorder buffer. A client expecting mix E that
receives a newer mix within `retransmit_limit` asks for everything from E again:

  RETRANSMIT <E>

If the newer mix is further ahead than that, the gap is written off and the new mix is played.

# Liveness

Clients send KEEPALIVE every 100 ms. The server evicts a bound client that has sent nothing for a
full second, and a client gives up on a server which has sent it nothing for a full second.

*/

pub mod client;
mod frame;
pub mod mixer;
pub mod server;
mod socket;
mod timer;

pub use frame::{DecodeError, Message, MessageKind};

/// Decodes a single protocol datagram.
pub fn decode(datagram: &[u8]) -> Result<Message<'_>, DecodeError> {
    frame::serial::read(datagram)
}

/// Encodes a protocol message into a new buffer.
pub fn encode(message: &Message) -> Box<[u8]> {
    frame::serial::write_boxed(message)
}

/// Default port for both the TCP control channel and UDP data.
pub const DEFAULT_PORT: u16 = 7620;

/// Fatal errors. Malformed or out-of-sequence datagrams are never reported this way; they are
/// logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("unexpected control message: {0:?}")]
    Handshake(String),
    #[error("control connection closed")]
    ControlClosed,
    #[error("no datagram from the server within {0} ms")]
    PeerTimeout(u64),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Client = client::Client;
pub type Server = server::Server;
