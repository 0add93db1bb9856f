use std::io;
use std::net;
use std::rc::Rc;

/// Large enough for any UDP payload.
pub const FRAME_SIZE_MAX: usize = 65536;

pub struct SocketTx {
    // Reference to non-blocking server socket
    socket: Rc<net::UdpSocket>,
}

pub struct SocketRx {
    // Reference to non-blocking server socket
    socket: Rc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

pub struct ConnectedSocketTx {
    // Reference to non-blocking client socket
    socket: Rc<net::UdpSocket>,
}

pub struct ConnectedSocketRx {
    // Reference to non-blocking client socket
    socket: Rc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    peer_addr: net::SocketAddr,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
}

impl SocketTx {
    pub fn send(&self, frame: &[u8], addr: &net::SocketAddr) -> io::Result<()> {
        self.socket.send_to(frame, addr).map(|_| ())
    }
}

impl SocketRx {
    /// If a frame can be read from the socket, returns the frame and its sender. Returns
    /// Ok(None) otherwise.
    pub fn try_read_frame(&mut self) -> io::Result<Option<(&[u8], net::SocketAddr)>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((frame_len, sender_addr)) => {
                let frame_bytes = &self.recv_buffer[..frame_len];
                Ok(Some((frame_bytes, sender_addr)))
            }
            Err(err) => match err.kind() {
                // The only acceptable error is WouldBlock, indicating no packet
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            },
        }
    }

    /// The underlying socket, for readiness registration.
    pub fn source(&self) -> &net::UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }
}

pub fn new<A>(bind_address: A, frame_size_max: usize) -> io::Result<(SocketTx, SocketRx)>
where
    A: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;

    let local_addr = socket.local_addr()?;

    let socket_rc = Rc::new(socket);

    let tx = SocketTx {
        socket: Rc::clone(&socket_rc),
    };

    let rx = SocketRx {
        socket: socket_rc,
        local_addr,
        recv_buffer: vec![0; frame_size_max].into_boxed_slice(),
    };

    Ok((tx, rx))
}

impl ConnectedSocketTx {
    pub fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.socket.send(frame).map(|_| ())
    }
}

impl ConnectedSocketRx {
    /// If a frame can be read from the socket, returns the frame. Returns Ok(None) otherwise.
    pub fn try_read_frame(&mut self) -> io::Result<Option<&[u8]>> {
        match self.socket.recv(&mut self.recv_buffer) {
            Ok(frame_len) => {
                let frame_bytes = &self.recv_buffer[..frame_len];
                Ok(Some(frame_bytes))
            }
            Err(err) => match err.kind() {
                // The only acceptable error is WouldBlock, indicating no packet
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            },
        }
    }

    /// The underlying socket, for readiness registration.
    pub fn source(&self) -> &net::UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> net::SocketAddr {
        self.peer_addr
    }
}

pub fn new_connected<A>(
    bind_address: A,
    connect_address: net::SocketAddr,
    frame_size_max: usize,
) -> io::Result<(ConnectedSocketTx, ConnectedSocketRx)>
where
    A: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;
    socket.connect(connect_address)?;

    let local_addr = socket.local_addr()?;
    let peer_addr = socket.peer_addr()?;

    let socket_rc = Rc::new(socket);

    let tx = ConnectedSocketTx {
        socket: Rc::clone(&socket_rc),
    };

    let rx = ConnectedSocketRx {
        socket: socket_rc,
        local_addr,
        peer_addr,
        recv_buffer: vec![0; frame_size_max].into_boxed_slice(),
    };

    Ok((tx, rx))
}

/// Returns the wildcard address of the same family as `addr`, for binding a client socket.
pub fn unspecified_for(addr: &net::SocketAddr) -> net::SocketAddr {
    match addr {
        net::SocketAddr::V4(_) => (net::Ipv4Addr::UNSPECIFIED, 0).into(),
        net::SocketAddr::V6(_) => (net::Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

/// Returns `addr` with an IPv4-mapped IPv6 address replaced by the plain IPv4 address.
pub fn canonical_addr(addr: net::SocketAddr) -> net::SocketAddr {
    match addr {
        net::SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(ip) => (ip, v6.port()).into(),
            None => addr,
        },
        net::SocketAddr::V4(_) => addr,
    }
}
