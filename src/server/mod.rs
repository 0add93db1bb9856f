mod engine;
mod remix;
mod session;
mod table;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time;

use log::{debug, info, warn};

use super::socket;
use super::timer;
use super::Error;

pub use engine::MIX_CAPACITY;
pub use session::SessionId;

use engine::{HostContext, ServerCore};
use session::FifoLimits;

const SOCKET_POLLING_KEY: usize = 0;
const LISTENER_POLLING_KEY: usize = 1;
const CONTROL_POLLING_KEY_BASE: usize = 2;

const REPORT_INTERVAL_MS: u64 = 1000;
const LIVENESS_INTERVAL_MS: u64 = 1000;

const FIFO_SIZE_DEFAULT: usize = 10560;
const BUF_LEN_DEFAULT: usize = 10;
const TX_INTERVAL_DEFAULT_MS: u64 = 5;

const CONTROL_READ_SIZE: usize = 512;

// Control output a client may leave unread before its session is evicted
const CONTROL_PENDING_MAX: usize = 65536;

/// Configuration for a [`Server`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Port for both the TCP control listener and the UDP data socket. Zero picks an ephemeral
    /// TCP port, and UDP binds the same number.
    ///
    /// Default value: 7620
    pub port: u16,

    /// Capacity of each client's FIFO, in bytes.
    ///
    /// Minimum value: 1 \
    /// Default value: 10,560
    pub fifo_size: usize,

    /// A client stops contributing to the mix once its FIFO drains to this many bytes.
    ///
    /// Default value: 0
    pub fifo_low_watermark: usize,

    /// A client starts contributing to the mix once its FIFO fills to this many bytes.
    ///
    /// Minimum value: `fifo_low_watermark` \
    /// Maximum value: `fifo_size` \
    /// Default value: `fifo_size`
    pub fifo_high_watermark: usize,

    /// Number of recent mixes retained for retransmission.
    ///
    /// Minimum value: 1 \
    /// Default value: 10
    pub buf_len: usize,

    /// Interval between mixes, in milliseconds. Each mix covers this much audio.
    ///
    /// Minimum value: 1 \
    /// Default value: 5
    pub tx_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: super::DEFAULT_PORT,
            fifo_size: FIFO_SIZE_DEFAULT,
            fifo_low_watermark: 0,
            fifo_high_watermark: FIFO_SIZE_DEFAULT,
            buf_len: BUF_LEN_DEFAULT,
            tx_interval_ms: TX_INTERVAL_DEFAULT_MS,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.fifo_size == 0 {
            return Err(Error::Config("fifo_size == 0".into()));
        }
        if self.fifo_low_watermark > self.fifo_high_watermark {
            return Err(Error::Config(format!(
                "fifo_low_watermark ({}) > fifo_high_watermark ({})",
                self.fifo_low_watermark, self.fifo_high_watermark
            )));
        }
        if self.fifo_high_watermark > self.fifo_size {
            return Err(Error::Config(format!(
                "fifo_high_watermark ({}) > fifo_size ({})",
                self.fifo_high_watermark, self.fifo_size
            )));
        }
        if self.buf_len == 0 {
            return Err(Error::Config("buf_len == 0".into()));
        }
        if self.tx_interval_ms == 0 {
            return Err(Error::Config("tx_interval_ms == 0".into()));
        }

        Ok(())
    }

    fn limits(&self) -> FifoLimits {
        FifoLimits {
            size: self.fifo_size,
            low_watermark: self.fifo_low_watermark,
            high_watermark: self.fifo_high_watermark,
        }
    }
}

struct ControlStream {
    stream: net::TcpStream,
    // Bytes not yet accepted by the stream
    pending: VecDeque<u8>,
    // Set once pending output would exceed CONTROL_PENDING_MAX
    overflowed: bool,
}

impl ControlStream {
    fn new(stream: net::TcpStream, pending: VecDeque<u8>) -> Self {
        Self {
            stream,
            pending,
            overflowed: false,
        }
    }

    fn queue(&mut self, bytes: &[u8]) {
        if self.pending.len() + bytes.len() > CONTROL_PENDING_MAX {
            self.overflowed = true;
            return;
        }

        self.pending.extend(bytes.iter().copied());
    }

    /// Writes as much pending output as the stream will take without blocking.
    fn flush(&mut self) -> io::Result<()> {
        if self.overflowed {
            return Err(io::Error::other("control output is not being read"));
        }

        while !self.pending.is_empty() {
            let (front, _) = self.pending.as_slices();

            match self.stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => (),
                    _ => return Err(err),
                },
            }
        }

        Ok(())
    }

    /// Reads and discards whatever the client has sent. Returns false once the stream has closed.
    fn drain_input(&mut self, buffer: &mut [u8]) -> io::Result<bool> {
        loop {
            match self.stream.read(buffer) {
                Ok(0) => return Ok(false),
                Ok(n) => debug!("ignoring {} bytes of control input", n),
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(true),
                    io::ErrorKind::Interrupted => (),
                    _ => return Err(err),
                },
            }
        }
    }
}

fn control_polling_key(id: SessionId) -> usize {
    CONTROL_POLLING_KEY_BASE + id as usize
}

struct ServerHost<'a> {
    socket_tx: &'a socket::SocketTx,
    controls: &'a mut HashMap<SessionId, ControlStream>,
    poller: &'a polling::Poller,
}

impl<'a> HostContext for ServerHost<'a> {
    fn send_datagram(&mut self, datagram: &[u8], addr: &net::SocketAddr) {
        if let Err(err) = self.socket_tx.send(datagram, addr) {
            warn!("failed to send datagram to {}: {}", addr, err);
        }
    }

    fn send_control(&mut self, id: SessionId, bytes: &[u8]) {
        if let Some(control) = self.controls.get_mut(&id) {
            control.queue(bytes);
        }
    }

    fn on_evict(&mut self, id: SessionId) {
        if let Some(control) = self.controls.remove(&id) {
            let _ = self.poller.delete(&control.stream);
        }
    }
}

// Binds the listener and the UDP socket to the same port on `ip`. The IPv6 wildcard also
// accepts IPv4 where the host allows dual-stack sockets.
fn bind_sockets(
    ip: net::IpAddr,
    port: u16,
) -> io::Result<(net::TcpListener, socket::SocketTx, socket::SocketRx)> {
    let listener = net::TcpListener::bind((ip, port))?;

    let port = listener.local_addr()?.port();

    let (socket_tx, socket_rx) = socket::new((ip, port), socket::FRAME_SIZE_MAX)?;

    Ok((listener, socket_tx, socket_rx))
}

fn can_fall_back(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

/// A relay server. Accepts control connections, receives uploads, and broadcasts mixes.
pub struct Server {
    // Protocol state
    core: ServerCore,
    // Socket send handle
    socket_tx: socket::SocketTx,
    // Socket receive handle
    socket_rx: socket::SocketRx,
    // Accepts control connections
    listener: net::TcpListener,
    // Control connection of each session
    controls: HashMap<SessionId, ControlStream>,
    // Readiness of all of the above
    poller: polling::Poller,
    poller_events: polling::Events,
    // Source of integer timestamps
    epoch: timer::Epoch,
    report_timer: timer::PeriodicTimer,
    liveness_timer: timer::PeriodicTimer,
    mix_timer: timer::PeriodicTimer,
    // Always-allocated control read buffer
    control_buffer: Box<[u8]>,
}

impl Server {
    /// Binds the TCP listener and UDP socket, and returns a new server object. Errors encountered
    /// during socket initialization are forwarded to the caller.
    pub fn bind(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let (listener, socket_tx, socket_rx) =
            match bind_sockets(net::Ipv6Addr::UNSPECIFIED.into(), config.port) {
                Ok(sockets) => sockets,
                Err(err) if can_fall_back(&err) => {
                    debug!("ipv6 unavailable ({}), binding ipv4 only", err);
                    bind_sockets(net::Ipv4Addr::UNSPECIFIED.into(), config.port)?
                }
                Err(err) => return Err(err.into()),
            };

        listener.set_nonblocking(true)?;

        let port = listener.local_addr()?.port();

        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(socket_rx.source(), polling::Event::readable(SOCKET_POLLING_KEY))?;
            poller.add(&listener, polling::Event::readable(LISTENER_POLLING_KEY))?;
        }

        let epoch = timer::Epoch::new();
        let now_ms = epoch.time_now_ms();

        info!("listening on port {}", port);

        Ok(Self {
            core: ServerCore::new(config.limits(), config.buf_len, config.tx_interval_ms),
            socket_tx,
            socket_rx,
            listener,
            controls: HashMap::new(),
            poller,
            poller_events: polling::Events::new(),
            epoch,
            report_timer: timer::PeriodicTimer::new(REPORT_INTERVAL_MS, now_ms),
            liveness_timer: timer::PeriodicTimer::new(LIVENESS_INTERVAL_MS, now_ms),
            mix_timer: timer::PeriodicTimer::new(config.tx_interval_ms, now_ms),
            control_buffer: vec![0; CONTROL_READ_SIZE].into_boxed_slice(),
        })
    }

    /// Runs the server until an unrecoverable error occurs.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            self.step(None)?;
        }
    }

    /// Runs the server until `stop` is set. The flag is checked at least every 100 ms.
    pub fn run_until(&mut self, stop: &AtomicBool) -> Result<(), Error> {
        while !stop.load(Ordering::Relaxed) {
            self.step(Some(time::Duration::from_millis(100)))?;
        }

        Ok(())
    }

    /// Waits for socket activity or the next timer, for at most `max_wait`, and processes
    /// whatever is ready.
    pub fn step(&mut self, max_wait: Option<time::Duration>) -> Result<(), Error> {
        self.rearm()?;

        let now_ms = self.epoch.time_now_ms();

        let timers = [&self.report_timer, &self.liveness_timer, &self.mix_timer];
        let timeout = match (timer::next_timeout(timers, now_ms), max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        self.poller_events.clear();

        match self.poller.wait(&mut self.poller_events, timeout) {
            Ok(_) => (),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err.into()),
        }

        let ready = self.poller_events.iter().collect::<Vec<_>>();

        for event in ready {
            match event.key {
                SOCKET_POLLING_KEY => self.handle_datagrams(),
                LISTENER_POLLING_KEY => self.accept_connections(),
                key => {
                    let id = (key - CONTROL_POLLING_KEY_BASE) as SessionId;
                    if event.readable {
                        self.handle_control_input(id);
                    }
                }
            }
        }

        self.handle_timers();

        self.flush_controls();

        Ok(())
    }

    fn host(&mut self) -> (&mut ServerCore, ServerHost<'_>) {
        let host = ServerHost {
            socket_tx: &self.socket_tx,
            controls: &mut self.controls,
            poller: &self.poller,
        };

        (&mut self.core, host)
    }

    fn rearm(&mut self) -> io::Result<()> {
        self.poller.modify(
            self.socket_rx.source(),
            polling::Event::readable(SOCKET_POLLING_KEY),
        )?;
        self.poller
            .modify(&self.listener, polling::Event::readable(LISTENER_POLLING_KEY))?;

        for (&id, control) in self.controls.iter() {
            let key = control_polling_key(id);

            let interest = if control.pending.is_empty() {
                polling::Event::readable(key)
            } else {
                polling::Event::all(key)
            };

            self.poller.modify(&control.stream, interest)?;
        }

        Ok(())
    }

    /// Reads and processes as many datagrams as possible without blocking.
    fn handle_datagrams(&mut self) {
        let Self {
            core,
            socket_tx,
            socket_rx,
            controls,
            poller,
            ..
        } = self;

        let ref mut host = ServerHost {
            socket_tx,
            controls,
            poller,
        };

        loop {
            match socket_rx.try_read_frame() {
                Ok(Some((datagram, sender_addr))) => {
                    core.handle_datagram(datagram, &sender_addr, host);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("udp receive error: {}", err);
                    break;
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, control_addr)) => {
                    let control_addr = socket::canonical_addr(control_addr);

                    if let Err(err) = self.open_control(stream, control_addr) {
                        warn!("failed to set up connection from {}: {}", control_addr, err);
                    }
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => (),
                    _ => {
                        warn!("accept error: {}", err);
                        break;
                    }
                },
            }
        }
    }

    fn open_control(
        &mut self,
        stream: net::TcpStream,
        control_addr: net::SocketAddr,
    ) -> io::Result<()> {
        stream.set_nonblocking(true)?;

        let id = self.core.open_session(control_addr);

        let mut pending = VecDeque::new();
        pending.extend(format!("CLIENT {}\n", id).bytes());

        let key = control_polling_key(id);

        let registered = unsafe { self.poller.add(&stream, polling::Event::all(key)) };

        if let Err(err) = registered {
            let (core, mut host) = self.host();
            core.close_session(id, &mut host);
            return Err(err);
        }

        self.controls.insert(id, ControlStream::new(stream, pending));

        Ok(())
    }

    fn handle_control_input(&mut self, id: SessionId) {
        let open = match self.controls.get_mut(&id) {
            Some(control) => control.drain_input(&mut self.control_buffer),
            None => return,
        };

        match open {
            Ok(true) => (),
            Ok(false) => {
                info!("control connection of session {} closed", id);
                let (core, mut host) = self.host();
                core.close_session(id, &mut host);
            }
            Err(err) => {
                warn!("control connection of session {} failed: {}", id, err);
                let (core, mut host) = self.host();
                core.close_session(id, &mut host);
            }
        }
    }

    fn handle_timers(&mut self) {
        let now_ms = self.epoch.time_now_ms();

        while self.mix_timer.poll(now_ms) {
            let (core, mut host) = self.host();
            core.mix_and_send(&mut host);
        }

        if self.report_timer.poll(now_ms) {
            let (core, mut host) = self.host();
            core.report(&mut host);
        }

        if self.liveness_timer.poll(now_ms) {
            let (core, mut host) = self.host();
            core.evict_stale(&mut host);
        }
    }

    fn flush_controls(&mut self) {
        let failed = self
            .controls
            .iter_mut()
            .filter_map(|(&id, control)| match control.flush() {
                Ok(()) => None,
                Err(err) => {
                    warn!("control connection of session {} failed: {}", id, err);
                    Some(id)
                }
            })
            .collect::<Vec<_>>();

        for id in failed {
            let (core, mut host) = self.host();
            core.close_session(id, &mut host);
        }
    }

    /// Returns the local address of the internal UDP socket. The TCP listener shares its port.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    /// Returns the number of sessions in the session table.
    pub fn session_count(&self) -> usize {
        self.core.sessions().len()
    }

    /// Returns the number of sessions which have bound a UDP endpoint.
    pub fn bound_session_count(&self) -> usize {
        self.core.sessions().bound_endpoint_count()
    }

    /// Returns the number of the most recent mix.
    pub fn remix_nr(&self) -> u32 {
        self.core.remixes().newest_nr()
    }
}
