mod flow;

use std::io;
use std::io::{Read, Write};
use std::net;
use std::net::ToSocketAddrs;
use std::os::fd::{AsFd, AsRawFd};

use log::{debug, info, warn};

use super::frame::serial;
use super::frame::Message;
use super::socket;
use super::timer;
use super::Error;

pub use flow::INPUT_BACKLOG_MAX;

use flow::{FlowController, HostContext};

const SOCKET_POLLING_KEY: usize = 0;
const CONTROL_POLLING_KEY: usize = 1;
const INPUT_POLLING_KEY: usize = 2;

const KEEPALIVE_INTERVAL_MS: u64 = 100;
const LIVENESS_INTERVAL_MS: u64 = 1000;

const RETRANSMIT_LIMIT_DEFAULT: u32 = 10;

const INPUT_READ_SIZE: usize = 10000;
const CONTROL_READ_SIZE: usize = 4096;

// Longest acceptable id line
const ID_LINE_MAX: usize = 64;

/// Configuration for a [`Client`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Host name or address of the server.
    ///
    /// Default value: `localhost`
    pub server_name: String,

    /// Port of the server's TCP listener and UDP socket.
    ///
    /// Default value: 7620
    pub port: u16,

    /// A mix at most this far ahead of the one expected causes the missing ones to be requested
    /// again. Mixes further ahead are played, and the missing ones given up on.
    ///
    /// Default value: 10
    pub retransmit_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: "localhost".into(),
            port: super::DEFAULT_PORT,
            retransmit_limit: RETRANSMIT_LIMIT_DEFAULT,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.server_name.is_empty() {
            return Err(Error::Config("server_name is empty".into()));
        }

        Ok(())
    }
}

struct ClientHost<'a, O> {
    socket_tx: &'a socket::ConnectedSocketTx,
    output: &'a mut O,
}

impl<'a, O> HostContext for ClientHost<'a, O>
where
    O: Write,
{
    fn send_datagram(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.socket_tx.send(datagram)
    }

    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.write_all(bytes)?;
        self.output.flush()
    }
}

/// A connection to a relay server.
pub struct Client {
    // Upload and download state
    flow: FlowController,
    // Socket send handle
    socket_tx: socket::ConnectedSocketTx,
    // Socket receive handle
    socket_rx: socket::ConnectedSocketRx,
    // Carries the id, then reports
    control: net::TcpStream,
    // Partial id line
    control_pending: Vec<u8>,
    // Assigned by the server over the control connection
    id: Option<u32>,
    // Set by any datagram from the server, cleared by the liveness check
    udp_active: bool,
    // Readiness of sockets and input
    poller: polling::Poller,
    poller_events: polling::Events,
    // Input that cannot be polled (e.g. a regular file) is read whenever wanted
    input_pollable: bool,
    // Source of integer timestamps
    epoch: timer::Epoch,
    keepalive_timer: timer::PeriodicTimer,
    liveness_timer: timer::PeriodicTimer,
    // Always-allocated read buffers
    input_buffer: Box<[u8]>,
    control_buffer: Box<[u8]>,
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn parse_id_line(line: &[u8]) -> Result<u32, Error> {
    let text = String::from_utf8_lossy(line);
    let mut tokens = text.split_whitespace();

    match (tokens.next(), tokens.next().map(str::parse::<u32>), tokens.next()) {
        (Some("CLIENT"), Some(Ok(id)), None) => Ok(id),
        _ => Err(Error::Handshake(text.trim_end().to_string())),
    }
}

impl Client {
    /// Connects the control channel to the server and creates a UDP socket for it. The id
    /// exchange happens in [`Client::run`].
    pub fn connect(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let host = format!("{}:{}", config.server_name, config.port);

        info!("connecting to {}...", host);

        let addrs = (config.server_name.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|err| {
                warn!("failed to resolve {}: {}", host, err);
                Error::Resolve(host.clone())
            })?;

        let mut last_err = None;
        let mut connected = None;

        for addr in addrs {
            match net::TcpStream::connect(addr) {
                Ok(stream) => {
                    connected = Some((stream, addr));
                    break;
                }
                Err(err) => {
                    debug!("failed to connect to {}: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }

        let (control, server_addr) = match (connected, last_err) {
            (Some(connected), _) => connected,
            (None, Some(err)) => return Err(err.into()),
            (None, None) => return Err(Error::Resolve(host)),
        };

        info!("connection established with {}", server_addr);

        control.set_nonblocking(true)?;

        let (socket_tx, socket_rx) = socket::new_connected(
            socket::unspecified_for(&server_addr),
            server_addr,
            socket::FRAME_SIZE_MAX,
        )?;

        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(socket_rx.source(), polling::Event::readable(SOCKET_POLLING_KEY))?;
            poller.add(&control, polling::Event::readable(CONTROL_POLLING_KEY))?;
        }

        let epoch = timer::Epoch::new();
        let now_ms = epoch.time_now_ms();

        Ok(Self {
            flow: FlowController::new(config.retransmit_limit),
            socket_tx,
            socket_rx,
            control,
            control_pending: Vec::new(),
            id: None,
            udp_active: false,
            poller,
            poller_events: polling::Events::new(),
            input_pollable: true,
            epoch,
            keepalive_timer: timer::PeriodicTimer::new(KEEPALIVE_INTERVAL_MS, now_ms),
            liveness_timer: timer::PeriodicTimer::new(LIVENESS_INTERVAL_MS, now_ms),
            input_buffer: vec![0; INPUT_READ_SIZE].into_boxed_slice(),
            control_buffer: vec![0; CONTROL_READ_SIZE].into_boxed_slice(),
        })
    }

    /// Uploads `input` and plays mixes into `output` until the connection fails. End of input
    /// is not an error; mixes continue to be played.
    pub fn run<I, O>(&mut self, input: &mut I, output: &mut O) -> Result<(), Error>
    where
        I: Read + AsFd + AsRawFd,
        O: Write,
    {
        let registered = unsafe {
            self.poller
                .add(&*input, polling::Event::none(INPUT_POLLING_KEY))
        };

        match registered {
            Ok(()) => self.input_pollable = true,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                debug!("input is not pollable, reading on demand");
                self.input_pollable = false;
            }
            Err(err) => return Err(err.into()),
        }

        let result = self.run_loop(input, output);

        if self.input_pollable {
            let _ = self.poller.delete(&*input);
        }

        return result;
    }

    fn run_loop<I, O>(&mut self, input: &mut I, output: &mut O) -> Result<(), Error>
    where
        I: Read + AsFd,
        O: Write,
    {
        loop {
            self.rearm(&*input)?;

            let now_ms = self.epoch.time_now_ms();

            let timers = [&self.keepalive_timer, &self.liveness_timer];
            let mut timeout = timer::next_timeout(timers, now_ms);

            if !self.input_pollable && self.flow.wants_input() {
                timeout = Some(std::time::Duration::ZERO);
            }

            self.poller_events.clear();

            match self.poller.wait(&mut self.poller_events, timeout) {
                Ok(_) => (),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => return Err(err.into()),
            }

            let ready = self.poller_events.iter().collect::<Vec<_>>();

            for event in ready {
                match event.key {
                    SOCKET_POLLING_KEY => self.handle_datagrams(output)?,
                    CONTROL_POLLING_KEY => self.handle_control()?,
                    INPUT_POLLING_KEY => self.handle_input(input, output)?,
                    _ => (),
                }
            }

            if !self.input_pollable {
                self.handle_input(input, output)?;
            }

            self.handle_timers()?;
        }
    }

    fn rearm<I>(&mut self, input: &I) -> io::Result<()>
    where
        I: AsFd,
    {
        self.poller.modify(
            self.socket_rx.source(),
            polling::Event::readable(SOCKET_POLLING_KEY),
        )?;
        self.poller
            .modify(&self.control, polling::Event::readable(CONTROL_POLLING_KEY))?;

        if self.input_pollable {
            let interest = if self.flow.wants_input() {
                polling::Event::readable(INPUT_POLLING_KEY)
            } else {
                polling::Event::none(INPUT_POLLING_KEY)
            };

            self.poller.modify(input, interest)?;
        }

        Ok(())
    }

    /// Reads and processes as many datagrams as possible without blocking.
    fn handle_datagrams<O>(&mut self, output: &mut O) -> Result<(), Error>
    where
        O: Write,
    {
        let ref mut host = ClientHost {
            socket_tx: &self.socket_tx,
            output,
        };

        loop {
            let datagram = match self.socket_rx.try_read_frame() {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(err) => {
                    warn!("udp receive error: {}", err);
                    break;
                }
            };

            self.udp_active = true;

            match serial::read(datagram) {
                Ok(Message::Ack { ack, win }) => {
                    self.flow.handle_ack(ack, win, false, host)?;
                }
                Ok(Message::Data {
                    nr,
                    ack,
                    win,
                    payload,
                }) => {
                    self.flow.handle_data(nr, ack, win, payload, host)?;
                }
                Ok(message) => {
                    warn!("unexpected {:?} from server", message.kind());
                }
                Err(err) => {
                    warn!("bad datagram from server: {}", err);
                }
            }
        }

        Ok(())
    }

    fn handle_control(&mut self) -> Result<(), Error> {
        loop {
            let n = match self.control.read(&mut self.control_buffer) {
                Ok(0) => return Err(Error::ControlClosed),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };

            if self.id.is_some() {
                // Reports are passed through as they are
                let _ = io::stderr().write_all(&self.control_buffer[..n]);
                continue;
            }

            self.control_pending
                .extend_from_slice(&self.control_buffer[..n]);

            let Some(newline) = self.control_pending.iter().position(|&b| b == b'\n') else {
                if self.control_pending.len() > ID_LINE_MAX {
                    let text = String::from_utf8_lossy(&self.control_pending).into_owned();
                    return Err(Error::Handshake(text));
                }
                continue;
            };

            let id = parse_id_line(&self.control_pending[..newline])?;

            info!("received id {}", id);

            self.id = Some(id);

            self.socket_tx
                .send(&serial::write_boxed(&Message::Client { id }))?;

            let rest = self.control_pending.split_off(newline + 1);

            if !rest.is_empty() {
                let _ = io::stderr().write_all(&rest);
            }

            self.control_pending = Vec::new();
        }
    }

    fn handle_input<I, O>(&mut self, input: &mut I, output: &mut O) -> Result<(), Error>
    where
        I: Read,
        O: Write,
    {
        if !self.flow.wants_input() {
            return Ok(());
        }

        let n = match input.read(&mut self.input_buffer) {
            Ok(n) => n,
            Err(err) if is_transient(&err) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if n == 0 {
            info!("end of input");
            self.flow.finish_input();
            return Ok(());
        }

        let ref mut host = ClientHost {
            socket_tx: &self.socket_tx,
            output,
        };

        self.flow.push_input(&self.input_buffer[..n], host)?;

        Ok(())
    }

    fn handle_timers(&mut self) -> Result<(), Error> {
        let now_ms = self.epoch.time_now_ms();

        if self.keepalive_timer.poll(now_ms) {
            let keepalive = serial::write_boxed(&Message::Keepalive);

            if let Err(err) = self.socket_tx.send(&keepalive) {
                warn!("failed to send keepalive: {}", err);
            }
        }

        if self.liveness_timer.poll(now_ms) {
            if !self.udp_active {
                return Err(Error::PeerTimeout(LIVENESS_INTERVAL_MS));
            }

            self.udp_active = false;
        }

        Ok(())
    }

    /// The id assigned by the server, once received.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    /// Returns the address of the server.
    pub fn server_addr(&self) -> net::SocketAddr {
        self.socket_rx.peer_addr()
    }
}
