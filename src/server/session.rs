use std::collections::VecDeque;
use std::fmt;
use std::net;

pub type SessionId = u32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FifoState {
    Filling,
    Active,
}

/// FIFO capacity and watermarks, shared by every session.
#[derive(Clone, Copy, Debug)]
pub struct FifoLimits {
    pub size: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

/// Why an upload was not accepted.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("upload with bad nr {nr}, expected {expected}")]
    Sequence { nr: u32, expected: u32 },
    #[error("upload of {size} bytes exceeds window {window}")]
    Window { size: usize, window: usize },
}

/// Server-side state of one client.
pub struct Session {
    // Assigned on TCP accept, never reused
    id: SessionId,
    // Remote address of the control connection
    control_addr: net::SocketAddr,
    // Bound by the first valid UDP CLIENT message
    endpoint: Option<net::SocketAddr>,
    // Number of uploads accepted so far, and the number of the next expected upload
    ack: u32,
    // Received audio not yet mixed
    fifo: VecDeque<u8>,
    fifo_state: FifoState,
    limits: FifoLimits,
    // Watermarks since the last report
    fifo_min: usize,
    fifo_max: usize,
    // Set by any datagram from the endpoint, cleared by the liveness check
    udp_alive: bool,
}

impl Session {
    pub fn new(id: SessionId, control_addr: net::SocketAddr, limits: FifoLimits) -> Self {
        Self {
            id,
            control_addr,
            endpoint: None,
            ack: 0,
            fifo: VecDeque::new(),
            fifo_state: FifoState::Filling,
            limits,
            fifo_min: 0,
            fifo_max: 0,
            udp_alive: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn endpoint(&self) -> Option<&net::SocketAddr> {
        self.endpoint.as_ref()
    }

    pub fn uses_udp(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn is_active(&self) -> bool {
        self.fifo_state == FifoState::Active
    }

    /// Free FIFO space, as advertised to the client.
    pub fn window(&self) -> usize {
        self.limits.size.saturating_sub(self.fifo.len())
    }

    /// The window as it appears on the wire.
    pub fn window_u32(&self) -> u32 {
        u32::try_from(self.window()).unwrap_or(u32::MAX)
    }

    pub fn bind_endpoint(&mut self, endpoint: net::SocketAddr) {
        self.endpoint = Some(endpoint);
        self.udp_alive = true;
    }

    pub fn mark_alive(&mut self) {
        self.udp_alive = true;
    }

    /// Clears the liveness flag, returning its previous value.
    pub fn take_alive(&mut self) -> bool {
        std::mem::replace(&mut self.udp_alive, false)
    }

    /// Appends `payload` to the FIFO if `nr` is the expected upload number and the payload fits
    /// in the window. Activates the session once the high watermark is reached.
    pub fn upload(&mut self, nr: u32, payload: &[u8]) -> Result<(), Rejection> {
        if nr != self.ack {
            return Err(Rejection::Sequence {
                nr,
                expected: self.ack,
            });
        }

        let window = self.window();

        if payload.len() > window {
            return Err(Rejection::Window {
                size: payload.len(),
                window,
            });
        }

        self.ack = self.ack.wrapping_add(1);
        self.fifo.extend(payload.iter().copied());

        self.fifo_max = self.fifo_max.max(self.fifo.len());

        if self.fifo.len() >= self.limits.high_watermark {
            self.fifo_state = FifoState::Active;
        }

        Ok(())
    }

    /// Contiguous view of the buffered audio, for the mixer.
    pub fn fifo_data(&mut self) -> &[u8] {
        self.fifo.make_contiguous()
    }

    /// Drains up to `count` bytes from the front of the FIFO. Deactivates the session once the
    /// low watermark is reached.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.fifo.len());

        self.fifo.drain(..count);

        self.fifo_min = self.fifo_min.min(self.fifo.len());

        if self.fifo.len() <= self.limits.low_watermark {
            self.fifo_state = FifoState::Filling;
        }
    }

    pub fn reset_fifo_stats(&mut self) {
        self.fifo_min = self.fifo.len();
        self.fifo_max = self.fifo.len();
    }

    /// Writes this session's report line.
    pub fn write_info<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(
            out,
            "{} FIFO: {}/{} (min. {}, max. {})",
            self.control_addr,
            self.fifo.len(),
            self.limits.size,
            self.fifo_min,
            self.fifo_max
        )
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("ack", &self.ack)
            .field("fifo_len", &self.fifo.len())
            .field("fifo_state", &self.fifo_state)
            .finish()
    }
}
