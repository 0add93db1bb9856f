use std::collections::VecDeque;
use std::io;

use log::debug;

use crate::frame::serial;
use crate::frame::Message;

/// Input is requested only while fewer than this many bytes are waiting to be uploaded.
pub const INPUT_BACKLOG_MAX: usize = 50000;

/// Number of stale acks carried by mixes after which the last upload is resent.
const DUPLICATE_ACK_LIMIT: u32 = 2;

pub trait HostContext {
    // Called to send a datagram to the server
    fn send_datagram(&mut self, datagram: &[u8]) -> io::Result<()>;

    // Called to play a mix
    fn write_output(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Client-side upload flow control and download ordering.
pub struct FlowController {
    // Newer mixes at most this far ahead trigger a retransmit request
    retransmit_limit: u32,

    // One past the greatest ack received
    next_ack: u32,
    // Most recently advertised window
    window: u32,
    // Input not yet uploaded
    ready_input: VecDeque<u8>,
    // Set once the input source has ended
    input_finished: bool,
    // Set when another read from the input source is wanted
    input_requested: bool,

    waiting_for_input: bool,
    waiting_for_window: bool,
    waiting_for_ack: bool,
    // Mixes received carrying a stale ack while waiting for an ack
    duplicate_acks: u32,
    // Resent when acks stall
    last_upload: Box<[u8]>,

    // Number of the next mix to play
    nr_expected: u32,
    nr_max_seen: u32,
}

impl FlowController {
    pub fn new(retransmit_limit: u32) -> Self {
        Self {
            retransmit_limit,
            next_ack: 0,
            window: 0,
            ready_input: VecDeque::new(),
            input_finished: false,
            input_requested: false,
            waiting_for_input: false,
            waiting_for_window: false,
            waiting_for_ack: false,
            duplicate_acks: 0,
            last_upload: Box::new([]),
            nr_expected: 0,
            nr_max_seen: 0,
        }
    }

    /// Uploads as much buffered input as the window allows, if any.
    pub fn upload_data(&mut self, ctx: &mut impl HostContext) -> io::Result<()> {
        if self.window == 0 {
            self.waiting_for_window = true;
            return Ok(());
        }

        if self.ready_input.is_empty() {
            self.waiting_for_input = true;
        } else {
            let n = self.ready_input.len().min(self.window as usize);

            let payload = self.ready_input.drain(..n).collect::<Vec<u8>>();

            let message = Message::Upload {
                nr: self.next_ack.wrapping_sub(1),
                payload: &payload,
            };

            self.last_upload = serial::write_boxed(&message);

            ctx.send_datagram(&self.last_upload)?;

            self.waiting_for_ack = true;
            self.duplicate_acks = 0;
        }

        if self.ready_input.len() < INPUT_BACKLOG_MAX && !self.input_finished {
            self.input_requested = true;
        }

        Ok(())
    }

    /// Processes an ack, either from an ACK datagram or piggybacked on a mix.
    pub fn handle_ack(
        &mut self,
        ack: u32,
        win: u32,
        from_data: bool,
        ctx: &mut impl HostContext,
    ) -> io::Result<()> {
        if self.waiting_for_window && win > 0 {
            self.waiting_for_window = false;
            self.window = win;
            self.upload_data(ctx)?;
        }

        self.window = win;

        if ack >= self.next_ack {
            self.next_ack = ack.wrapping_add(1);

            self.waiting_for_ack = false;
            self.duplicate_acks = 0;

            self.upload_data(ctx)?;
        } else if from_data && self.waiting_for_ack {
            self.duplicate_acks += 1;

            if self.duplicate_acks >= DUPLICATE_ACK_LIMIT {
                self.waiting_for_ack = false;
                self.duplicate_acks = 0;

                debug!("resending upload {}", self.next_ack.wrapping_sub(1));

                ctx.send_datagram(&self.last_upload)?;
            }
        }

        Ok(())
    }

    /// Processes a mix. Plays it if it is the next one expected, or if it is far enough ahead that
    /// the missing mixes are given up on. Otherwise asks for the missing ones again.
    pub fn handle_data(
        &mut self,
        nr: u32,
        ack: u32,
        win: u32,
        payload: &[u8],
        ctx: &mut impl HostContext,
    ) -> io::Result<()> {
        self.handle_ack(ack, win, true, ctx)?;

        let gap_too_large = (self.nr_expected as u64) + (self.retransmit_limit as u64) < nr as u64;

        if nr == self.nr_expected || gap_too_large {
            self.nr_expected = nr.wrapping_add(1);
            ctx.write_output(payload)?;
        } else if nr > self.nr_max_seen {
            debug!("mix {} arrived while expecting {}", nr, self.nr_expected);

            let message = Message::Retransmit {
                nr: self.nr_expected,
            };
            ctx.send_datagram(&serial::write_boxed(&message))?;
        }

        self.nr_max_seen = self.nr_max_seen.max(nr);

        Ok(())
    }

    /// Buffers bytes read from the input source.
    pub fn push_input(&mut self, bytes: &[u8], ctx: &mut impl HostContext) -> io::Result<()> {
        self.input_requested = false;
        self.ready_input.extend(bytes.iter().copied());

        if self.waiting_for_input {
            self.waiting_for_input = false;
            self.upload_data(ctx)?;
        }

        Ok(())
    }

    /// Marks the input source as ended. Buffered input is still uploaded.
    pub fn finish_input(&mut self) {
        self.input_finished = true;
        self.input_requested = false;
    }

    /// Whether the input source should be read.
    pub fn wants_input(&self) -> bool {
        self.input_requested && !self.input_finished
    }
}
