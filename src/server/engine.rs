use std::net;

use log::{debug, info, warn};

use crate::frame::serial;
use crate::frame::Message;
use crate::mixer;

use super::remix::RemixBuffer;
use super::session::{FifoLimits, Session, SessionId};
use super::table::{BindError, SessionTable};

/// Largest mix, in bytes, produced by a single tick.
pub const MIX_CAPACITY: usize = 10000;

pub trait HostContext {
    // Called to send a datagram to a client's UDP endpoint
    fn send_datagram(&mut self, datagram: &[u8], addr: &net::SocketAddr);

    // Called to queue bytes on a session's control connection
    fn send_control(&mut self, id: SessionId, bytes: &[u8]);

    // Called once a session has been removed, so that its control connection can be closed
    fn on_evict(&mut self, id: SessionId);
}

/// All protocol state of a server: sessions, the endpoint index, and retained mixes.
pub struct ServerCore {
    // Table of live sessions
    sessions: SessionTable,
    // Most recent mixes
    remixes: RemixBuffer,
    // Milliseconds of audio per mix
    tx_interval_ms: u64,
    // Always-allocated outbound datagram buffer
    datagram_buffer: Vec<u8>,
}

fn send_message(
    message: &Message,
    addr: &net::SocketAddr,
    buffer: &mut Vec<u8>,
    ctx: &mut impl HostContext,
) {
    buffer.clear();
    serial::write(message, buffer);
    ctx.send_datagram(buffer, addr);
}

fn send_ack(session: &Session, buffer: &mut Vec<u8>, ctx: &mut impl HostContext) {
    if let Some(addr) = session.endpoint() {
        let message = Message::Ack {
            ack: session.ack(),
            win: session.window_u32(),
        };

        send_message(&message, addr, buffer, ctx);
    }
}

fn send_remix(
    session: &Session,
    nr: u32,
    payload: &[u8],
    buffer: &mut Vec<u8>,
    ctx: &mut impl HostContext,
) {
    if let Some(addr) = session.endpoint() {
        let message = Message::Data {
            nr,
            ack: session.ack(),
            win: session.window_u32(),
            payload,
        };

        send_message(&message, addr, buffer, ctx);
    }
}

impl ServerCore {
    pub fn new(limits: FifoLimits, buf_len: usize, tx_interval_ms: u64) -> Self {
        Self {
            sessions: SessionTable::new(limits),
            remixes: RemixBuffer::new(buf_len),
            tx_interval_ms,
            datagram_buffer: Vec::with_capacity(serial::HEADER_SIZE_MAX + MIX_CAPACITY),
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn remixes(&self) -> &RemixBuffer {
        &self.remixes
    }

    /// Creates a session for a newly accepted control connection. The caller is responsible for
    /// sending the id to the client.
    pub fn open_session(&mut self, control_addr: net::SocketAddr) -> SessionId {
        let id = self.sessions.insert(control_addr);

        info!("accepted new session {} from {}", id, control_addr);

        return id;
    }

    /// Removes a session. Returns false if it had already been removed.
    pub fn close_session(&mut self, id: SessionId, ctx: &mut impl HostContext) -> bool {
        match self.sessions.remove(id) {
            Some(_) => {
                info!("removing session {}", id);
                ctx.on_evict(id);
                true
            }
            None => false,
        }
    }

    /// Decodes and dispatches a single datagram.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        sender_addr: &net::SocketAddr,
        ctx: &mut impl HostContext,
    ) {
        let message = match serial::read(datagram) {
            Ok(message) => message,
            Err(err) => {
                warn!("bad datagram from {}: {}", sender_addr, err);
                return;
            }
        };

        match message {
            Message::Client { id } => {
                self.handle_client(id, sender_addr, ctx);
            }
            Message::Upload { nr, payload } => {
                self.handle_upload(nr, payload, sender_addr, ctx);
            }
            Message::Retransmit { nr } => {
                self.handle_retransmit(nr, sender_addr, ctx);
            }
            Message::Keepalive => {
                self.handle_keepalive(sender_addr);
            }
            Message::Ack { .. } | Message::Data { .. } => {
                warn!("unexpected {:?} from {}", message.kind(), sender_addr);
            }
        }
    }

    fn handle_client(
        &mut self,
        id: SessionId,
        sender_addr: &net::SocketAddr,
        ctx: &mut impl HostContext,
    ) {
        match self.sessions.bind(id, *sender_addr) {
            Ok(session) => {
                debug!("session {} bound to {}", id, sender_addr);
                send_ack(session, &mut self.datagram_buffer, ctx);
            }
            Err(BindError::UnknownId) => {
                warn!("unknown session {} tried to bind {}", id, sender_addr);
            }
            Err(BindError::EndpointTaken(owner)) => {
                warn!(
                    "session {} tried to bind {}, already bound to session {}",
                    id, sender_addr, owner
                );
            }
        }
    }

    fn handle_upload(
        &mut self,
        nr: u32,
        payload: &[u8],
        sender_addr: &net::SocketAddr,
        ctx: &mut impl HostContext,
    ) {
        let Some(session) = self.sessions.find_by_endpoint_mut(sender_addr) else {
            warn!("upload from unknown endpoint {}", sender_addr);
            return;
        };

        session.mark_alive();

        match session.upload(nr, payload) {
            Ok(()) => {
                send_ack(session, &mut self.datagram_buffer, ctx);
            }
            Err(rejection) => {
                debug!("session {}: {}", session.id(), rejection);
            }
        }
    }

    fn handle_retransmit(
        &mut self,
        nr: u32,
        sender_addr: &net::SocketAddr,
        ctx: &mut impl HostContext,
    ) {
        let Some(session) = self.sessions.find_by_endpoint_mut(sender_addr) else {
            warn!("retransmit request from unknown endpoint {}", sender_addr);
            return;
        };

        session.mark_alive();

        for remix_nr in self.remixes.retransmit_range(nr) {
            if let Some(payload) = self.remixes.get(remix_nr) {
                send_remix(session, remix_nr, payload, &mut self.datagram_buffer, ctx);
            }
        }
    }

    fn handle_keepalive(&mut self, sender_addr: &net::SocketAddr) {
        match self.sessions.find_by_endpoint_mut(sender_addr) {
            Some(session) => session.mark_alive(),
            None => debug!("keepalive from unknown endpoint {}", sender_addr),
        }
    }

    /// Builds the periodic status report.
    pub fn construct_report(&self) -> String {
        let mut report = String::from("\n");

        for session in self.sessions.iter().filter(|s| s.uses_udp()) {
            // Writes into a String are infallible
            let _ = session.write_info(&mut report);
        }

        return report;
    }

    /// Sends the status report to every bound session, then resets report statistics.
    pub fn report(&mut self, ctx: &mut impl HostContext) {
        let report = self.construct_report();

        for session in self.sessions.iter().filter(|s| s.uses_udp()) {
            ctx.send_control(session.id(), report.as_bytes());
        }

        for session in self.sessions.iter_mut() {
            session.reset_fifo_stats();
        }
    }

    /// Evicts every bound session that has sent nothing since the previous call.
    pub fn evict_stale(&mut self, ctx: &mut impl HostContext) {
        let stale = self
            .sessions
            .iter_mut()
            .filter(|session| session.uses_udp())
            .filter_map(|session| {
                if session.take_alive() {
                    None
                } else {
                    Some(session.id())
                }
            })
            .collect::<Vec<_>>();

        for id in stale {
            info!("no datagram from session {} within the liveness interval", id);
            self.close_session(id, ctx);
        }
    }

    /// Mixes one tick of audio from every active session, retains it, and sends it to every
    /// bound session. Returns the number of the new mix.
    pub fn mix_and_send(&mut self, ctx: &mut impl HostContext) -> u32 {
        let (ids, inputs): (Vec<SessionId>, Vec<&[u8]>) = self
            .sessions
            .iter_mut()
            .filter(|session| session.is_active())
            .map(|session| {
                let id = session.id();
                (id, session.fifo_data())
            })
            .unzip();

        let mix = mixer::mix(&inputs, MIX_CAPACITY, self.tx_interval_ms);

        for (id, consumed) in ids.into_iter().zip(mix.consumed.iter()) {
            if let Some(session) = self.sessions.get_mut(id) {
                session.consume(*consumed);
            }
        }

        let nr = self.remixes.push(mix.bytes);

        if let Some(payload) = self.remixes.get(nr) {
            for session in self.sessions.iter() {
                send_remix(session, nr, payload, &mut self.datagram_buffer, ctx);
            }
        }

        return nr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: FifoLimits = FifoLimits {
        size: 2000,
        low_watermark: 0,
        high_watermark: 1000,
    };

    #[derive(Default)]
    struct RecordingContext {
        datagrams: Vec<(Box<[u8]>, net::SocketAddr)>,
        control: Vec<(SessionId, Vec<u8>)>,
        evicted: Vec<SessionId>,
    }

    impl HostContext for RecordingContext {
        fn send_datagram(&mut self, datagram: &[u8], addr: &net::SocketAddr) {
            self.datagrams.push((datagram.into(), *addr));
        }

        fn send_control(&mut self, id: SessionId, bytes: &[u8]) {
            self.control.push((id, bytes.to_vec()));
        }

        fn on_evict(&mut self, id: SessionId) {
            self.evicted.push(id);
        }
    }

    impl RecordingContext {
        fn take_messages(&mut self) -> Vec<(Message<'static>, net::SocketAddr)> {
            self.datagrams
                .drain(..)
                .map(|(bytes, addr)| {
                    let bytes: &'static [u8] = Box::leak(bytes);
                    (serial::read(bytes).unwrap(), addr)
                })
                .collect()
        }
    }

    fn addr(port: u16) -> net::SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn pcm(sample: i16, count: usize) -> Vec<u8> {
        (0..count).flat_map(|_| sample.to_le_bytes()).collect()
    }

    fn session(core: &ServerCore, id: SessionId) -> Option<&Session> {
        core.sessions().iter().find(|session| session.id() == id)
    }

    fn datagram(message: Message) -> Box<[u8]> {
        serial::write_boxed(&message)
    }

    /// Opens a session and binds it to `endpoint`, discarding the resulting ACK.
    fn bound_session(
        core: &mut ServerCore,
        endpoint: net::SocketAddr,
        ctx: &mut RecordingContext,
    ) -> SessionId {
        let id = core.open_session(addr(1));
        core.handle_datagram(&datagram(Message::Client { id }), &endpoint, ctx);
        ctx.datagrams.clear();
        return id;
    }

    #[test]
    fn client_binds_and_acks() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        let id = core.open_session(addr(1));

        core.handle_datagram(&datagram(Message::Client { id }), &addr(1000), ctx);

        assert_eq!(
            ctx.take_messages(),
            vec![(Message::Ack { ack: 0, win: 2000 }, addr(1000))]
        );
        assert!(session(&core, id).unwrap().uses_udp());
    }

    #[test]
    fn claimed_endpoint_is_not_acked() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        let owner = bound_session(&mut core, addr(1000), ctx);
        let other = core.open_session(addr(2));

        core.handle_datagram(&datagram(Message::Client { id: other }), &addr(1000), ctx);

        assert!(ctx.datagrams.is_empty());
        assert!(!session(&core, other).unwrap().uses_udp());
        assert_eq!(session(&core, owner).unwrap().endpoint(), Some(&addr(1000)));

        // The owner's traffic is still attributed to the owner
        core.handle_datagram(
            &datagram(Message::Upload {
                nr: 0,
                payload: &[0; 10],
            }),
            &addr(1000),
            ctx,
        );

        assert_eq!(
            ctx.take_messages(),
            vec![(Message::Ack { ack: 1, win: 1990 }, addr(1000))]
        );
        assert_eq!(session(&core, other).unwrap().ack(), 0);
    }

    #[test]
    fn unknown_client_is_dropped() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        core.handle_datagram(&datagram(Message::Client { id: 3 }), &addr(1000), ctx);

        assert!(ctx.datagrams.is_empty());
        assert_eq!(core.sessions().len(), 0);
    }

    #[test]
    fn malformed_datagrams_are_dropped() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        let id = bound_session(&mut core, addr(1000), ctx);

        core.handle_datagram(b"UPLOAD 0", &addr(1000), ctx);
        core.handle_datagram(b"UPLOAD zero\nabc", &addr(1000), ctx);
        core.handle_datagram(b"HELLO\n", &addr(1000), ctx);
        core.handle_datagram(&datagram(Message::Ack { ack: 0, win: 0 }), &addr(1000), ctx);

        assert!(ctx.datagrams.is_empty());
        assert_eq!(session(&core, id).unwrap().ack(), 0);
    }

    #[test]
    fn upload_admission() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        let id = bound_session(&mut core, addr(1000), ctx);

        let upload = |nr, len| {
            datagram(Message::Upload {
                nr,
                payload: &vec![0u8; len],
            })
        };

        core.handle_datagram(&upload(0, 500), &addr(1000), ctx);

        assert_eq!(
            ctx.take_messages(),
            vec![(Message::Ack { ack: 1, win: 1500 }, addr(1000))]
        );

        // Wrong number: no reply, no state change
        core.handle_datagram(&upload(0, 100), &addr(1000), ctx);
        core.handle_datagram(&upload(5, 100), &addr(1000), ctx);
        // Larger than the window
        core.handle_datagram(&upload(1, 1501), &addr(1000), ctx);
        // Unbound endpoint
        core.handle_datagram(&upload(1, 100), &addr(1001), ctx);

        assert!(ctx.datagrams.is_empty());

        let admitted = session(&core, id).unwrap();
        assert_eq!(admitted.ack(), 1);
        assert_eq!(admitted.window(), 1500);

        core.handle_datagram(&upload(1, 1500), &addr(1000), ctx);

        assert_eq!(
            ctx.take_messages(),
            vec![(Message::Ack { ack: 2, win: 0 }, addr(1000))]
        );
        assert!(session(&core, id).unwrap().is_active());
    }

    #[test]
    fn mix_and_send_uses_active_sessions() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        let a = bound_session(&mut core, addr(1000), ctx);
        let b = bound_session(&mut core, addr(1001), ctx);
        let c = bound_session(&mut core, addr(1002), ctx);

        // a and b reach the high watermark, c does not
        for (port, sample) in [(1000, 30000i16), (1001, 10000), (1002, 7)] {
            let count = if port == 1002 { 100 } else { 500 };
            core.handle_datagram(
                &datagram(Message::Upload {
                    nr: 0,
                    payload: &pcm(sample, count),
                }),
                &addr(port),
                ctx,
            );
        }
        ctx.datagrams.clear();

        let nr = core.mix_and_send(ctx);
        assert_eq!(nr, 1);

        let messages = ctx.take_messages();
        assert_eq!(messages.len(), 3);

        for (message, to) in messages {
            let Message::Data {
                nr,
                ack,
                win,
                payload,
            } = message
            else {
                panic!("expected DATA, got {:?}", message);
            };

            assert_eq!(nr, 1);
            assert_eq!(ack, 1);
            assert_eq!(payload.len(), 880);
            // Saturated
            assert_eq!(&payload[..2], &i16::MAX.to_le_bytes());
            assert_eq!(&payload[878..], &i16::MAX.to_le_bytes());

            // Each session sees its own window
            if to == addr(1002) {
                assert_eq!(win, 2000 - 200);
            } else {
                assert_eq!(win, 2000 - 1000 + 880);
            }
        }

        assert_eq!(session(&core, a).unwrap().window(), 2000 - 120);
        assert_eq!(session(&core, b).unwrap().window(), 2000 - 120);
        assert_eq!(session(&core, c).unwrap().window(), 2000 - 200);

        // Draining to the low watermark deactivates
        core.mix_and_send(ctx);
        assert_eq!(session(&core, a).unwrap().window(), 2000);
        assert!(!session(&core, a).unwrap().is_active());

        ctx.datagrams.clear();
        core.mix_and_send(ctx);

        for (message, _) in ctx.take_messages() {
            match message {
                Message::Data { nr, payload, .. } => {
                    assert_eq!(nr, 3);
                    assert!(payload.iter().all(|&b| b == 0));
                }
                _ => panic!("expected DATA"),
            }
        }
    }

    #[test]
    fn unbound_sessions_receive_nothing() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        core.open_session(addr(1));
        core.mix_and_send(ctx);
        core.report(ctx);

        assert!(ctx.datagrams.is_empty());
        assert!(ctx.control.is_empty());
    }

    #[test]
    fn retransmit_burst_is_clamped() {
        let mut core = ServerCore::new(LIMITS, 3, 5);
        let ref mut ctx = RecordingContext::default();

        bound_session(&mut core, addr(1000), ctx);

        for _ in 0..5 {
            core.mix_and_send(ctx);
        }
        ctx.datagrams.clear();

        core.handle_datagram(&datagram(Message::Retransmit { nr: 0 }), &addr(1000), ctx);

        let numbers = ctx
            .take_messages()
            .into_iter()
            .map(|(message, to)| {
                assert_eq!(to, addr(1000));
                match message {
                    Message::Data { nr, .. } => nr,
                    _ => panic!("expected DATA"),
                }
            })
            .collect::<Vec<_>>();

        assert_eq!(numbers, vec![3, 4, 5]);

        core.handle_datagram(&datagram(Message::Retransmit { nr: 5 }), &addr(1000), ctx);
        assert_eq!(ctx.take_messages().len(), 1);

        // Nothing newer than the newest
        core.handle_datagram(&datagram(Message::Retransmit { nr: 6 }), &addr(1000), ctx);
        assert!(ctx.datagrams.is_empty());

        // Unbound endpoints get nothing
        core.handle_datagram(&datagram(Message::Retransmit { nr: 0 }), &addr(1001), ctx);
        assert!(ctx.datagrams.is_empty());
    }

    #[test]
    fn stale_sessions_are_evicted() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        let quiet = bound_session(&mut core, addr(1000), ctx);
        let chatty = bound_session(&mut core, addr(1001), ctx);
        let unbound = core.open_session(addr(2));

        // Binding counts as activity
        core.evict_stale(ctx);
        assert!(ctx.evicted.is_empty());

        core.handle_datagram(&datagram(Message::Keepalive), &addr(1001), ctx);
        core.evict_stale(ctx);

        assert_eq!(ctx.evicted, vec![quiet]);
        assert!(session(&core, quiet).is_none());
        assert!(session(&core, chatty).is_some());
        assert!(session(&core, unbound).is_some());

        // The evicted endpoint is no longer recognised
        core.handle_datagram(
            &datagram(Message::Upload {
                nr: 0,
                payload: b"ab",
            }),
            &addr(1000),
            ctx,
        );
        assert!(ctx.datagrams.is_empty());
    }

    #[test]
    fn report_goes_to_bound_sessions() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        let a = bound_session(&mut core, addr(1000), ctx);
        core.open_session(addr(2));

        core.handle_datagram(
            &datagram(Message::Upload {
                nr: 0,
                payload: &[0; 300],
            }),
            &addr(1000),
            ctx,
        );

        core.report(ctx);

        let expected = "\n127.0.0.1:1 FIFO: 300/2000 (min. 0, max. 300)\n";
        assert_eq!(ctx.control, vec![(a, expected.as_bytes().to_vec())]);

        ctx.control.clear();
        core.report(ctx);

        let expected = "\n127.0.0.1:1 FIFO: 300/2000 (min. 300, max. 300)\n";
        assert_eq!(ctx.control, vec![(a, expected.as_bytes().to_vec())]);
    }

    #[test]
    fn close_session_is_idempotent() {
        let mut core = ServerCore::new(LIMITS, 10, 5);
        let ref mut ctx = RecordingContext::default();

        let id = bound_session(&mut core, addr(1000), ctx);

        assert!(core.close_session(id, ctx));
        assert!(!core.close_session(id, ctx));
        assert_eq!(ctx.evicted, vec![id]);
    }
}
