use std::io::Read;
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time;

use campfire::Message;

/// A server running on its own thread, stopped on drop.
pub struct TestServer {
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: campfire::server::Config) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let thread_stop = Arc::clone(&stop);

        let thread = thread::spawn(move || {
            let mut server = campfire::Server::bind(campfire::server::Config {
                port: 0,
                ..config
            })
            .expect("failed to create campfire server");

            tx.send(server.local_addr().port()).unwrap();

            server
                .run_until(&thread_stop)
                .expect("server failed");
        });

        let port = rx
            .recv_timeout(time::Duration::from_secs(5))
            .expect("server did not start");

        Self {
            port,
            stop,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> net::SocketAddr {
        (net::Ipv4Addr::LOCALHOST, self.port).into()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(thread) = self.thread.take() {
            thread.join().expect("server thread panicked");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A protocol client built directly on std sockets.
pub struct RawClient {
    pub control: net::TcpStream,
    pub socket: net::UdpSocket,
    pub id: u32,
}

impl RawClient {
    /// Opens the control connection and reads the assigned id.
    pub fn connect(server_addr: net::SocketAddr) -> Self {
        let mut control = net::TcpStream::connect(server_addr).unwrap();
        control
            .set_read_timeout(Some(time::Duration::from_secs(2)))
            .unwrap();

        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        while !line.ends_with(b"\n") {
            let n = control.read(&mut byte).unwrap();
            assert!(n > 0, "control connection closed before id");
            line.push(byte[0]);
        }

        let line = String::from_utf8(line).unwrap();
        let id = line
            .trim_end()
            .strip_prefix("CLIENT ")
            .expect("expected CLIENT line")
            .parse::<u32>()
            .unwrap();

        let socket = net::UdpSocket::bind((net::Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.connect(server_addr).unwrap();

        Self {
            control,
            socket,
            id,
        }
    }

    /// Connects and binds the UDP endpoint, returning the initial ack and window.
    pub fn connect_bound(server_addr: net::SocketAddr) -> (Self, u32, u32) {
        let client = Self::connect(server_addr);

        client.send(&Message::Client { id: client.id });

        let reply = client
            .recv_matching(time::Duration::from_secs(2), |m| {
                matches!(m, Message::Ack { .. })
            })
            .expect("no ACK for CLIENT");

        match campfire::decode(&reply).unwrap() {
            Message::Ack { ack, win } => (client, ack, win),
            _ => unreachable!(),
        }
    }

    pub fn send(&self, message: &Message) {
        self.socket.send(&campfire::encode(message)).unwrap();
    }

    /// Receives a single datagram.
    pub fn recv(&self, timeout: time::Duration) -> Option<Vec<u8>> {
        self.socket.set_read_timeout(Some(timeout)).unwrap();

        let mut buf = vec![0u8; 65536];

        match self.socket.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(_) => None,
        }
    }

    /// Receives datagrams until one satisfies `pred`, or `timeout` elapses.
    pub fn recv_matching<F>(&self, timeout: time::Duration, mut pred: F) -> Option<Vec<u8>>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = time::Instant::now() + timeout;

        loop {
            let now = time::Instant::now();
            if now >= deadline {
                return None;
            }

            if let Some(datagram) = self.recv(deadline - now) {
                let message = campfire::decode(&datagram).expect("bad datagram from server");
                if pred(&message) {
                    return Some(datagram);
                }
            }
        }
    }

    /// Discards datagrams for `duration`, returning the number discarded.
    pub fn drain(&self, duration: time::Duration) -> usize {
        let deadline = time::Instant::now() + duration;
        let mut count = 0;

        while let Some(remaining) = deadline.checked_duration_since(time::Instant::now()) {
            if remaining.is_zero() {
                break;
            }
            if self.recv(remaining).is_some() {
                count += 1;
            }
        }

        return count;
    }

    /// Reads control text until `pred` holds, the connection closes, or `timeout` elapses.
    /// Returns the text read and whether the connection closed.
    pub fn read_control_until<F>(&mut self, timeout: time::Duration, pred: F) -> (String, bool)
    where
        F: Fn(&str) -> bool,
    {
        let deadline = time::Instant::now() + timeout;
        let mut text = Vec::new();
        let mut buf = [0u8; 1024];

        self.control
            .set_read_timeout(Some(time::Duration::from_millis(50)))
            .unwrap();

        while time::Instant::now() < deadline {
            match self.control.read(&mut buf) {
                Ok(0) => return (String::from_utf8_lossy(&text).into_owned(), true),
                Ok(n) => {
                    text.extend_from_slice(&buf[..n]);
                    if pred(&String::from_utf8_lossy(&text)) {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {
                    return (String::from_utf8_lossy(&text).into_owned(), true);
                }
                Err(_) => (),
            }
        }

        (String::from_utf8_lossy(&text).into_owned(), false)
    }
}

/// Little-endian PCM of `count` copies of `sample`.
pub fn pcm(sample: i16, count: usize) -> Vec<u8> {
    (0..count).flat_map(|_| sample.to_le_bytes()).collect()
}
