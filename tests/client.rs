#[allow(dead_code)]
mod common;

use std::io::Write;
use std::net;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time;

use common::util::{pcm, TestServer};

#[test]
fn client_hears_itself() {
    let mut server = TestServer::start(campfire::server::Config {
        fifo_size: 1760,
        fifo_low_watermark: 0,
        fifo_high_watermark: 880,
        ..Default::default()
    });

    let port = server.port();

    let (mut input_writer, mut input) = UnixStream::pair().unwrap();

    let client_thread = thread::spawn(move || {
        let mut client = campfire::Client::connect(campfire::client::Config {
            server_name: "127.0.0.1".into(),
            port,
            retransmit_limit: 10,
        })
        .expect("failed to connect");

        let mut output = Vec::new();

        let result = client.run(&mut input, &mut output);

        (client.id(), result, output)
    });

    // About half a second of audio
    input_writer.write_all(&pcm(1234, 44000)).unwrap();

    thread::sleep(time::Duration::from_millis(1500));

    server.stop();

    let (id, result, output) = client_thread.join().unwrap();

    assert_eq!(id, Some(0));
    assert!(matches!(
        result,
        Err(campfire::Error::ControlClosed) | Err(campfire::Error::Io(_))
    ));

    assert_eq!(output.len() % 2, 0);
    assert!(
        output.chunks_exact(2).any(|s| s == 1234i16.to_le_bytes()),
        "own audio never played back"
    );
}

#[test]
fn unreachable_server() {
    // Bound but never accepting, then closed: nothing listens on this port
    let port = {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    };

    let result = campfire::Client::connect(campfire::client::Config {
        server_name: "127.0.0.1".into(),
        port,
        retransmit_limit: 10,
    });

    assert!(matches!(result, Err(campfire::Error::Io(_))));
}

#[test]
fn silent_server_times_out() {
    // Assigns an id but never answers over UDP
    let listener = net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let server_addr = listener.local_addr().unwrap();
    let udp = net::UdpSocket::bind(server_addr).unwrap();

    let server_thread = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"CLIENT 5\n").unwrap();

        let mut buf = [0u8; 64];
        udp.set_read_timeout(Some(time::Duration::from_secs(2)))
            .unwrap();

        // Keepalives may arrive first
        let (hello, client_addr) = loop {
            let (n, client_addr) = udp.recv_from(&mut buf).unwrap();
            if buf[..n].starts_with(b"CLIENT") {
                break (buf[..n].to_vec(), client_addr);
            }
        };

        // Hold the control connection open until the client gives up
        thread::sleep(time::Duration::from_millis(2500));

        (hello, client_addr, stream)
    });

    let mut client = campfire::Client::connect(campfire::client::Config {
        server_name: "127.0.0.1".into(),
        port: server_addr.port(),
        retransmit_limit: 10,
    })
    .unwrap();

    assert_eq!(client.server_addr(), server_addr);

    let (_input_writer, mut input) = UnixStream::pair().unwrap();
    let mut output = Vec::new();

    let begin = time::Instant::now();
    let result = client.run(&mut input, &mut output);

    assert!(matches!(result, Err(campfire::Error::PeerTimeout(1000))));
    assert!(begin.elapsed() < time::Duration::from_millis(2500));
    assert_eq!(client.id(), Some(5));
    assert!(output.is_empty());

    let (hello, client_addr, _stream) = server_thread.join().unwrap();

    assert_eq!(hello, b"CLIENT 5\n");
    assert_eq!(client_addr.port(), client.local_addr().port());
}
