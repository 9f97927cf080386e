mod common;

use common::{Tally, TestRuntime, WAIT};
use sockloop::filter::{ByteFilter, StringFilter};
use sockloop::protocol::fixed::encode_frame;
use sockloop::protocol::{FixedHeaderSplitter, LineSplitter};
use sockloop::reactor::wait_until;
use sockloop::{ConnectionConfig, Message, TcpClient, TcpServer};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fixed_server(runtime: &TestRuntime, tally: &Arc<Tally>) -> TcpServer {
    let config = ConnectionConfig::builder(runtime.handle())
        .port(0)
        .splitter(FixedHeaderSplitter)
        .filter(ByteFilter)
        .handler(Arc::clone(tally))
        .build()
        .unwrap();
    TcpServer::bind(config).unwrap()
}

fn line_server(runtime: &TestRuntime, tally: &Arc<Tally>) -> TcpServer {
    let config = ConnectionConfig::builder(runtime.handle())
        .port(0)
        .splitter(LineSplitter)
        .filter(StringFilter)
        .handler(Arc::clone(tally))
        .build()
        .unwrap();
    TcpServer::bind(config).unwrap()
}

fn line_client(runtime: &TestRuntime, server: &TcpServer) -> TcpClient {
    let config = ConnectionConfig::builder(runtime.handle())
        .port(server.local_addr().port())
        .splitter(LineSplitter)
        .filter(StringFilter)
        .build()
        .unwrap();
    TcpClient::connect(config).unwrap()
}

#[test]
fn fixed_frame_across_three_writes_is_one_message() {
    let runtime = TestRuntime::new();
    let tally = Tally::echo();
    let server = fixed_server(&runtime, &tally);

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let frame = encode_frame(&payload).unwrap();

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    for piece in [&frame[..3], &frame[3..5000], &frame[5000..]] {
        stream.write_all(piece).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(30));
    }

    let mut echoed = vec![0u8; frame.len()];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, frame.to_vec());
    assert_eq!(tally.received(), 1);
    assert!(tally.exceptions().is_empty());
}

#[test]
fn empty_fixed_frame_round_trips() {
    let runtime = TestRuntime::new();
    let tally = Tally::echo();
    let server = fixed_server(&runtime, &tally);

    let frame = encode_frame(b"").unwrap();
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream.write_all(&frame).unwrap();

    let mut echoed = vec![0u8; frame.len()];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, frame.to_vec());
}

#[test]
fn bad_magic_reports_once_and_hangs_up() {
    let runtime = TestRuntime::new();
    let tally = Tally::echo();
    let server = fixed_server(&runtime, &tally);

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream.write_all(&[0x81, 0x80, 0, 0, 0, 2, 0x80, b'h', b'i']).unwrap();

    let mut rest = Vec::new();
    let read = stream.read_to_end(&mut rest).unwrap();
    assert_eq!(read, 0);

    assert!(wait_until(WAIT, || tally.disconnects() == 1));
    let exceptions = tally.exceptions();
    assert_eq!(exceptions.len(), 1);
    assert!(exceptions[0].contains("Protocol"));
    assert_eq!(tally.received(), 0);
    assert!(wait_until(WAIT, || server.active_sessions() == 0));
}

#[test]
fn line_echo_through_client() {
    let runtime = TestRuntime::new();
    let tally = Tally::echo();
    let server = line_server(&runtime, &tally);
    let client = line_client(&runtime, &server);

    let reply = client.request("hello\n").unwrap();
    assert_eq!(reply.as_text(), Some("hello\n"));

    client.sync_send("one\ntwo\n").unwrap();
    assert_eq!(client.sync_read().unwrap().as_text(), Some("one\n"));
    assert_eq!(client.sync_read().unwrap().as_text(), Some("two\n"));
    assert_eq!(tally.received(), 3);
}

#[test]
fn sync_read_times_out_without_reply() {
    let runtime = TestRuntime::new();
    let tally = Tally::silent();
    let server = line_server(&runtime, &tally);

    let config = ConnectionConfig::builder(runtime.handle())
        .port(server.local_addr().port())
        .read_timeout(Duration::from_millis(200))
        .splitter(LineSplitter)
        .filter(StringFilter)
        .build()
        .unwrap();
    let client = TcpClient::connect(config).unwrap();

    client.sync_send("anyone?\n").unwrap();
    assert!(matches!(
        client.sync_read(),
        Err(sockloop::Error::Timeout(_))
    ));
}

#[test]
fn concurrent_clients_each_get_their_own_replies() {
    let runtime = TestRuntime::new();
    let tally = Tally::echo();
    let server = line_server(&runtime, &tally);

    let clients: Vec<TcpClient> = (0..8).map(|_| line_client(&runtime, &server)).collect();
    thread::scope(|scope| {
        for (i, client) in clients.iter().enumerate() {
            scope.spawn(move || {
                for round in 0..5 {
                    let line = format!("client {} round {}\n", i, round);
                    let reply = client.request(line.clone()).unwrap();
                    assert_eq!(reply.as_text(), Some(line.as_str()));
                }
            });
        }
    });

    assert_eq!(tally.received(), 40);
    assert_eq!(server.active_sessions(), 8);
}

#[test]
fn client_close_reaches_the_server() {
    let runtime = TestRuntime::new();
    let tally = Tally::echo();
    let server = line_server(&runtime, &tally);
    let client = line_client(&runtime, &server);

    assert!(wait_until(WAIT, || tally.connects() == 1));
    assert!(client.close());
    assert!(!client.close());
    assert!(!client.is_open());

    assert!(wait_until(WAIT, || tally.disconnects() == 1));
    assert!(wait_until(WAIT, || server.active_sessions() == 0));
    assert!(matches!(
        client.sync_send("late\n"),
        Err(sockloop::Error::ConnectionClosed)
    ));
}

#[test]
fn quiet_session_goes_idle() {
    let runtime = TestRuntime::new();
    let tally = Tally::silent();
    let config = ConnectionConfig::builder(runtime.handle())
        .port(0)
        .idle_interval(Duration::from_secs(1))
        .handler(Arc::clone(&tally))
        .build()
        .unwrap();
    let server = TcpServer::bind(config).unwrap();

    let _stream = TcpStream::connect(server.local_addr()).unwrap();
    assert!(wait_until(WAIT, || tally.connects() == 1));

    thread::sleep(Duration::from_millis(3_500));
    let idles = tally.idles();
    assert!((2..=4).contains(&idles), "{} idle events in 3.5s", idles);
}

#[test]
fn runtime_shutdown_disconnects_sessions() {
    let runtime = TestRuntime::new();
    let tally = Tally::echo();
    let server = line_server(&runtime, &tally);
    let client = line_client(&runtime, &server);
    assert!(wait_until(WAIT, || tally.connects() == 1));

    runtime.0.shutdown();
    assert_eq!(tally.disconnects(), 1);
    assert!(client.session().is_closed());
}

#[test]
fn handler_can_send_without_replying() {
    let runtime = TestRuntime::new();
    let tally = Tally::silent();
    let server = line_server(&runtime, &tally);
    let client = line_client(&runtime, &server);
    assert!(wait_until(WAIT, || tally.connects() == 1));

    client.send(Message::from("fire and forget\n"));
    assert!(wait_until(WAIT, || tally.received() == 1));
}
