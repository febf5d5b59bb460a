//! Test harness: scripted protocol peers. Each test runs a real component
//! on a loopback listener and drives it with fake peers that send and
//! expect wire lines verbatim.

#![allow(dead_code)]

use faultline::message::Envelope;
use faultline::wire::Connection;

use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// How long a peer waits for an expected line before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a peer listens before concluding that no line is coming.
pub const QUIET: Duration = Duration::from_millis(300);

/// Binds a fresh loopback listener, returning it with its address.
pub fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
    let addr = listener.local_addr().expect("no local addr").to_string();
    (listener, addr)
}

/// Returns a loopback address that refuses connections.
pub fn refused_addr() -> String {
    let (listener, addr) = listen();
    drop(listener);
    addr
}

/// A scripted peer on one side of a line-oriented connection.
pub struct Peer {
    conn: Connection,
}

impl Peer {
    /// Connects to a component under test.
    pub fn connect(addr: &str) -> Self {
        let conn = Connection::connect(addr).expect("connect failed");
        conn.set_read_deadline(Some(RECV_TIMEOUT)).expect("set deadline failed");
        Self { conn }
    }

    /// Wraps a connection accepted from the component under test.
    pub fn from_stream(stream: TcpStream) -> Self {
        let conn = Connection::from_stream(stream).expect("wrap failed");
        conn.set_read_deadline(Some(RECV_TIMEOUT)).expect("set deadline failed");
        Self { conn }
    }

    /// Sends one line.
    pub fn send(&mut self, line: impl std::fmt::Display) {
        self.conn.write_line(line).expect("send failed");
    }

    /// Sends one application envelope.
    pub fn send_envelope(&mut self, envelope: &Envelope) {
        self.send(envelope.encode().expect("encode failed"));
    }

    /// Receives one line, failing the test after RECV_TIMEOUT.
    #[track_caller]
    pub fn recv(&mut self) -> String {
        self.conn.read_line().expect("no line received")
    }

    /// Receives and decodes one application envelope.
    #[track_caller]
    pub fn recv_envelope(&mut self) -> Envelope {
        let line = self.recv();
        Envelope::decode(&line).expect("undecodable envelope")
    }

    /// Receives and decodes one envelope if it arrives within the quiet
    /// window, else None.
    #[track_caller]
    pub fn try_recv_envelope(&mut self) -> Option<Envelope> {
        self.conn.set_read_deadline(Some(QUIET)).expect("set deadline failed");
        let envelope = self
            .conn
            .read_line()
            .ok()
            .map(|line| Envelope::decode(&line).expect("undecodable envelope"));
        self.conn.set_read_deadline(Some(RECV_TIMEOUT)).expect("set deadline failed");
        envelope
    }

    /// Asserts that the next received line is exactly the given one.
    #[track_caller]
    pub fn expect(&mut self, line: &str) {
        assert_eq!(self.recv(), line);
    }

    /// Asserts that no line arrives within the quiet window.
    #[track_caller]
    pub fn expect_silence(&mut self) {
        self.conn.set_read_deadline(Some(QUIET)).expect("set deadline failed");
        if let Ok(line) = self.conn.read_line() {
            panic!("expected silence, received {line:?}");
        }
        self.conn.set_read_deadline(Some(RECV_TIMEOUT)).expect("set deadline failed");
    }

    /// Asserts that the peer closed the connection.
    #[track_caller]
    pub fn expect_closed(&mut self) {
        assert!(self.conn.read_line().is_err(), "expected closed connection");
    }

    /// Shuts the connection down.
    pub fn shutdown(&self) {
        self.conn.shutdown();
    }
}

/// A fake listening endpoint standing in for a protocol role (an RM, a GFD,
/// a backup) that the component under test dials.
pub struct FakeEndpoint {
    listener: TcpListener,
    pub addr: String,
}

impl FakeEndpoint {
    pub fn bind() -> Self {
        let (listener, addr) = listen();
        Self { listener, addr }
    }

    /// Accepts the next inbound connection as a scripted peer.
    pub fn accept(&self) -> Peer {
        let (stream, _) = self.listener.accept().expect("accept failed");
        Peer::from_stream(stream)
    }
}
