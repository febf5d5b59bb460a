//! Replica server scenarios: heartbeat channel, request handling across the
//! newborn/ready and primary/backup axes, and checkpoint emission and
//! application, driven by scripted LFD, client, RM and backup peers.

mod setup;

use setup::{listen, FakeEndpoint, Peer};

use faultline::message::{Envelope, Role};
use faultline::Server;

use std::collections::HashMap;
use std::time::Duration;

/// Spawns a server with the given role and RM/backup wiring, returning its
/// address.
fn spawn_server(
    id: &str,
    init_state: i64,
    role: Role,
    backups: HashMap<String, String>,
    ckpt_ms: u64,
    rm_addr: Option<String>,
) -> String {
    let (listener, addr) = listen();
    let server = Server::new(
        id.to_string(),
        init_state,
        role,
        backups,
        Duration::from_millis(ckpt_ms),
        rm_addr,
    );
    std::thread::spawn(move || server.serve(listener));
    addr
}

fn req(client_id: &str, request_num: u64, message: &str) -> Envelope {
    Envelope::Req {
        client_id: client_id.into(),
        request_num,
        message: message.into(),
    }
}

fn checkpoint(replica_id: &str, server_state: i64, checkpoint_num: u64) -> Envelope {
    Envelope::Checkpoint {
        replica_id: replica_id.into(),
        server_state,
        checkpoint_num,
    }
}

/// The LFD channel: matching REGISTER gets ACK and PING gets PONG on the
/// same connection; a REGISTER for some other replica gets NACK and a
/// closed connection.
#[test]
fn lfd_register_and_heartbeat() {
    let addr = spawn_server("S1", 0, Role::Backup, HashMap::new(), 0, None);

    let mut lfd = Peer::connect(&addr);
    lfd.send("REGISTER S1");
    lfd.expect("ACK");
    lfd.send("PING");
    lfd.expect("PONG");
    lfd.send("PING");
    lfd.expect("PONG");

    let mut wrong = Peer::connect(&addr);
    wrong.send("REGISTER S9");
    wrong.expect("NACK");
    wrong.expect_closed();
}

/// A bootstrap primary is ready from the start: it serves requests,
/// reports every increment to the RM, and echoes the request message.
#[test]
fn primary_serves_requests_and_reports_state() {
    let rm = FakeEndpoint::bind();
    let addr = spawn_server("S1", 0, Role::Primary, HashMap::new(), 0, Some(rm.addr.clone()));

    let mut rm_peer = rm.accept();
    rm_peer.expect("HELLO_SERVER S1");
    rm_peer.expect("STATE S1 0");

    let mut client = Peer::connect(&addr);
    client.send_envelope(&req("C1", 1, "hello"));
    assert_eq!(
        client.recv_envelope(),
        Envelope::Resp {
            server_id: "S1".into(),
            client_id: "C1".into(),
            request_num: 1,
            server_state: 1,
            message: "hello".into(),
        }
    );
    rm_peer.expect("STATE S1 1");

    client.send_envelope(&req("C1", 2, "again"));
    assert_eq!(
        client.recv_envelope(),
        Envelope::Resp {
            server_id: "S1".into(),
            client_id: "C1".into(),
            request_num: 2,
            server_state: 2,
            message: "again".into(),
        }
    );
    rm_peer.expect("STATE S1 2");
}

/// Newborn recovery: a fresh backup holds requests without replying, even
/// after promotion; the first applied checkpoint makes it ready, and only
/// ready + primary together make it serve.
#[test]
fn newborn_serves_only_after_checkpoint_and_promotion() {
    let rm = FakeEndpoint::bind();
    let addr = spawn_server("S2", 0, Role::Backup, HashMap::new(), 0, Some(rm.addr.clone()));

    let mut rm_peer = rm.accept();
    rm_peer.expect("HELLO_SERVER S2");
    rm_peer.expect("STATE S2 0");

    // A request that reaches the newborn draws no reply at all.
    let mut client = Peer::connect(&addr);
    client.send_envelope(&req("C1", 1, "early"));
    client.expect_silence();

    // The first checkpoint ends the newborn phase and is reported.
    let mut primary = Peer::connect(&addr);
    primary.send_envelope(&checkpoint("S1", 42, 8));
    rm_peer.expect("STATE S2 42");

    // Ready but still a backup: requests are observed, not served.
    client.send_envelope(&req("C1", 2, "still early"));
    client.expect_silence();

    // Promotion by the RM finally makes it serve, from the restored state.
    // The role switch is asynchronous; poll until a reply arrives.
    rm_peer.send("ROLE PRIMARY");
    let mut reply = None;
    for _ in 0..50 {
        client.send_envelope(&req("C1", 3, "now"));
        if let Some(envelope) = client.try_recv_envelope() {
            reply = Some(envelope);
            break;
        }
    }
    let Some(Envelope::Resp { server_state, client_id, .. }) = reply else {
        panic!("no RESP after promotion, got {reply:?}");
    };
    assert_eq!(client_id, "C1");
    assert_eq!(server_state, 43);
}

/// Stale checkpoint rejection: only strictly newer checkpoint numbers are
/// applied; duplicates and regressions change nothing and report nothing.
#[test]
fn stale_checkpoints_are_discarded() {
    let rm = FakeEndpoint::bind();
    let addr = spawn_server("S2", 0, Role::Backup, HashMap::new(), 0, Some(rm.addr.clone()));

    let mut rm_peer = rm.accept();
    rm_peer.expect("HELLO_SERVER S2");
    rm_peer.expect("STATE S2 0");

    let mut primary = Peer::connect(&addr);
    primary.send_envelope(&checkpoint("S1", 10, 5));
    rm_peer.expect("STATE S2 10");

    // The same checkpoint again, and an older one: both dropped.
    primary.send_envelope(&checkpoint("S1", 10, 5));
    primary.send_envelope(&checkpoint("S1", 99, 4));
    rm_peer.expect_silence();

    // A strictly newer one applies.
    primary.send_envelope(&checkpoint("S1", 11, 6));
    rm_peer.expect("STATE S2 11");
}

/// The primary's checkpoint ticker: backups are dialed lazily and receive
/// strictly increasing checkpoint numbers carrying the current state.
#[test]
fn primary_broadcasts_checkpoints_to_backups() {
    let backup = FakeEndpoint::bind();
    let backups: HashMap<String, String> = [("S2".to_string(), backup.addr.clone())].into();
    let addr = spawn_server("S1", 7, Role::Primary, backups, 50, None);

    let mut backup_peer = backup.accept();
    let Envelope::Checkpoint { replica_id, server_state, checkpoint_num } =
        backup_peer.recv_envelope()
    else {
        panic!("expected CHECKPOINT");
    };
    assert_eq!(replica_id, "S1");
    assert_eq!(server_state, 7);
    assert!(checkpoint_num >= 1);

    let Envelope::Checkpoint { checkpoint_num: next, server_state, .. } =
        backup_peer.recv_envelope()
    else {
        panic!("expected CHECKPOINT");
    };
    assert_eq!(server_state, 7);
    assert_eq!(next, checkpoint_num + 1);

    // A request bumps the state; subsequent checkpoints carry it.
    let mut client = Peer::connect(&addr);
    client.send_envelope(&req("C1", 1, "bump"));
    client.recv_envelope();
    loop {
        let Envelope::Checkpoint { server_state, .. } = backup_peer.recv_envelope() else {
            panic!("expected CHECKPOINT");
        };
        if server_state == 8 {
            break;
        }
    }
}

/// Garbage on a request channel draws an ERROR line and does not kill the
/// connection or the state.
#[test]
fn malformed_lines_get_error_replies() {
    let addr = spawn_server("S1", 0, Role::Primary, HashMap::new(), 0, None);

    let mut client = Peer::connect(&addr);
    client.send("{not json");
    client.expect("ERROR: invalid JSON format");
    client.send(r#"{"type":"RESP","server_id":"S9","client_id":"C1","request_num":1,"server_state":1,"message":"x"}"#);
    client.expect("ERROR: unknown request type");

    // The channel still works.
    client.send_envelope(&req("C1", 1, "ok"));
    let Envelope::Resp { server_state, .. } = client.recv_envelope() else {
        panic!("expected RESP");
    };
    assert_eq!(server_state, 1);
}
