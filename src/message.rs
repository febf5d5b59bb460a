use crate::errdata;
use crate::error::{Error, Result};

use itertools::Itertools as _;
use serde_derive::{Deserialize, Serialize};

/// A replica server ID, e.g. S1. IDs are opaque but totally ordered; the
/// order is only ever used as an election tiebreak.
pub type ReplicaId = String;

/// A local fault detector ID, e.g. LFD1.
pub type LfdId = String;

/// A client ID, e.g. C1.
pub type ClientId = String;

/// The application state: a monotonically non-decreasing counter. The RM
/// represents a never-reported state as -1, so the type is signed.
pub type State = i64;

/// A checkpoint sequence number, strictly increasing per primary.
pub type CheckpointNo = u64;

/// A client request number, strictly increasing per client.
pub type RequestNum = u64;

/// A replica role, as assigned by the RM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Backup,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "PRIMARY"),
            Role::Backup => write!(f, "BACKUP"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PRIMARY" => Ok(Role::Primary),
            "BACKUP" => Ok(Role::Backup),
            role => errdata!("invalid role {role}"),
        }
    }
}

/// A control message: one plain-text, space-separated line. These make up
/// the entire vocabulary between LFD↔server, LFD↔GFD, GFD→RM, server↔RM and
/// RM→client. The application messages between client and server are JSON
/// envelopes instead, see Envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Control {
    /// LFD → server: request to start heartbeating this server. Also
    /// LFD → GFD with the LFD ID present: bind the LFD to this connection.
    Register { server: ReplicaId, lfd: Option<LfdId> },
    /// Server → LFD: registration accepted.
    Ack,
    /// Server → LFD: registration rejected (wrong server ID).
    Nack,
    /// LFD → server heartbeat.
    Ping,
    /// Server → LFD heartbeat reply.
    Pong,
    /// LFD → GFD: the monitored replica came up.
    Add { server: ReplicaId, lfd: Option<LfdId> },
    /// LFD → GFD: the monitored replica is declared dead.
    Delete { server: ReplicaId, lfd: Option<LfdId> },
    /// GFD → LFD reverse heartbeat.
    GfdPing,
    /// LFD → GFD reverse heartbeat reply.
    GfdPong,
    /// GFD → RM: full membership snapshot. Empty is the empty set.
    Members { servers: Vec<ReplicaId> },
    /// Server → RM: identify this connection.
    HelloServer { server: ReplicaId },
    /// Client → RM: identify this connection.
    HelloClient { client: ClientId },
    /// Server → RM: state report (high-water merged by the RM).
    State { server: ReplicaId, state: State },
    /// RM → server: role assignment.
    Role { role: Role },
    /// RM → client: the current primary and its address.
    Primary { server: ReplicaId, addr: Option<String> },
}

impl std::str::FromStr for Control {
    type Err = Error;

    /// Parses a control line. The first whitespace-delimited word selects
    /// the message, case-insensitively; the rest are its fields.
    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let word = parts.next().unwrap_or("").to_uppercase();
        let fields: Vec<&str> = parts.collect();
        let message = match (word.as_str(), fields.as_slice()) {
            ("REGISTER", [server]) => {
                Control::Register { server: server.to_string(), lfd: None }
            }
            ("REGISTER", [server, lfd]) => {
                Control::Register { server: server.to_string(), lfd: Some(lfd.to_string()) }
            }
            ("ACK", []) => Control::Ack,
            ("NACK", []) => Control::Nack,
            ("PING", []) => Control::Ping,
            ("PONG", []) => Control::Pong,
            ("ADD", [server]) => Control::Add { server: server.to_string(), lfd: None },
            ("ADD", [server, lfd]) => {
                Control::Add { server: server.to_string(), lfd: Some(lfd.to_string()) }
            }
            ("DELETE", [server]) => Control::Delete { server: server.to_string(), lfd: None },
            ("DELETE", [server, lfd]) => {
                Control::Delete { server: server.to_string(), lfd: Some(lfd.to_string()) }
            }
            ("GFD_PING", []) => Control::GfdPing,
            ("GFD_PONG", []) => Control::GfdPong,
            // A bare MEMBERS line is the empty membership set.
            ("MEMBERS", []) => Control::Members { servers: Vec::new() },
            ("MEMBERS", [csv]) => Control::Members {
                servers: csv
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            },
            ("HELLO_SERVER", [server]) => Control::HelloServer { server: server.to_string() },
            ("HELLO_CLIENT", [client]) => Control::HelloClient { client: client.to_string() },
            ("STATE", [server, state]) => {
                Control::State { server: server.to_string(), state: state.parse()? }
            }
            ("ROLE", [role]) => Control::Role { role: role.parse()? },
            ("PRIMARY", [server]) => {
                Control::Primary { server: server.to_string(), addr: None }
            }
            ("PRIMARY", [server, addr]) => {
                Control::Primary { server: server.to_string(), addr: Some(addr.to_string()) }
            }
            _ => return errdata!("invalid control line {line:?}"),
        };
        Ok(message)
    }
}

impl std::fmt::Display for Control {
    /// Renders the control line, without the trailing newline.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::Register { server, lfd: None } => write!(f, "REGISTER {server}"),
            Control::Register { server, lfd: Some(lfd) } => write!(f, "REGISTER {server} {lfd}"),
            Control::Ack => write!(f, "ACK"),
            Control::Nack => write!(f, "NACK"),
            Control::Ping => write!(f, "PING"),
            Control::Pong => write!(f, "PONG"),
            Control::Add { server, lfd: None } => write!(f, "ADD {server}"),
            Control::Add { server, lfd: Some(lfd) } => write!(f, "ADD {server} {lfd}"),
            Control::Delete { server, lfd: None } => write!(f, "DELETE {server}"),
            Control::Delete { server, lfd: Some(lfd) } => write!(f, "DELETE {server} {lfd}"),
            Control::GfdPing => write!(f, "GFD_PING"),
            Control::GfdPong => write!(f, "GFD_PONG"),
            Control::Members { servers } if servers.is_empty() => write!(f, "MEMBERS"),
            Control::Members { servers } => write!(f, "MEMBERS {}", servers.iter().join(",")),
            Control::HelloServer { server } => write!(f, "HELLO_SERVER {server}"),
            Control::HelloClient { client } => write!(f, "HELLO_CLIENT {client}"),
            Control::State { server, state } => write!(f, "STATE {server} {state}"),
            Control::Role { role } => write!(f, "ROLE {role}"),
            Control::Primary { server, addr: None } => write!(f, "PRIMARY {server}"),
            Control::Primary { server, addr: Some(addr) } => write!(f, "PRIMARY {server} {addr}"),
        }
    }
}

/// Parses a replica address table of comma-separated ID=host:port pairs,
/// e.g. "S1=127.0.0.1:9001,S2=127.0.0.1:9002", preserving the given order.
pub fn parse_addr_table(table: &str) -> Result<Vec<(ReplicaId, String)>> {
    let mut addrs = Vec::new();
    for pair in table.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let Some((id, addr)) = pair.split_once('=') else {
            return crate::errinput!("invalid ID=address pair {pair:?}");
        };
        let (id, addr) = (id.trim(), addr.trim());
        if id.is_empty() || addr.is_empty() {
            return crate::errinput!("invalid ID=address pair {pair:?}");
        }
        addrs.push((id.to_string(), addr.to_string()));
    }
    Ok(addrs)
}

/// An application message: one JSON object per line, dispatched on the
/// "type" field. REQ and RESP travel between client and primary, CHECKPOINT
/// from the primary to each backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// A client request. The message is arbitrary and echoed back.
    #[serde(rename = "REQ")]
    Req { client_id: ClientId, request_num: RequestNum, message: String },

    /// The primary's reply, carrying the counter value after the increment.
    #[serde(rename = "RESP")]
    Resp {
        server_id: ReplicaId,
        client_id: ClientId,
        request_num: RequestNum,
        server_state: State,
        message: String,
    },

    /// A wholesale state snapshot from the primary to a backup.
    #[serde(rename = "CHECKPOINT")]
    Checkpoint { replica_id: ReplicaId, server_state: State, checkpoint_num: CheckpointNo },
}

impl Envelope {
    /// Decodes an envelope from a wire line.
    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Encodes the envelope as a wire line, without the trailing newline.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Round-trips a control line through parse and render.
    #[track_caller]
    fn roundtrip(line: &str) {
        let message: Control = line.parse().expect("parse failed");
        assert_eq!(message.to_string(), line);
    }

    #[test]
    fn control_roundtrip() {
        roundtrip("REGISTER S1");
        roundtrip("REGISTER S1 LFD1");
        roundtrip("ACK");
        roundtrip("NACK");
        roundtrip("PING");
        roundtrip("PONG");
        roundtrip("ADD S1");
        roundtrip("ADD S1 LFD1");
        roundtrip("DELETE S2 LFD2");
        roundtrip("GFD_PING");
        roundtrip("GFD_PONG");
        roundtrip("MEMBERS");
        roundtrip("MEMBERS S1,S2,S3");
        roundtrip("HELLO_SERVER S1");
        roundtrip("HELLO_CLIENT C1");
        roundtrip("STATE S1 7");
        roundtrip("ROLE PRIMARY");
        roundtrip("ROLE BACKUP");
        roundtrip("PRIMARY S2 127.0.0.1:9002");
    }

    #[test]
    fn control_parse_empty_members() {
        assert_eq!("MEMBERS".parse::<Control>(), Ok(Control::Members { servers: Vec::new() }));
        // Stray separators are tolerated.
        assert_eq!(
            "MEMBERS S1,,S2,".parse::<Control>(),
            Ok(Control::Members { servers: vec!["S1".into(), "S2".into()] })
        );
    }

    #[test]
    fn control_parse_case_insensitive() {
        assert_eq!(
            "role primary".parse::<Control>(),
            Ok(Control::Role { role: Role::Primary })
        );
        assert_eq!("ping".parse::<Control>(), Ok(Control::Ping));
    }

    #[test]
    fn control_parse_invalid() {
        assert!("".parse::<Control>().is_err());
        assert!("BOGUS".parse::<Control>().is_err());
        assert!("PING extra".parse::<Control>().is_err());
        assert!("STATE S1 notanumber".parse::<Control>().is_err());
        assert!("ROLE VIEWER".parse::<Control>().is_err());
    }

    #[test]
    fn addr_table_parses_in_order() {
        assert_eq!(
            parse_addr_table("S1=127.0.0.1:9001, S2=127.0.0.1:9002,").unwrap(),
            vec![
                ("S1".to_string(), "127.0.0.1:9001".to_string()),
                ("S2".to_string(), "127.0.0.1:9002".to_string()),
            ]
        );
        assert_eq!(parse_addr_table("").unwrap(), Vec::new());
        assert!(parse_addr_table("S1").is_err());
        assert!(parse_addr_table("=127.0.0.1:9001").is_err());
    }

    #[test]
    fn envelope_wire_format() {
        let req = Envelope::Req {
            client_id: "C1".into(),
            request_num: 1,
            message: "hello".into(),
        };
        assert_eq!(
            req.encode().unwrap(),
            r#"{"type":"REQ","client_id":"C1","request_num":1,"message":"hello"}"#
        );

        let ckpt = Envelope::Checkpoint {
            replica_id: "S1".into(),
            server_state: 10,
            checkpoint_num: 5,
        };
        assert_eq!(
            ckpt.encode().unwrap(),
            r#"{"type":"CHECKPOINT","replica_id":"S1","server_state":10,"checkpoint_num":5}"#
        );
    }

    #[test]
    fn envelope_decode() {
        let line = r#"{"type":"RESP","server_id":"S2","client_id":"C1","request_num":3,"server_state":8,"message":"hi"}"#;
        assert_eq!(
            Envelope::decode(line).unwrap(),
            Envelope::Resp {
                server_id: "S2".into(),
                client_id: "C1".into(),
                request_num: 3,
                server_state: 8,
                message: "hi".into(),
            }
        );
        assert!(Envelope::decode("{not json").is_err());
        assert!(Envelope::decode(r#"{"type":"NOPE"}"#).is_err());
    }
}
