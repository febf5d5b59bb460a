//! The replica server: the stateful endpoint of the control plane. It
//! accepts inbound connections from LFDs (REGISTER/PING), clients (REQ) and
//! the peer primary (CHECKPOINT), multiplexed by the first line of each
//! message. It keeps one outbound control channel to the RM (HELLO_SERVER,
//! STATE reports, ROLE assignments) and, while primary, one outbound
//! checkpoint connection per backup.

mod state;

pub use state::{CheckpointOutcome, ReplicaState};

use crate::backoff::Backoff;
use crate::error::Result;
use crate::message::{Control, Envelope, ReplicaId, Role, State};
use crate::wire::{Connection, LineWriter};

use itertools::Itertools as _;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Base delay between RM reconnection attempts.
const RM_RETRY_BASE: Duration = Duration::from_secs(1);
/// Maximum delay between RM reconnection attempts.
const RM_RETRY_MAX: Duration = Duration::from_secs(10);
/// Reconnection attempts per RM retry round. The channel is retried
/// indefinitely, pausing RM_RETRY_MAX between exhausted rounds.
const RM_RETRIES: u32 = 5;

/// A replica server.
pub struct Server {
    /// The replica state, behind the single state mutex. Snapshots are
    /// taken under lock and released before any network write.
    state: Mutex<ReplicaState>,
    /// Configured backup replicas (ID → address), dialed lazily by the
    /// checkpoint ticker.
    backups: HashMap<ReplicaId, String>,
    /// Live checkpoint connections to backups. Own mutex, so checkpoint IO
    /// never holds the state mutex.
    backup_conns: Mutex<HashMap<ReplicaId, LineWriter>>,
    /// The RM control channel's write half, if currently connected. Own
    /// mutex, shared between the RM reader thread and STATE reporters.
    rm_conn: Mutex<Option<LineWriter>>,
    /// The RM address, or None to run without an RM.
    rm_addr: Option<String>,
    /// Interval between checkpoint broadcasts. Zero disables the ticker.
    ckpt_interval: Duration,
}

impl Server {
    pub fn new(
        id: ReplicaId,
        init_state: State,
        role: Role,
        backups: HashMap<ReplicaId, String>,
        ckpt_interval: Duration,
        rm_addr: Option<String>,
    ) -> Self {
        Self {
            state: Mutex::new(ReplicaState::new(id, init_state, role)),
            backups,
            backup_conns: Mutex::new(HashMap::new()),
            rm_conn: Mutex::new(None),
            rm_addr,
            ckpt_interval,
        }
    }

    /// Serves inbound connections on the given listener, spawning one
    /// thread per connection, plus the checkpoint ticker and the RM control
    /// channel. Runs until the listener fails.
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        let server = Arc::new(self);
        {
            let state = server.state.lock()?;
            info!(
                "replica {} listening on {} as {} (state={})",
                state.id(),
                listener.local_addr()?,
                state.role(),
                state.state()
            );
        }

        if !server.ckpt_interval.is_zero() {
            let server = server.clone();
            std::thread::spawn(move || {
                if let Err(err) = server.checkpoint_loop() {
                    error!("checkpoint ticker failed: {err}");
                }
            });
        }
        if server.rm_addr.is_some() {
            let server = server.clone();
            std::thread::spawn(move || {
                if let Err(err) = server.rm_loop() {
                    error!("RM channel failed: {err}");
                }
            });
        }

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("accept failed: {err}");
                    continue;
                }
            };
            let server = server.clone();
            std::thread::spawn(move || {
                if let Err(err) = server.handle_connection(stream) {
                    debug!("connection closed: {err}");
                }
            });
        }
        Ok(())
    }

    /// Handles one inbound connection until it closes. The peer kind is
    /// never announced up front: LFD lines, client requests and peer
    /// checkpoints are told apart per line.
    fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut conn = Connection::from_stream(stream)?;
        let peer = conn.peer_addr()?;
        debug!("peer {peer} connected");

        loop {
            let line = conn.read_line()?;
            if line.is_empty() {
                continue;
            }
            if let Ok(control) = line.parse::<Control>() {
                match control {
                    Control::Register { server, lfd: None } => {
                        let id = self.state.lock()?.id().clone();
                        if server == id {
                            conn.write_line(Control::Ack)?;
                            info!("LFD at {peer} registered to monitor this replica");
                        } else {
                            warn!("rejecting LFD registration for {server}, this is {id}");
                            conn.write_line(Control::Nack)?;
                            return Ok(());
                        }
                    }
                    Control::Ping => {
                        conn.write_line(Control::Pong)?;
                        debug!("heartbeat from {peer}, sent PONG");
                    }
                    control => {
                        warn!("unexpected control line from {peer}: {control}");
                        conn.write_line("ERROR: unknown request type")?;
                    }
                }
                continue;
            }
            match Envelope::decode(&line) {
                Ok(Envelope::Req { client_id, request_num, message }) => {
                    let (server_id, applied) = {
                        let mut state = self.state.lock()?;
                        (state.id().clone(), state.apply_request(&client_id, request_num))
                    };
                    let Some((before, after)) = applied else {
                        info!(
                            "holding request {request_num} from {client_id}: \
                             not serving (newborn or backup)"
                        );
                        continue;
                    };
                    info!("request {request_num} from {client_id}: state {before} -> {after}");
                    self.report_state()?;
                    let resp = Envelope::Resp {
                        server_id,
                        client_id,
                        request_num,
                        server_state: after,
                        message,
                    };
                    conn.write_line(resp.encode()?)?;
                }
                Ok(Envelope::Checkpoint { replica_id, server_state, checkpoint_num }) => {
                    let outcome = {
                        let mut state = self.state.lock()?;
                        state.apply_checkpoint(server_state, checkpoint_num)
                    };
                    match outcome {
                        CheckpointOutcome::Applied { became_ready } => {
                            info!(
                                "applied checkpoint {checkpoint_num} from {replica_id} \
                                 (state={server_state}){}",
                                if became_ready { ", now ready" } else { "" }
                            );
                            self.report_state()?;
                        }
                        CheckpointOutcome::Stale => {
                            info!(
                                "ignore stale checkpoint from {replica_id}: \
                                 recv={checkpoint_num} <= local={}",
                                self.state.lock()?.checkpoint_no()
                            );
                        }
                        CheckpointOutcome::IsPrimary => {
                            info!("received CHECKPOINT from {replica_id} while primary, ignoring");
                        }
                    }
                }
                Ok(envelope) => {
                    warn!("unexpected envelope from {peer}: {envelope:?}");
                    conn.write_line("ERROR: unknown request type")?;
                }
                Err(err) => {
                    warn!("unparseable line from {peer}: {err}");
                    conn.write_line("ERROR: invalid JSON format")?;
                }
            }
        }
    }

    /// Reports the current state to the RM, if connected. A write failure
    /// drops the RM connection; the RM loop re-establishes it.
    fn report_state(&self) -> Result<()> {
        let (server, state) = {
            let state = self.state.lock()?;
            (state.id().clone(), state.state())
        };
        let mut rm_conn = self.rm_conn.lock()?;
        let Some(writer) = rm_conn.as_mut() else { return Ok(()) };
        if let Err(err) = writer.write_line(Control::State { server: server.clone(), state }) {
            error!("failed to send STATE to RM: {err}");
            writer.shutdown();
            *rm_conn = None;
        } else {
            debug!("reported state={state} to RM");
        }
        Ok(())
    }

    /// The checkpoint ticker: every interval, dial any missing backups and
    /// broadcast one checkpoint to all connected ones. Runs for the life of
    /// the server; demotion simply makes ticks no-ops.
    fn checkpoint_loop(&self) -> Result<()> {
        let ticker = crossbeam::channel::tick(self.ckpt_interval);
        for _ in ticker.iter() {
            self.dial_backups()?;
            self.send_checkpoint()?;
        }
        Ok(())
    }

    /// Dials any configured backups without a live connection. One attempt
    /// each, no retry within a tick.
    fn dial_backups(&self) -> Result<()> {
        if self.state.lock()?.role() != Role::Primary {
            return Ok(());
        }
        let missing: Vec<(ReplicaId, String)> = {
            let conns = self.backup_conns.lock()?;
            self.backups
                .iter()
                .filter(|(id, _)| !conns.contains_key(*id))
                .map(|(id, addr)| (id.clone(), addr.clone()))
                .sorted()
                .collect()
        };
        for (id, addr) in missing {
            match Connection::connect(&addr) {
                Ok(conn) => {
                    let (_, writer) = conn.split();
                    self.backup_conns.lock()?.insert(id.clone(), writer);
                    info!("checkpoint channel established to backup {id}@{addr}");
                }
                Err(err) => debug!("dial backup {id}@{addr} failed: {err}"),
            }
        }
        Ok(())
    }

    /// Broadcasts one checkpoint to every connected backup. The snapshot is
    /// taken and the checkpoint number consumed under the state lock; the
    /// sends happen outside it. A failed send drops that backup connection,
    /// to be re-dialed next tick.
    fn send_checkpoint(&self) -> Result<()> {
        let Some(checkpoint) = self.state.lock()?.next_checkpoint() else { return Ok(()) };
        let line = checkpoint.encode()?;
        let Envelope::Checkpoint { server_state, checkpoint_num, .. } = checkpoint else {
            unreachable!();
        };

        let mut conns = self.backup_conns.lock()?;
        let mut dead = Vec::new();
        for (id, writer) in conns.iter_mut().sorted_by_key(|(id, _)| id.clone()) {
            match writer.write_line(&line) {
                Ok(()) => {
                    info!("checkpoint {checkpoint_num} sent to {id} (state={server_state})")
                }
                Err(err) => {
                    error!("send checkpoint to {id} failed, dropping connection: {err}");
                    writer.shutdown();
                    dead.push(id.clone());
                }
            }
        }
        for id in dead {
            conns.remove(&id);
        }
        Ok(())
    }

    /// Maintains the RM control channel: dial with bounded backoff, send
    /// HELLO_SERVER, then apply ROLE assignments until the channel fails,
    /// and start over. Runs for the life of the server.
    fn rm_loop(&self) -> Result<()> {
        let Some(addr) = self.rm_addr.clone() else { return Ok(()) };
        loop {
            let Some(conn) = self.rm_connect(&addr) else {
                warn!("RM at {addr} unreachable, retrying");
                std::thread::sleep(RM_RETRY_MAX);
                continue;
            };
            if let Err(err) = self.rm_session(conn) {
                error!("RM connection lost: {err}");
            }
            if let Some(writer) = self.rm_conn.lock()?.take() {
                writer.shutdown();
            }
        }
    }

    /// Dials the RM, retrying with exponential backoff. Returns None when
    /// the round's retries are exhausted.
    fn rm_connect(&self, addr: &str) -> Option<Connection> {
        let mut backoff = Backoff::new(RM_RETRY_BASE, RM_RETRY_MAX, RM_RETRIES);
        loop {
            match Connection::connect(addr) {
                Ok(conn) => return Some(conn),
                Err(err) => {
                    let delay = backoff.next()?;
                    debug!("dial RM {addr} failed: {err}, retrying in {delay:?}");
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Runs one established RM session: identify, report current state,
    /// then apply ROLE lines until the connection fails.
    fn rm_session(&self, conn: Connection) -> Result<()> {
        let (mut reader, mut writer) = conn.split();
        let server = self.state.lock()?.id().clone();
        writer.write_line(Control::HelloServer { server })?;
        *self.rm_conn.lock()? = Some(writer);
        info!("connected to RM");
        // Let the RM see our state before it next elects.
        self.report_state()?;

        loop {
            let line = reader.read_line()?;
            if line.is_empty() {
                continue;
            }
            match line.parse::<Control>() {
                Ok(Control::Role { role }) => {
                    let old = self.state.lock()?.set_role(role);
                    if old != role {
                        info!("role changed by RM: {old} -> {role}");
                    } else {
                        info!("role confirmed by RM: {role}");
                    }
                }
                Ok(control) => debug!("ignoring control line from RM: {control}"),
                Err(err) => debug!("ignoring unparseable line from RM: {err}"),
            }
        }
    }
}
