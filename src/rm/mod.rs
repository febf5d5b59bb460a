//! The replication manager: the single arbiter over role assignment and
//! client redirection. It accepts one listening socket and classifies each
//! connection by its first line: a MEMBERS line is the GFD, HELLO_CLIENT a
//! client, HELLO_SERVER a server. Membership snapshots and STATE reports
//! mutate the view, each mutation re-elects the primary, and every
//! re-election pushes fresh ROLE lines to all servers and — when the
//! identity changed — a PRIMARY line to all clients.

mod view;

pub use view::{choose_primary, Election, View};

use crate::error::Result;
use crate::message::{ClientId, Control, ReplicaId, Role};
use crate::wire::{Connection, LineReader, LineWriter};

use itertools::Itertools as _;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A registered peer connection's write half, tagged so the reader thread
/// that owns the connection only unregisters its own entry and never a
/// replacement that has since taken the slot.
struct Peer {
    token: u64,
    writer: LineWriter,
}

/// Everything behind the RM's single mutex.
struct Inner {
    view: View,
    clients: HashMap<ClientId, Peer>,
    servers: HashMap<ReplicaId, Peer>,
}

/// A replication manager.
pub struct Rm {
    /// The replica address table, used to tell clients where the primary is.
    addrs: HashMap<ReplicaId, String>,
    inner: Mutex<Inner>,
    next_token: AtomicU64,
}

impl Rm {
    pub fn new(addrs: HashMap<ReplicaId, String>) -> Self {
        Self {
            addrs,
            inner: Mutex::new(Inner {
                view: View::default(),
                clients: HashMap::new(),
                servers: HashMap::new(),
            }),
            next_token: AtomicU64::new(0),
        }
    }

    /// Serves peer connections on the given listener, one thread per
    /// connection. Runs until the listener fails.
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        info!("RM listening on {}", listener.local_addr()?);
        let rm = Arc::new(self);
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    error!("accept failed: {err}");
                    continue;
                }
            };
            let rm = rm.clone();
            std::thread::spawn(move || {
                if let Err(err) = rm.dispatch(stream) {
                    debug!("connection closed: {err}");
                }
            });
        }
        Ok(())
    }

    /// Classifies a fresh connection by its first line and hands it to the
    /// matching channel handler.
    fn dispatch(&self, stream: TcpStream) -> Result<()> {
        let conn = Connection::from_stream(stream)?;
        let peer = conn.peer_addr()?;
        let (mut reader, writer) = conn.split();

        let line = reader.read_line()?;
        match line.parse::<Control>() {
            Ok(Control::Members { servers }) => {
                info!("connection from {peer} identified as GFD");
                self.handle_gfd(reader, servers)
            }
            Ok(Control::HelloClient { client }) => {
                info!("connection from {peer} identified as client {client}");
                self.handle_client(reader, writer, client)
            }
            Ok(Control::HelloServer { server }) => {
                info!("connection from {peer} identified as server {server}");
                self.handle_server(reader, writer, server)
            }
            Ok(control) => {
                warn!("unexpected first line from {peer}: {control}");
                Ok(())
            }
            Err(err) => {
                warn!("unparseable first line from {peer}: {err}");
                Ok(())
            }
        }
    }

    /// The GFD channel: every MEMBERS line replaces the membership. A
    /// closed GFD connection freezes membership until the GFD reconnects.
    fn handle_gfd(&self, mut reader: LineReader, first: Vec<ReplicaId>) -> Result<()> {
        self.apply_membership(first)?;
        loop {
            let line = match reader.read_line() {
                Ok(line) => line,
                Err(err) => {
                    warn!("GFD connection closed, membership frozen: {err}");
                    return Ok(());
                }
            };
            match line.parse::<Control>() {
                Ok(Control::Members { servers }) => self.apply_membership(servers)?,
                Ok(control) => debug!("ignoring line from GFD: {control}"),
                Err(err) => debug!("ignoring line from GFD: {err}"),
            }
        }
    }

    /// The client channel: register, send the current primary if any, then
    /// only drain the connection to detect its close.
    fn handle_client(
        &self,
        mut reader: LineReader,
        writer: LineWriter,
        client: ClientId,
    ) -> Result<()> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock()?;
            if let Some(old) = inner.clients.insert(client.clone(), Peer { token, writer }) {
                info!("replacing previous connection for client {client}");
                old.writer.shutdown();
            }
            if let Some(primary) = inner.view.primary().cloned() {
                let message = Control::Primary {
                    addr: self.addrs.get(&primary).cloned(),
                    server: primary,
                };
                info!("sending initial {message} to client {client}");
                if let Some(peer) = inner.clients.get_mut(&client) {
                    if let Err(err) = peer.writer.write_line(&message) {
                        error!("failed to send PRIMARY to client {client}: {err}");
                        inner.clients.remove(&client);
                        return Ok(());
                    }
                }
            }
        }

        let result = loop {
            match reader.read_line() {
                Ok(_) => continue, // clients have nothing to say to the RM
                Err(err) => break err,
            }
        };
        debug!("client {client} disconnected: {result}");
        let mut inner = self.inner.lock()?;
        if inner.clients.get(&client).map(|peer| peer.token) == Some(token) {
            inner.clients.remove(&client);
        }
        Ok(())
    }

    /// The server channel: register, send the initial ROLE, then merge
    /// STATE reports until the connection closes.
    fn handle_server(
        &self,
        mut reader: LineReader,
        writer: LineWriter,
        server: ReplicaId,
    ) -> Result<()> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock()?;
            if let Some(old) = inner.servers.insert(server.clone(), Peer { token, writer }) {
                info!("replacing previous connection for server {server}");
                old.writer.shutdown();
            }
            let role = inner.view.role_of(&server);
            info!("sending initial ROLE {role} to server {server}");
            if let Some(peer) = inner.servers.get_mut(&server) {
                if let Err(err) = peer.writer.write_line(Control::Role { role }) {
                    error!("failed to send ROLE to server {server}: {err}");
                    inner.servers.remove(&server);
                    return Ok(());
                }
            }
        }

        let result = loop {
            let line = match reader.read_line() {
                Ok(line) => line,
                Err(err) => break err,
            };
            match line.parse::<Control>() {
                Ok(Control::State { server, state }) => {
                    let mut inner = self.inner.lock()?;
                    let known = inner.view.state_of(&server);
                    if let Some(election) = inner.view.update_state(server.clone(), state) {
                        info!("state of {server}: {known} -> {state}");
                        self.broadcast(&mut inner, &election)?;
                    }
                }
                Ok(control) => debug!("ignoring line from server {server}: {control}"),
                Err(err) => debug!("ignoring line from server {server}: {err}"),
            }
        };
        debug!("server {server} disconnected: {result}");
        let mut inner = self.inner.lock()?;
        if inner.servers.get(&server).map(|peer| peer.token) == Some(token) {
            inner.servers.remove(&server);
        }
        Ok(())
    }

    /// Applies a membership snapshot and broadcasts the re-election.
    fn apply_membership(&self, membership: Vec<ReplicaId>) -> Result<()> {
        let mut inner = self.inner.lock()?;
        info!("membership update: {}", membership.iter().join(","));
        let election = inner.view.update_membership(membership);
        self.broadcast(&mut inner, &election)?;
        Ok(())
    }

    /// Pushes the outcome of a re-election: a PRIMARY line to every client
    /// when the identity changed, and a fresh ROLE line to every server in
    /// every case. A failed write closes and drops that peer; peers are
    /// responsible for their own reconnection.
    fn broadcast(&self, inner: &mut Inner, election: &Election) -> Result<()> {
        match (&election.previous, &election.primary) {
            (previous, primary) if election.changed() => {
                info!(
                    "primary changed: {} -> {}",
                    previous.as_deref().unwrap_or("none"),
                    primary.as_deref().unwrap_or("none"),
                )
            }
            (_, primary) => {
                debug!("primary unchanged: {}", primary.as_deref().unwrap_or("none"))
            }
        }

        if election.changed() {
            if let Some(primary) = &election.primary {
                let message = Control::Primary {
                    server: primary.clone(),
                    addr: self.addrs.get(primary).cloned(),
                };
                info!("broadcasting {message} to clients");
                let mut dead = Vec::new();
                for (client, peer) in inner.clients.iter_mut().sorted_by_key(|(c, _)| c.clone()) {
                    if let Err(err) = peer.writer.write_line(&message) {
                        error!("failed to send PRIMARY to client {client}: {err}");
                        peer.writer.shutdown();
                        dead.push(client.clone());
                    }
                }
                for client in dead {
                    inner.clients.remove(&client);
                }
            }
        }

        let roles: Vec<(ReplicaId, Role)> = inner
            .servers
            .keys()
            .sorted()
            .map(|server| (server.clone(), inner.view.role_of(server)))
            .collect();
        let mut dead = Vec::new();
        for (server, role) in roles {
            if let Some(peer) = inner.servers.get_mut(&server) {
                debug!("sending ROLE {role} to server {server}");
                if let Err(err) = peer.writer.write_line(Control::Role { role }) {
                    error!("failed to send ROLE to server {server}: {err}");
                    peer.writer.shutdown();
                    dead.push(server.clone());
                }
            }
        }
        for server in dead {
            inner.servers.remove(&server);
        }
        Ok(())
    }
}
