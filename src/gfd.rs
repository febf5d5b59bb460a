//! The global fault detector: the membership aggregator. LFDs connect and
//! register, then report ADD/DELETE for the replica each of them monitors;
//! the GFD keeps the union of live replicas and pushes the full membership
//! list to the RM on every real change. The GFD heartbeats each registered
//! LFD in reverse (GFD_PING/GFD_PONG) and evicts an LFD — and its replica —
//! when the replies stop. A mere socket close does not evict the replica: a
//! briefly restarting LFD must not take a healthy replica down with it.

use crate::error::Result;
use crate::message::{Control, LfdId, ReplicaId};
use crate::wire::{Connection, LineReader, LineWriter};

use itertools::Itertools as _;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A registered LFD.
struct LfdInfo {
    /// The replica this LFD monitors.
    server: ReplicaId,
    /// When the last GFD_PONG (or the registration) was seen.
    last_hb: Instant,
}

/// The membership registry: the live replica set, the LFD responsible for
/// each replica, and the registered LFDs with their heartbeat times. Pure
/// bookkeeping; all IO stays in Gfd. Mutators return true when the
/// membership list itself changed, which is the caller's cue to publish.
#[derive(Default)]
pub struct Registry {
    membership: Vec<ReplicaId>,
    server_to_lfd: HashMap<ReplicaId, LfdId>,
    lfds: HashMap<LfdId, LfdInfo>,
}

impl Registry {
    /// Binds an LFD to the registry, (re)starting its heartbeat clock.
    pub fn register(&mut self, lfd: LfdId, server: ReplicaId, now: Instant) {
        self.lfds.insert(lfd, LfdInfo { server, last_hb: now });
    }

    /// Records a reverse-heartbeat reply from an LFD.
    pub fn pong(&mut self, lfd: &LfdId, now: Instant) {
        if let Some(info) = self.lfds.get_mut(lfd) {
            info.last_hb = now;
        }
    }

    /// Adds a replica reported live by the given LFD. Re-adding a present
    /// replica only updates its owning LFD; the membership list is
    /// unchanged. Returns true when the list changed.
    pub fn add(&mut self, server: ReplicaId, lfd: LfdId) -> bool {
        let present = self.membership.contains(&server);
        if !present {
            self.membership.push(server.clone());
        }
        self.server_to_lfd.insert(server, lfd);
        !present
    }

    /// Removes a replica declared dead. A no-op if absent. Returns true
    /// when the list changed.
    pub fn delete(&mut self, server: &ReplicaId) -> bool {
        let Some(index) = self.membership.iter().position(|s| s == server) else {
            return false;
        };
        self.membership.remove(index);
        self.server_to_lfd.remove(server);
        true
    }

    /// Unbinds an LFD whose socket closed, returning the replica it was
    /// monitoring. The replica stays in membership; only a heartbeat
    /// timeout or an explicit DELETE evicts it.
    pub fn disconnect(&mut self, lfd: &LfdId) -> Option<ReplicaId> {
        self.lfds.remove(lfd).map(|info| info.server)
    }

    /// Returns the LFDs whose last heartbeat is older than the timeout.
    pub fn expired(&self, timeout: Duration, now: Instant) -> Vec<LfdId> {
        self.lfds
            .iter()
            .filter(|(_, info)| now.duration_since(info.last_hb) > timeout)
            .map(|(lfd, _)| lfd.clone())
            .sorted()
            .collect()
    }

    /// Evicts a failed LFD and the replica it monitors. Returns true when
    /// the membership list changed.
    pub fn fail_lfd(&mut self, lfd: &LfdId) -> bool {
        let Some(info) = self.lfds.remove(lfd) else { return false };
        self.delete(&info.server)
    }

    /// The current membership, in arrival order.
    pub fn members(&self) -> &[ReplicaId] {
        &self.membership
    }

    /// True if the LFD is currently registered.
    pub fn is_registered(&self, lfd: &LfdId) -> bool {
        self.lfds.contains_key(lfd)
    }
}

/// Everything behind the GFD's single mutex: the registry plus the write
/// halves of the LFD connections and the RM channel.
struct Inner {
    registry: Registry,
    conns: HashMap<LfdId, LineWriter>,
    rm: Option<LineWriter>,
}

/// A global fault detector.
pub struct Gfd {
    hb_interval: Duration,
    timeout: Duration,
    rm_addr: Option<String>,
    inner: Mutex<Inner>,
}

impl Gfd {
    pub fn new(hb_interval: Duration, timeout: Duration, rm_addr: Option<String>) -> Self {
        Self {
            hb_interval,
            timeout,
            rm_addr,
            inner: Mutex::new(Inner {
                registry: Registry::default(),
                conns: HashMap::new(),
                rm: None,
            }),
        }
    }

    /// Serves LFD connections on the given listener, one thread each, plus
    /// the reverse-heartbeat ticker. Runs until the listener fails.
    pub fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            "GFD listening on {} (heartbeat interval={:?} timeout={:?})",
            listener.local_addr()?,
            self.hb_interval,
            self.timeout
        );
        let gfd = Arc::new(self);
        // Report the initial (empty) membership so the RM has a baseline.
        gfd.notify_rm()?;

        {
            let gfd = gfd.clone();
            std::thread::spawn(move || {
                if let Err(err) = gfd.heartbeat_loop() {
                    error!("LFD heartbeat ticker failed: {err}");
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
            let gfd = gfd.clone();
            std::thread::spawn(move || {
                if let Err(err) = gfd.handle_lfd(stream) {
                    debug!("LFD connection closed: {err}");
                }
            });
        }
        Ok(())
    }

    /// Handles one LFD connection until it closes, then unbinds the LFD
    /// without touching membership.
    fn handle_lfd(&self, stream: TcpStream) -> Result<()> {
        let conn = Connection::from_stream(stream)?;
        let peer = conn.peer_addr()?;
        let (reader, writer) = conn.split();
        debug!("LFD connected from {peer}");

        let mut registered: Option<LfdId> = None;
        let result = self.lfd_session(reader, writer, peer, &mut registered);

        if let Some(lfd) = registered {
            let mut inner = self.inner.lock()?;
            if let Some(server) = inner.registry.disconnect(&lfd) {
                info!("LFD {lfd} disconnected, keeping {server} in membership");
            }
            if let Some(writer) = inner.conns.remove(&lfd) {
                writer.shutdown();
            }
        }
        result
    }

    /// Reads and applies one LFD's lines until the connection closes. On
    /// REGISTER the connection's write half moves into the shared table,
    /// where the reverse-heartbeat ticker finds it.
    fn lfd_session(
        &self,
        mut reader: LineReader,
        writer: LineWriter,
        peer: SocketAddr,
        registered: &mut Option<LfdId>,
    ) -> Result<()> {
        let mut writer = Some(writer);
        loop {
            let line = reader.read_line()?;
            let control = match line.parse::<Control>() {
                Ok(control) => control,
                Err(err) => {
                    warn!("ignoring line from {peer}: {err}");
                    continue;
                }
            };
            match control {
                Control::Register { server, lfd: Some(lfd) } => {
                    let mut inner = self.inner.lock()?;
                    inner.registry.register(lfd.clone(), server.clone(), Instant::now());
                    if let Some(writer) = writer.take() {
                        inner.conns.insert(lfd.clone(), writer);
                    }
                    info!("LFD {lfd} registered to monitor {server}");
                    *registered = Some(lfd);
                }
                Control::GfdPong => {
                    if let Some(lfd) = registered.as_ref() {
                        debug!("GFD_PONG from {lfd}");
                        self.inner.lock()?.registry.pong(lfd, Instant::now());
                    }
                }
                Control::Add { server, .. } => {
                    let Some(lfd) = registered.clone() else {
                        warn!("ignoring ADD from unregistered LFD at {peer}");
                        continue;
                    };
                    let changed = {
                        let mut inner = self.inner.lock()?;
                        let changed = inner.registry.add(server.clone(), lfd.clone());
                        self.log_membership(&inner.registry);
                        changed
                    };
                    if changed {
                        info!("added {server} to membership (monitored by {lfd})");
                        self.notify_rm()?;
                    } else {
                        info!("{server} already in membership, now monitored by {lfd}");
                    }
                }
                Control::Delete { server, .. } => {
                    let Some(lfd) = registered.clone() else {
                        warn!("ignoring DELETE from unregistered LFD at {peer}");
                        continue;
                    };
                    let changed = {
                        let mut inner = self.inner.lock()?;
                        let changed = inner.registry.delete(&server);
                        self.log_membership(&inner.registry);
                        changed
                    };
                    if changed {
                        info!("deleted {server} from membership (reported by {lfd})");
                        self.notify_rm()?;
                    } else {
                        info!("{server} not in membership (DELETE from {lfd})");
                    }
                }
                control => warn!("unexpected line from {peer}: {control}"),
            }
        }
    }

    /// The reverse-heartbeat ticker: evict LFDs that have stopped replying,
    /// then GFD_PING the rest. Sends happen outside the lock on cloned
    /// write halves; a failed send evicts like a timeout does.
    fn heartbeat_loop(&self) -> Result<()> {
        let ticker = crossbeam::channel::tick(self.hb_interval);
        for _ in ticker.iter() {
            let now = Instant::now();
            let mut evicted = false;
            let targets = {
                let mut inner = self.inner.lock()?;
                for lfd in inner.registry.expired(self.timeout, now) {
                    warn!("LFD {lfd} missed heartbeats for over {:?}, evicting", self.timeout);
                    evicted |= inner.registry.fail_lfd(&lfd);
                    if let Some(writer) = inner.conns.remove(&lfd) {
                        writer.shutdown();
                    }
                    self.log_membership(&inner.registry);
                }
                let mut targets = Vec::new();
                for (lfd, writer) in inner.conns.iter().sorted_by_key(|(lfd, _)| lfd.clone()) {
                    targets.push((lfd.clone(), writer.try_clone()?));
                }
                targets
            };
            if evicted {
                self.notify_rm()?;
            }

            for (lfd, mut writer) in targets {
                debug!("heartbeat to {lfd}");
                if let Err(err) = writer.write_line(Control::GfdPing) {
                    warn!("heartbeat to {lfd} failed ({err}), evicting");
                    let changed = {
                        let mut inner = self.inner.lock()?;
                        let changed = inner.registry.fail_lfd(&lfd);
                        if let Some(writer) = inner.conns.remove(&lfd) {
                            writer.shutdown();
                        }
                        self.log_membership(&inner.registry);
                        changed
                    };
                    if changed {
                        self.notify_rm()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Publishes the full membership list to the RM, dialing it on demand.
    /// A write failure drops the channel; the next mutation redials.
    fn notify_rm(&self) -> Result<()> {
        let Some(addr) = &self.rm_addr else { return Ok(()) };
        let mut inner = self.inner.lock()?;
        if inner.rm.is_none() {
            match Connection::connect(addr) {
                Ok(conn) => {
                    info!("connected to RM at {addr}");
                    inner.rm = Some(conn.split().1);
                }
                Err(err) => {
                    error!("failed to connect RM at {addr}: {err}");
                    return Ok(());
                }
            }
        }
        let members = Control::Members { servers: inner.registry.members().to_vec() };
        if let Some(writer) = inner.rm.as_mut() {
            if let Err(err) = writer.write_line(&members) {
                error!("failed to notify RM ({members}): {err}");
                writer.shutdown();
                inner.rm = None;
            }
        }
        Ok(())
    }

    /// Logs the current membership, the GFD's one-line status.
    fn log_membership(&self, registry: &Registry) {
        let members = registry.members();
        info!("membership ({}): {}", members.len(), members.iter().join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry_with(servers: &[(&str, &str)], now: Instant) -> Registry {
        let mut registry = Registry::default();
        for (server, lfd) in servers {
            registry.register(lfd.to_string(), server.to_string(), now);
            assert!(registry.add(server.to_string(), lfd.to_string()));
        }
        registry
    }

    #[test]
    fn add_is_idempotent() {
        let now = Instant::now();
        let mut registry = registry_with(&[("S1", "LFD1"), ("S2", "LFD2")], now);
        assert_eq!(registry.members(), &["S1", "S2"]);
        // Re-ADD only reassigns ownership; membership is unchanged.
        assert!(!registry.add("S1".into(), "LFD9".into()));
        assert_eq!(registry.members(), &["S1", "S2"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let now = Instant::now();
        let mut registry = registry_with(&[("S1", "LFD1")], now);
        assert!(registry.delete(&"S1".into()));
        assert!(!registry.delete(&"S1".into()));
        assert_eq!(registry.members(), &[] as &[ReplicaId]);
    }

    #[test]
    fn disconnect_keeps_membership() {
        let now = Instant::now();
        let mut registry = registry_with(&[("S1", "LFD1")], now);
        assert_eq!(registry.disconnect(&"LFD1".into()), Some("S1".into()));
        assert_eq!(registry.members(), &["S1"]);
        assert!(!registry.is_registered(&"LFD1".into()));
    }

    #[test]
    fn heartbeat_timeout_evicts_lfd_and_server() {
        let now = Instant::now();
        let mut registry = registry_with(&[("S1", "LFD1"), ("S2", "LFD2")], now);
        let timeout = Duration::from_secs(3);

        // Only LFD2 answers heartbeats.
        let later = now + Duration::from_secs(5);
        registry.pong(&"LFD2".into(), later);
        assert_eq!(registry.expired(timeout, later), vec!["LFD1".to_string()]);

        assert!(registry.fail_lfd(&"LFD1".into()));
        assert_eq!(registry.members(), &["S2"]);
        // A second eviction of the same LFD is a no-op.
        assert!(!registry.fail_lfd(&"LFD1".into()));
    }

    #[test]
    fn readd_after_eviction_changes_membership() {
        let now = Instant::now();
        let mut registry = registry_with(&[("S1", "LFD1")], now);
        assert!(registry.fail_lfd(&"LFD1".into()));

        // The restarted LFD re-registers and re-adds its replica.
        registry.register("LFD1".into(), "S1".into(), now);
        assert!(registry.add("S1".into(), "LFD1".into()));
        assert_eq!(registry.members(), &["S1"]);
    }
}
