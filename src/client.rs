//! The faultline client: a multi-replica-aware request issuer. It keeps a
//! connection per known replica but sends each request to the current
//! primary only, as told by the RM. Replica churn is absorbed
//! transparently: a failed send marks the replica unhealthy and defers the
//! request to a bounded queue while a background task reconnects with
//! exponential backoff; exhausting retries parks the replica as permanently
//! down until an RM PRIMARY message names it again. Responses are
//! deduplicated by request number, first one wins.

use crate::backoff::Backoff;
use crate::error::Result;
use crate::message::{ClientId, Control, Envelope, ReplicaId, RequestNum, State};
use crate::wire::Connection;

use log::{debug, error, info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How long to wait for a RESP to a request.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Deferred requests kept per replica; the oldest is dropped beyond this.
const MAX_QUEUE: usize = 100;
/// Base delay of the RM channel backoff.
const RM_RETRY_BASE: Duration = Duration::from_secs(1);
/// Cap and inter-round pause of the RM channel backoff.
const RM_RETRY_MAX: Duration = Duration::from_secs(10);
/// RM reconnection attempts per retry round.
const RM_RETRIES: u32 = 5;

/// A reply delivered for a request.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub server: ReplicaId,
    pub request_num: RequestNum,
    pub state: State,
}

/// The replica reconnection policy: exponential backoff until the retries
/// are exhausted, at which point the replica is parked as permanently down.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

/// A request deferred while its replica is down.
struct QueuedRequest {
    request_num: RequestNum,
    message: String,
    queued_at: Instant,
}

/// The connection record for one replica. The mutex covers the socket, the
/// queue and the flags; background reconnection holds a non-owning handle
/// and cooperates via the reconnecting flag.
struct ReplicaConn {
    addr: String,
    conn: Option<Connection>,
    healthy: bool,
    reconnecting: bool,
    permanently_down: bool,
    queue: VecDeque<QueuedRequest>,
}

struct Replica {
    id: ReplicaId,
    inner: Mutex<ReplicaConn>,
}

/// Client state under the global mutex. Lock order is strictly global →
/// replica, never the reverse.
struct Global {
    next_request: RequestNum,
    primary: Option<ReplicaId>,
    replicas: Vec<Arc<Replica>>,
    retry: RetryPolicy,
}

struct Shared {
    id: ClientId,
    global: Mutex<Global>,
    /// Request numbers already answered, for duplicate suppression.
    delivered: Mutex<HashSet<RequestNum>>,
}

/// A faultline client. Cheap to clone; clones share the same state and
/// connections.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    rm_addr: Option<String>,
}

impl Client {
    /// Creates a client over the given replica table. The primary, if
    /// known up front, can be seeded; the RM overrides it.
    pub fn new(
        id: ClientId,
        replicas: Vec<(ReplicaId, String)>,
        primary: Option<ReplicaId>,
        rm_addr: Option<String>,
    ) -> Self {
        let replicas = replicas
            .into_iter()
            .map(|(id, addr)| {
                Arc::new(Replica {
                    id,
                    inner: Mutex::new(ReplicaConn {
                        addr,
                        conn: None,
                        healthy: false,
                        reconnecting: false,
                        permanently_down: false,
                        queue: VecDeque::new(),
                    }),
                })
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                id,
                global: Mutex::new(Global {
                    next_request: 0,
                    primary,
                    replicas,
                    retry: RetryPolicy::default(),
                }),
                delivered: Mutex::new(HashSet::new()),
            }),
            rm_addr,
        }
    }

    /// Overrides the replica reconnection policy.
    pub fn set_retry_policy(&self, retry: RetryPolicy) -> Result<()> {
        self.shared.global.lock()?.retry = retry;
        Ok(())
    }

    /// Connects to the RM (in the background) and to all known replicas (in
    /// parallel). Fails only when no replica is reachable and there is no
    /// RM to learn a primary from; otherwise reconnection proceeds in the
    /// background.
    pub fn connect(&self) -> Result<()> {
        info!("{} connecting to all replicas", self.shared.id);
        if let Some(addr) = self.rm_addr.clone() {
            let shared = self.shared.clone();
            std::thread::spawn(move || {
                if let Err(err) = Self::rm_loop(&shared, &addr) {
                    error!("{} RM channel failed: {err}", shared.id);
                }
            });
        }

        let replicas = self.shared.global.lock()?.replicas.clone();
        let handles: Vec<_> = replicas
            .into_iter()
            .map(|replica| {
                let shared = self.shared.clone();
                std::thread::spawn(move || match Self::connect_replica(&replica) {
                    Ok(()) => info!("{} connected to {}", shared.id, replica.id),
                    Err(err) => {
                        warn!("{} initial connection to {} failed: {err}", shared.id, replica.id);
                        Self::spawn_reconnect(&shared, &replica);
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }

        let global = self.shared.global.lock()?;
        let any_healthy = global
            .replicas
            .iter()
            .any(|replica| replica.inner.lock().map(|conn| conn.healthy).unwrap_or(false));
        if !any_healthy && self.rm_addr.is_none() {
            return crate::errinput!("failed to connect to any replica");
        }
        if !any_healthy {
            info!(
                "{} no replica reachable yet, relying on RM for the primary",
                self.shared.id
            );
        }
        Ok(())
    }

    /// Sends one request to the current primary. Returns the delivered
    /// reply, or None when the request was dropped (no primary, primary
    /// permanently down) or deferred (primary temporarily down, queued for
    /// the reconnect flush).
    pub fn send(&self, message: &str) -> Result<Option<Delivery>> {
        let (request_num, primary, target) = {
            let mut global = self.shared.global.lock()?;
            global.next_request += 1;
            let primary = global.primary.clone();
            let target = primary
                .as_ref()
                .and_then(|id| global.replicas.iter().find(|r| &r.id == id).cloned());
            (global.next_request, primary, target)
        };

        let Some(primary) = primary else {
            warn!("{} no primary selected yet, dropping request {request_num}", self.shared.id);
            return Ok(None);
        };
        let Some(target) = target else {
            warn!(
                "{} no replica entry for primary {primary}, dropping request {request_num}",
                self.shared.id
            );
            return Ok(None);
        };

        debug!("{} sending request {request_num} to primary {primary}", self.shared.id);
        Self::send_to_replica(&self.shared, &target, request_num, message.to_string())
    }

    /// Sends one request on the given replica's connection and waits for
    /// its reply. Holding the replica mutex across the exchange serializes
    /// requests on the connection.
    fn send_to_replica(
        shared: &Arc<Shared>,
        replica: &Arc<Replica>,
        request_num: RequestNum,
        message: String,
    ) -> Result<Option<Delivery>> {
        let mut inner = replica.inner.lock()?;
        if inner.permanently_down {
            info!(
                "{} replica {} permanently down, skipping request {request_num}",
                shared.id, replica.id
            );
            return Ok(None);
        }
        if !inner.healthy || inner.conn.is_none() {
            Self::enqueue(shared, &replica.id, &mut inner, request_num, message);
            drop(inner);
            Self::spawn_reconnect(shared, replica);
            return Ok(None);
        }

        let request = Envelope::Req {
            client_id: shared.id.clone(),
            request_num,
            message: message.clone(),
        };
        let exchange = (|| {
            let Some(conn) = inner.conn.as_mut() else {
                return crate::errdata!("not connected");
            };
            conn.write_line(request.encode()?)?;
            conn.set_read_deadline(Some(RESPONSE_TIMEOUT))?;
            Self::read_reply(shared, conn, request_num)
        })();

        match exchange {
            Ok(delivery) => Ok(delivery),
            Err(err) => {
                warn!(
                    "{} request {request_num} to {} failed: {err}",
                    shared.id, replica.id
                );
                Self::mark_unhealthy(&mut inner);
                Self::enqueue(shared, &replica.id, &mut inner, request_num, message);
                drop(inner);
                Self::spawn_reconnect(shared, replica);
                Ok(None)
            }
        }
    }

    /// Reads lines until the reply for the given request arrives or the
    /// deadline expires. The first response for a request number wins; any
    /// later one is a duplicate and is discarded.
    fn read_reply(
        shared: &Arc<Shared>,
        conn: &mut Connection,
        request_num: RequestNum,
    ) -> Result<Option<Delivery>> {
        loop {
            let line = conn.read_line()?;
            let response = match Envelope::decode(&line) {
                Ok(Envelope::Resp { server_id, request_num, server_state, .. }) => {
                    Delivery { server: server_id, request_num, state: server_state }
                }
                Ok(envelope) => {
                    warn!("{} unexpected message from server: {envelope:?}", shared.id);
                    continue;
                }
                Err(err) => {
                    warn!("{} unparseable reply: {err}", shared.id);
                    continue;
                }
            };

            let mut delivered = shared.delivered.lock()?;
            if !delivered.insert(response.request_num) {
                info!(
                    "{} discarded duplicate reply for request {} from {}",
                    shared.id, response.request_num, response.server
                );
                continue;
            }
            info!(
                "{} reply for request {} from {} (state={})",
                shared.id, response.request_num, response.server, response.state
            );
            if response.request_num == request_num {
                return Ok(Some(response));
            }
            // A late reply to an earlier request: delivered above, but keep
            // waiting for our own.
        }
    }

    /// Defers a request on the replica's bounded queue, dropping the oldest
    /// entry when full.
    fn enqueue(
        shared: &Arc<Shared>,
        id: &ReplicaId,
        inner: &mut ReplicaConn,
        request_num: RequestNum,
        message: String,
    ) {
        if inner.permanently_down {
            info!("{} {id} permanently down, dropping queued request {request_num}", shared.id);
            return;
        }
        if inner.queue.len() >= MAX_QUEUE {
            warn!("{} queue for {id} full, dropping oldest request", shared.id);
            inner.queue.pop_front();
        }
        inner.queue.push_back(QueuedRequest { request_num, message, queued_at: Instant::now() });
        info!(
            "{} connection to {id} down, queued request {request_num} ({} queued)",
            shared.id,
            inner.queue.len()
        );
    }

    /// Closes the connection and marks the replica unhealthy.
    fn mark_unhealthy(inner: &mut ReplicaConn) {
        if let Some(conn) = inner.conn.take() {
            conn.shutdown();
        }
        inner.healthy = false;
    }

    /// Dials the replica and installs the connection. The address is read
    /// under the lock, the dial happens outside it.
    fn connect_replica(replica: &Arc<Replica>) -> Result<()> {
        let addr = replica.inner.lock()?.addr.clone();
        let conn = Connection::connect(&addr)?;
        let mut inner = replica.inner.lock()?;
        inner.conn = Some(conn);
        inner.healthy = true;
        inner.permanently_down = false;
        Ok(())
    }

    /// Spawns a reconnect task for the replica unless one is already
    /// running, the replica is healthy, or it is permanently down. The
    /// reconnecting flag makes the task the queue's single writer.
    fn spawn_reconnect(shared: &Arc<Shared>, replica: &Arc<Replica>) {
        {
            let Ok(mut inner) = replica.inner.lock() else { return };
            if inner.permanently_down || inner.healthy || inner.reconnecting {
                return;
            }
            inner.reconnecting = true;
        }
        let shared = shared.clone();
        let replica = replica.clone();
        std::thread::spawn(move || {
            if let Err(err) = Self::reconnect(&shared, &replica) {
                error!("{} reconnect task for {} failed: {err}", shared.id, replica.id);
            }
            if let Ok(mut inner) = replica.inner.lock() {
                inner.reconnecting = false;
            }
        });
    }

    /// Reconnects to a replica with exponential backoff. Success flushes
    /// the deferred queue; exhaustion parks the replica as permanently
    /// down, to be revived only by an RM PRIMARY message naming it.
    fn reconnect(shared: &Arc<Shared>, replica: &Arc<Replica>) -> Result<()> {
        let retry = shared.global.lock()?.retry;
        let backoff = Backoff::new(retry.base_delay, retry.max_delay, retry.max_retries);
        for (attempt, delay) in backoff.enumerate() {
            info!(
                "{} reconnecting to {} in {delay:?} (attempt {}/{})",
                shared.id,
                replica.id,
                attempt + 1,
                retry.max_retries
            );
            std::thread::sleep(delay);
            if replica.inner.lock()?.permanently_down {
                return Ok(());
            }
            match Self::connect_replica(replica) {
                Ok(()) => {
                    info!("{} reconnected to {}", shared.id, replica.id);
                    Self::flush_queue(shared, replica)?;
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "{} reconnection attempt {} to {} failed: {err}",
                        shared.id,
                        attempt + 1,
                        replica.id
                    );
                }
            }
        }
        error!(
            "{} reconnection to {} failed after {} attempts, marking permanently down",
            shared.id, replica.id, retry.max_retries
        );
        replica.inner.lock()?.permanently_down = true;
        Ok(())
    }

    /// Sends the replica's deferred requests in order.
    fn flush_queue(shared: &Arc<Shared>, replica: &Arc<Replica>) -> Result<()> {
        let queue: Vec<QueuedRequest> = {
            let mut inner = replica.inner.lock()?;
            inner.queue.drain(..).collect()
        };
        if queue.is_empty() {
            return Ok(());
        }
        info!("{} flushing {} queued requests to {}", shared.id, queue.len(), replica.id);
        for request in queue {
            debug!(
                "{} sending queued request {} (queued for {:?})",
                shared.id,
                request.request_num,
                request.queued_at.elapsed()
            );
            Self::send_to_replica(shared, replica, request.request_num, request.message)?;
        }
        Ok(())
    }

    /// Maintains the RM control channel: identify, then apply PRIMARY
    /// updates until the channel fails, reconnecting with bounded backoff.
    fn rm_loop(shared: &Arc<Shared>, addr: &str) -> Result<()> {
        loop {
            let conn = {
                let mut backoff = Backoff::new(RM_RETRY_BASE, RM_RETRY_MAX, RM_RETRIES);
                loop {
                    match Connection::connect(addr) {
                        Ok(conn) => break Some(conn),
                        Err(err) => match backoff.next() {
                            Some(delay) => {
                                debug!("{} dial RM failed ({err}), retrying in {delay:?}", shared.id);
                                std::thread::sleep(delay);
                            }
                            None => break None,
                        },
                    }
                }
            };
            let Some(mut conn) = conn else {
                warn!("{} RM at {addr} unreachable, retrying", shared.id);
                std::thread::sleep(RM_RETRY_MAX);
                continue;
            };

            if let Err(err) = conn
                .write_line(Control::HelloClient { client: shared.id.clone() })
                .and_then(|()| Self::rm_session(shared, &mut conn))
            {
                warn!("{} RM connection lost: {err}", shared.id);
            }
            conn.shutdown();
        }
    }

    /// Applies PRIMARY lines from an established RM session.
    fn rm_session(shared: &Arc<Shared>, conn: &mut Connection) -> Result<()> {
        info!("{} connected to RM", shared.id);
        loop {
            let line = conn.read_line()?;
            match line.parse::<Control>() {
                Ok(Control::Primary { server, addr }) => {
                    Self::handle_primary(shared, server, addr)?;
                }
                Ok(control) => debug!("{} ignoring line from RM: {control}", shared.id),
                Err(err) => debug!("{} ignoring line from RM: {err}", shared.id),
            }
        }
    }

    /// Applies a PRIMARY update from the RM: set the cached primary, learn
    /// or update the replica's address (tearing down a stale connection),
    /// revive it if it was parked as permanently down, and reconnect it if
    /// it is unhealthy.
    fn handle_primary(
        shared: &Arc<Shared>,
        server: ReplicaId,
        addr: Option<String>,
    ) -> Result<()> {
        let (old, target) = {
            let mut global = shared.global.lock()?;
            let old = global.primary.replace(server.clone());
            let mut target = global.replicas.iter().find(|r| r.id == server).cloned();
            if target.is_none() {
                if let Some(addr) = addr.clone() {
                    let replica = Arc::new(Replica {
                        id: server.clone(),
                        inner: Mutex::new(ReplicaConn {
                            addr,
                            conn: None,
                            healthy: false,
                            reconnecting: false,
                            permanently_down: false,
                            queue: VecDeque::new(),
                        }),
                    });
                    global.replicas.push(replica.clone());
                    target = Some(replica);
                }
            }
            (old, target)
        };

        if old.as_ref() == Some(&server) {
            info!("{} RM confirmed primary {server}", shared.id);
        } else {
            info!(
                "{} RM changed primary: {} -> {server}",
                shared.id,
                old.as_deref().unwrap_or("none")
            );
        }

        let Some(target) = target else {
            warn!("{} no address known for primary {server}", shared.id);
            return Ok(());
        };

        let healthy = {
            let mut inner = target.inner.lock()?;
            if let Some(addr) = addr {
                if inner.addr != addr {
                    info!("{} address of {server} changed to {addr}", shared.id);
                    inner.addr = addr;
                    Self::mark_unhealthy(&mut inner);
                }
            }
            if inner.permanently_down {
                info!("{} {server} is primary again, clearing permanently down", shared.id);
                inner.permanently_down = false;
            }
            inner.healthy
        };
        if !healthy {
            Self::spawn_reconnect(shared, &target);
        }
        Ok(())
    }

    /// The current primary, as last told by the RM.
    pub fn primary(&self) -> Result<Option<ReplicaId>> {
        Ok(self.shared.global.lock()?.primary.clone())
    }

    /// The replicas with a healthy connection right now.
    pub fn healthy_replicas(&self) -> Result<Vec<ReplicaId>> {
        let global = self.shared.global.lock()?;
        let mut healthy = Vec::new();
        for replica in &global.replicas {
            if replica.inner.lock()?.healthy {
                healthy.push(replica.id.clone());
            }
        }
        Ok(healthy)
    }

    /// Closes all connections.
    pub fn close(&self) -> Result<()> {
        info!("{} closing all connections", self.shared.id);
        let global = self.shared.global.lock()?;
        for replica in &global.replicas {
            let mut inner = replica.inner.lock()?;
            Self::mark_unhealthy(&mut inner);
        }
        Ok(())
    }
}
