//! The local fault detector: a per-replica heartbeat prober. It registers
//! with its server (REGISTER/ACK), then PINGs it at a fixed rate, expecting
//! a PONG within the timeout. The first successful heartbeat reports ADD to
//! the GFD; exhausting reconnection retries after that reports DELETE and
//! ends the detector, its final state. Until the first heartbeat ever
//! succeeds, connection failure just means the server has not started yet.
//!
//! The GFD connection is shared by two threads: the main loop writes
//! ADD/DELETE, and a background reader answers the GFD's reverse heartbeats
//! (GFD_PING → GFD_PONG). Writes are serialized by a mutex.

use crate::backoff::Backoff;
use crate::errdata;
use crate::error::Result;
use crate::message::{Control, LfdId, ReplicaId};
use crate::wire::{Connection, LineReader, LineWriter};

use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A local fault detector, monitoring exactly one replica server.
pub struct Lfd {
    id: LfdId,
    server_id: ReplicaId,
    server_addr: String,
    gfd_addr: String,
    hb_interval: Duration,
    timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,

    /// The monitored server connection, absent until (re)connected.
    conn: Option<Connection>,
    /// True until the first successful PING/PONG round ever.
    first_heartbeat: bool,
    /// Heartbeat rounds attempted, for diagnostics.
    heartbeats: u64,
}

impl Lfd {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: LfdId,
        server_id: ReplicaId,
        server_addr: String,
        gfd_addr: String,
        hb_interval: Duration,
        timeout: Duration,
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            id,
            server_id,
            server_addr,
            gfd_addr,
            hb_interval,
            timeout,
            max_retries,
            base_delay,
            max_delay,
            conn: None,
            first_heartbeat: true,
            heartbeats: 0,
        }
    }

    /// Runs the detector. Returns Ok(()) exactly when the monitored server
    /// has been declared crashed (DELETE has been sent to the GFD); the
    /// caller decides what to do with that terminal verdict. Errors are
    /// only returned for a GFD that cannot be reached at startup.
    pub fn run(mut self) -> Result<()> {
        info!(
            "{} monitoring {} at {} (interval={:?} timeout={:?})",
            self.id, self.server_id, self.server_addr, self.hb_interval, self.timeout
        );

        let gfd = self.connect_gfd()?;
        info!("{} registered with GFD, waiting for server {}", self.id, self.server_id);

        let ticker = crossbeam::channel::tick(self.hb_interval);
        for _ in ticker.iter() {
            if !self.heartbeat(&gfd)? {
                self.notify_gfd(
                    &gfd,
                    Control::Delete {
                        server: self.server_id.clone(),
                        lfd: Some(self.id.clone()),
                    },
                );
                return Ok(());
            }
        }
        Ok(())
    }

    /// Connects and registers with the GFD, and spawns the reverse-heartbeat
    /// reader. Returns the shared write half.
    fn connect_gfd(&self) -> Result<Arc<Mutex<LineWriter>>> {
        let conn = Connection::connect(&self.gfd_addr)?;
        let (reader, mut writer) = conn.split();
        writer.write_line(Control::Register {
            server: self.server_id.clone(),
            lfd: Some(self.id.clone()),
        })?;
        let writer = Arc::new(Mutex::new(writer));

        let pong_writer = writer.clone();
        let id = self.id.clone();
        std::thread::spawn(move || {
            if let Err(err) = Self::gfd_reader(&id, reader, pong_writer) {
                warn!("{id} GFD connection closed: {err}");
            }
        });
        Ok(writer)
    }

    /// Answers the GFD's reverse heartbeats until the connection closes.
    /// Losing the GFD is not fatal to the detector itself.
    fn gfd_reader(
        id: &LfdId,
        mut reader: LineReader,
        writer: Arc<Mutex<LineWriter>>,
    ) -> Result<()> {
        loop {
            let line = reader.read_line()?;
            match line.parse::<Control>() {
                Ok(Control::GfdPing) => {
                    writer.lock()?.write_line(Control::GfdPong)?;
                    debug!("{id} answered GFD heartbeat");
                }
                Ok(control) => debug!("{id} ignoring line from GFD: {control}"),
                Err(err) => debug!("{id} ignoring line from GFD: {err}"),
            }
        }
    }

    /// Runs one heartbeat round. Returns false exactly when the server is to
    /// be declared crashed.
    fn heartbeat(&mut self, gfd: &Arc<Mutex<LineWriter>>) -> Result<bool> {
        if self.conn.is_none() && !self.connect_with_retry() {
            if self.first_heartbeat {
                info!("{} server {} not available yet, waiting", self.id, self.server_id);
                return Ok(true);
            }
            error!(
                "{} reconnection to {} failed after {} retries: declaring it crashed",
                self.id, self.server_id, self.max_retries
            );
            return Ok(false);
        }

        self.heartbeats += 1;
        let count = self.heartbeats;
        let timeout = self.timeout;
        let round = (|| {
            let Some(conn) = self.conn.as_mut() else { return errdata!("not connected") };
            conn.set_write_deadline(Some(timeout))?;
            conn.write_line(Control::Ping)?;
            conn.set_read_deadline(Some(timeout))?;
            conn.read_line()
        })();

        match round {
            Ok(line) if line.parse() == Ok(Control::Pong) => {
                debug!("{} heartbeat {count} to {}: PONG", self.id, self.server_id);
                if self.first_heartbeat {
                    self.first_heartbeat = false;
                    self.notify_gfd(
                        gfd,
                        Control::Add {
                            server: self.server_id.clone(),
                            lfd: Some(self.id.clone()),
                        },
                    );
                }
                Ok(true)
            }
            Ok(line) => {
                warn!(
                    "{} heartbeat {count}: unexpected reply {line:?} from {}",
                    self.id, self.server_id
                );
                self.fail_round()
            }
            Err(err) => {
                warn!("{} heartbeat {count} to {} failed: {err}", self.id, self.server_id);
                self.fail_round()
            }
        }
    }

    /// Handles a failed heartbeat round: drop the connection and try to
    /// reestablish it right away. Returns false when the server is to be
    /// declared crashed.
    fn fail_round(&mut self) -> Result<bool> {
        self.reset_conn();
        if self.connect_with_retry() {
            return Ok(true);
        }
        if self.first_heartbeat {
            // Never seen alive: not a crash, the server just isn't up yet.
            return Ok(true);
        }
        error!(
            "{} reconnection to {} failed after {} retries: declaring it crashed",
            self.id, self.server_id, self.max_retries
        );
        Ok(false)
    }

    /// Dials and registers with the monitored server, retrying with
    /// exponential backoff. Returns false once retries are exhausted.
    fn connect_with_retry(&mut self) -> bool {
        let mut backoff = Backoff::new(self.base_delay, self.max_delay, self.max_retries);
        loop {
            match self.connect() {
                Ok(()) => return true,
                Err(err) => {
                    let Some(delay) = backoff.next() else { return false };
                    debug!(
                        "{} connect to {} failed ({err}), retrying in {delay:?}",
                        self.id, self.server_id
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Dials the server and performs the REGISTER/ACK handshake.
    fn connect(&mut self) -> Result<()> {
        let mut conn = Connection::connect(&self.server_addr)?;
        conn.set_write_deadline(Some(self.timeout))?;
        conn.write_line(Control::Register { server: self.server_id.clone(), lfd: None })?;
        conn.set_read_deadline(Some(self.timeout))?;
        let reply = conn.read_line()?;
        if reply.parse() != Ok(Control::Ack) {
            return errdata!("server rejected registration with {reply:?}");
        }
        info!("{} registered to monitor {} at {}", self.id, self.server_id, self.server_addr);
        self.conn = Some(conn);
        Ok(())
    }

    /// Sends a membership event to the GFD. Failures are logged; the GFD's
    /// own LFD heartbeating covers a lost event.
    fn notify_gfd(&self, gfd: &Arc<Mutex<LineWriter>>, control: Control) {
        match gfd.lock() {
            Ok(mut writer) => {
                if let Err(err) = writer.write_line(&control) {
                    error!("{} failed to send {control} to GFD: {err}", self.id);
                } else {
                    info!("{} sent {control} to GFD", self.id);
                }
            }
            Err(err) => error!("{} GFD writer unavailable: {err}", self.id),
        }
    }

    /// Drops the server connection.
    fn reset_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.shutdown();
        }
    }
}
