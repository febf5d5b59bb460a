use crate::message::{CheckpointNo, ClientId, Envelope, ReplicaId, RequestNum, Role, State};

use std::collections::HashMap;

/// The outcome of offering a checkpoint to the replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// The checkpoint was applied. became_ready is true if this was the
    /// replica's first checkpoint, ending its newborn phase for good.
    Applied { became_ready: bool },
    /// The checkpoint number was not strictly newer than the last applied
    /// one; the checkpoint was discarded.
    Stale,
    /// The replica is currently the primary and does not take checkpoints.
    IsPrimary,
}

/// A replica's mutable core: the counter, checkpoint bookkeeping, the ready
/// flag and the RM-assigned role, plus per-client request high-water marks.
/// All mutation goes through this struct, which the server guards with a
/// single mutex; every method is a pure in-memory transition so the lock is
/// never held across IO.
///
/// Invariants upheld here: the counter never decreases (a checkpoint must be
/// strictly newer to be applied, and increments only add); ready is
/// monotonic (once true, never false again); a replica that has never been
/// ready has never answered a request.
pub struct ReplicaState {
    id: ReplicaId,
    state: State,
    checkpoint_no: CheckpointNo,
    ready: bool,
    role: Role,
    high_water: HashMap<ClientId, RequestNum>,
}

impl ReplicaState {
    /// Creates the state for a starting replica. A replica started as the
    /// primary is the operator's bootstrap of a fresh cluster and starts
    /// ready; a replica started as a backup is a newborn until it applies
    /// its first checkpoint.
    pub fn new(id: ReplicaId, init_state: State, role: Role) -> Self {
        Self {
            id,
            state: init_state,
            checkpoint_no: 0,
            ready: role == Role::Primary,
            role,
            high_water: HashMap::new(),
        }
    }

    /// Handles a client request. Always records the client's high-water
    /// request number. Only a ready primary mutates the counter and answers:
    /// everyone else (newborns, and backups that a client reached in error)
    /// stays silent. Returns the counter before and after the increment when
    /// the request was accepted.
    pub fn apply_request(
        &mut self,
        client_id: &ClientId,
        request_num: RequestNum,
    ) -> Option<(State, State)> {
        let seen = self.high_water.entry(client_id.clone()).or_default();
        *seen = (*seen).max(request_num);

        if !self.ready || self.role != Role::Primary {
            return None;
        }
        let before = self.state;
        self.state += 1;
        Some((before, self.state))
    }

    /// Offers a received checkpoint. Backups and newborns apply it if it is
    /// strictly newer than the last applied checkpoint, which also ends the
    /// newborn phase; the primary ignores checkpoints outright, since
    /// applying one could move its counter backwards.
    pub fn apply_checkpoint(
        &mut self,
        state: State,
        checkpoint_no: CheckpointNo,
    ) -> CheckpointOutcome {
        if self.role == Role::Primary {
            return CheckpointOutcome::IsPrimary;
        }
        if checkpoint_no <= self.checkpoint_no {
            return CheckpointOutcome::Stale;
        }
        self.state = state;
        self.checkpoint_no = checkpoint_no;
        let became_ready = !self.ready;
        self.ready = true;
        CheckpointOutcome::Applied { became_ready }
    }

    /// Snapshots the next checkpoint to broadcast and advances the
    /// checkpoint counter. Only the primary emits checkpoints; the number is
    /// consumed whether or not any backup turns out to be reachable.
    pub fn next_checkpoint(&mut self) -> Option<Envelope> {
        if self.role != Role::Primary {
            return None;
        }
        self.checkpoint_no += 1;
        Some(Envelope::Checkpoint {
            replica_id: self.id.clone(),
            server_state: self.state,
            checkpoint_num: self.checkpoint_no,
        })
    }

    /// Applies a role assignment from the RM, returning the previous role.
    /// The role never affects the ready flag: a newborn promoted to primary
    /// remains unable to serve until it has applied a checkpoint.
    pub fn set_role(&mut self, role: Role) -> Role {
        std::mem::replace(&mut self.role, role)
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn checkpoint_no(&self) -> CheckpointNo {
        self.checkpoint_no
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The highest request number observed from the given client.
    pub fn high_water(&self, client_id: &ClientId) -> Option<RequestNum> {
        self.high_water.get(client_id).copied()
    }
}
