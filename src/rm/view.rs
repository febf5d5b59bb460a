use crate::message::{ReplicaId, Role, State};

use std::collections::HashMap;

/// The replication manager's authoritative view: the latest membership from
/// the GFD, the high-water state observed per server, and the designated
/// primary. Pure bookkeeping behind the RM's mutex; every mutation
/// re-evaluates the primary and reports the outcome so the caller can
/// broadcast it.
#[derive(Default)]
pub struct View {
    membership: Vec<ReplicaId>,
    states: HashMap<ReplicaId, State>,
    primary: Option<ReplicaId>,
}

/// The outcome of one primary re-evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct Election {
    pub previous: Option<ReplicaId>,
    pub primary: Option<ReplicaId>,
}

impl Election {
    /// True when the primary's identity changed, which is what obliges a
    /// PRIMARY broadcast to clients. ROLE refreshes go out either way.
    pub fn changed(&self) -> bool {
        self.previous != self.primary
    }
}

/// Chooses a primary as a pure function of the membership, the observed
/// states and the incumbent. The incumbent is sticky: it is kept as long as
/// it remains a member and no member has strictly higher observed state.
/// Ties otherwise go to the first server in membership order. An empty
/// membership has no primary.
pub fn choose_primary(
    membership: &[ReplicaId],
    states: &HashMap<ReplicaId, State>,
    incumbent: Option<&ReplicaId>,
) -> Option<ReplicaId> {
    if membership.is_empty() {
        return None;
    }
    let state_of = |server: &ReplicaId| states.get(server).copied().unwrap_or(-1);

    let mut best = incumbent.filter(|cur| membership.contains(*cur)).cloned();
    let mut best_state = best.as_ref().map(state_of).unwrap_or(-1);
    for server in membership {
        if best.is_none() || state_of(server) > best_state {
            best = Some(server.clone());
            best_state = state_of(server);
        }
    }
    best
}

impl View {
    /// Replaces the membership with a fresh GFD snapshot, drops the
    /// observed state of servers no longer in it, and re-elects.
    pub fn update_membership(&mut self, membership: Vec<ReplicaId>) -> Election {
        self.states.retain(|server, _| membership.contains(server));
        self.membership = membership;
        self.elect()
    }

    /// Merges a STATE report. The stored value is a high-water mark: a
    /// report that is not strictly greater is dropped, returning None.
    /// An applied report re-elects, since a backup that has overtaken the
    /// incumbent's last known state may steal the role.
    pub fn update_state(&mut self, server: ReplicaId, state: State) -> Option<Election> {
        let known = self.states.get(&server).copied().unwrap_or(-1);
        if state <= known {
            return None;
        }
        self.states.insert(server, state);
        Some(self.elect())
    }

    /// Re-evaluates the primary from the current view.
    fn elect(&mut self) -> Election {
        let previous = self.primary.clone();
        self.primary = choose_primary(&self.membership, &self.states, previous.as_ref());
        Election { previous, primary: self.primary.clone() }
    }

    /// The role the given server should hold under the current view.
    pub fn role_of(&self, server: &ReplicaId) -> Role {
        if self.primary.as_ref() == Some(server) {
            Role::Primary
        } else {
            Role::Backup
        }
    }

    pub fn primary(&self) -> Option<&ReplicaId> {
        self.primary.as_ref()
    }

    pub fn members(&self) -> &[ReplicaId] {
        &self.membership
    }

    /// The observed high-water state, or -1 if never reported.
    pub fn state_of(&self, server: &ReplicaId) -> State {
        self.states.get(server).copied().unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn members(ids: &[&str]) -> Vec<ReplicaId> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    /// Cold start: no states observed, no incumbent. The first server in
    /// membership order wins.
    #[test]
    fn elects_first_member_on_cold_start() {
        let mut view = View::default();
        let election = view.update_membership(members(&["S1", "S2", "S3"]));
        assert_eq!(election.primary, Some("S1".into()));
        assert!(election.changed());
        assert_eq!(view.role_of(&"S1".into()), Role::Primary);
        assert_eq!(view.role_of(&"S2".into()), Role::Backup);
    }

    #[test]
    fn empty_membership_has_no_primary() {
        let mut view = View::default();
        view.update_membership(members(&["S1"]));
        let election = view.update_membership(Vec::new());
        assert_eq!(election, Election { previous: Some("S1".into()), primary: None });
    }

    /// Primary crash: the dead server leaves membership; among the
    /// survivors with equal state, the first in membership order wins.
    #[test]
    fn failover_prefers_highest_state_then_order() {
        let mut view = View::default();
        view.update_membership(members(&["S1", "S2", "S3"]));
        view.update_state("S1".into(), 7);
        view.update_state("S2".into(), 7);
        view.update_state("S3".into(), 7);

        let election = view.update_membership(members(&["S2", "S3"]));
        assert_eq!(election, Election { previous: Some("S1".into()), primary: Some("S2".into()) });
    }

    /// The incumbent is kept over an equal-state peer, but loses to a
    /// strictly higher one — the recovery path after a stalled primary.
    #[test]
    fn incumbent_is_sticky_until_strictly_overtaken() {
        let mut view = View::default();
        view.update_membership(members(&["S1", "S2"]));
        assert_eq!(view.primary(), Some(&"S1".into()));

        // Equal state: no change.
        view.update_state("S1".into(), 5);
        let election = view.update_state("S2".into(), 5).unwrap();
        assert_eq!(election.primary, Some("S1".into()));
        assert!(!election.changed());

        // Strictly higher state steals the role.
        let election = view.update_state("S2".into(), 6).unwrap();
        assert_eq!(election, Election { previous: Some("S1".into()), primary: Some("S2".into()) });
    }

    /// An LFD blip evicts and re-adds a replica; the replacement primary
    /// is retained per stickiness.
    #[test]
    fn readded_member_does_not_reclaim_primary() {
        let mut view = View::default();
        view.update_membership(members(&["S1", "S2", "S3"]));
        view.update_membership(members(&["S2", "S3"]));
        assert_eq!(view.primary(), Some(&"S2".into()));

        let election = view.update_membership(members(&["S2", "S3", "S1"]));
        assert_eq!(election.primary, Some("S2".into()));
        assert!(!election.changed());
    }

    /// State reports merge as a high-water mark: stale or repeated values
    /// are dropped without re-electing.
    #[test]
    fn state_merge_is_high_water() {
        let mut view = View::default();
        view.update_membership(members(&["S1", "S2"]));
        assert!(view.update_state("S1".into(), 3).is_some());
        assert_eq!(view.update_state("S1".into(), 3), None);
        assert_eq!(view.update_state("S1".into(), 2), None);
        assert_eq!(view.state_of(&"S1".into()), 3);
    }

    /// Eviction drops the server's observed state; if it returns, its
    /// state is learned from scratch.
    #[test]
    fn eviction_drops_observed_state() {
        let mut view = View::default();
        view.update_membership(members(&["S1", "S2"]));
        view.update_state("S1".into(), 9);
        view.update_membership(members(&["S2"]));
        assert_eq!(view.state_of(&"S1".into()), -1);

        // Back with a lower state than it once had: accepted, since the
        // old high-water mark is gone.
        view.update_membership(members(&["S2", "S1"]));
        assert!(view.update_state("S1".into(), 1).is_some());
        assert_eq!(view.state_of(&"S1".into()), 1);
    }

    /// A server outside membership is never chosen, no matter its state.
    #[test]
    fn primary_is_always_a_member() {
        let mut view = View::default();
        view.update_membership(members(&["S1", "S2"]));
        view.update_state("S1".into(), 10);
        let election = view.update_membership(members(&["S2"]));
        assert_eq!(election.primary, Some("S2".into()));
    }

    /// The pure election function, driven directly.
    #[test]
    fn choose_primary_edge_cases() {
        let states: HashMap<ReplicaId, State> =
            [("S1".to_string(), 4), ("S2".to_string(), 9)].into();

        assert_eq!(choose_primary(&[], &states, None), None);
        assert_eq!(
            choose_primary(&members(&["S1", "S2"]), &states, None),
            Some("S2".to_string())
        );
        // Incumbent not in membership is ignored.
        assert_eq!(
            choose_primary(&members(&["S1"]), &states, Some(&"S9".to_string())),
            Some("S1".to_string())
        );
        // Unseen servers count as -1.
        assert_eq!(
            choose_primary(&members(&["S4", "S5"]), &states, None),
            Some("S4".to_string())
        );
    }
}
