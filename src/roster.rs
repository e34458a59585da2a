use std::collections::HashSet;

use crate::identity::{Participant, PeerId};

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

/// The occupants of the room, ordered by arrival, plus the subset of ids
/// currently in the call (display-only).
///
/// Mutated exclusively by signaling events; the presentation layer reads
/// snapshots. The in-call subset is always a subset of the roster's ids —
/// status broadcasts naming unknown ids are pruned on the way in.
#[derive(Debug, Default)]
pub struct Roster {
    participants: Vec<Participant>,
    in_call: HashSet<PeerId>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster wholesale (snapshot semantics).
    pub fn replace(&mut self, participants: Vec<Participant>) {
        self.participants = participants;
        let ids: HashSet<&PeerId> = self.participants.iter().map(|p| &p.id).collect();
        self.in_call.retain(|id| ids.contains(id));
    }

    /// Append a participant unless already present. Returns `true` when the
    /// roster changed.
    pub fn add(&mut self, participant: Participant) -> bool {
        if self.contains(&participant.id) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    /// Remove a participant (and its in-call membership). No-op if absent.
    pub fn remove(&mut self, id: &PeerId) {
        self.participants.retain(|p| &p.id != id);
        self.in_call.remove(id);
    }

    /// Replace the in-call subset from a status broadcast, keeping only ids
    /// the roster actually knows.
    pub fn set_in_call(&mut self, users: Vec<PeerId>) {
        let known: HashSet<&PeerId> = self.participants.iter().map(|p| &p.id).collect();
        self.in_call = users.into_iter().filter(|id| known.contains(id)).collect();
    }

    /// Drop everything — local leave resets the view entirely.
    pub fn clear(&mut self) {
        self.participants.clear();
        self.in_call.clear();
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.participants.iter().any(|p| &p.id == id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    pub fn in_call_ids(&self) -> Vec<PeerId> {
        self.in_call.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: &str) -> Participant {
        Participant::new(id, None)
    }

    #[test]
    fn add_is_idempotent_and_preserves_arrival_order() {
        let mut roster = Roster::new();
        assert!(roster.add(p("a")));
        assert!(roster.add(p("b")));
        assert!(!roster.add(p("a")));
        let ids = roster.ids();
        assert_eq!(ids, vec![PeerId::from("a"), PeerId::from("b")]);
    }

    #[test]
    fn replace_prunes_in_call_subset() {
        let mut roster = Roster::new();
        roster.replace(vec![p("a"), p("b")]);
        roster.set_in_call(vec![PeerId::from("a"), PeerId::from("b")]);
        roster.replace(vec![p("b"), p("c")]);
        assert_eq!(roster.in_call_ids(), vec![PeerId::from("b")]);
    }

    #[test]
    fn in_call_is_always_a_subset_of_roster() {
        let mut roster = Roster::new();
        roster.replace(vec![p("a")]);
        roster.set_in_call(vec![PeerId::from("a"), PeerId::from("ghost")]);
        assert_eq!(roster.in_call_ids(), vec![PeerId::from("a")]);
    }

    #[test]
    fn remove_drops_call_membership_too() {
        let mut roster = Roster::new();
        roster.replace(vec![p("a"), p("b")]);
        roster.set_in_call(vec![PeerId::from("a")]);
        roster.remove(&PeerId::from("a"));
        assert!(!roster.contains(&PeerId::from("a")));
        assert!(roster.in_call_ids().is_empty());
    }

    #[test]
    fn clear_empties_everything() {
        let mut roster = Roster::new();
        roster.replace(vec![p("a")]);
        roster.set_in_call(vec![PeerId::from("a")]);
        roster.clear();
        assert!(roster.is_empty());
        assert!(roster.in_call_ids().is_empty());
    }
}
