//! Per-node coordination state
//!
//! [`CoordinationState`] is written only by the session driver thread and
//! read by the session handle through snapshots. Topology entries are shared
//! `Arc<NetworkNode>`s: a topology update that does not change a node keeps
//! the very same allocation, so consumers can cheaply tell what changed.

use crate::error::{CoordError, Result};
use crate::types::{NetworkNode, NodeRole};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Session phase of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    Discovering,
    Joining,
    Ready,
    Leaving,
    Disconnected,
    Error,
}

impl Phase {
    /// `Disconnected` and `Error` end a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Disconnected | Phase::Error)
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(&self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Discovering, Joining)
                | (Discovering, Ready)
                | (Discovering, Error)
                | (Discovering, Disconnected)
                | (Joining, Ready)
                | (Joining, Error)
                | (Joining, Disconnected)
                | (Ready, Leaving)
                | (Ready, Disconnected)
                | (Leaving, Disconnected)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Discovering => write!(f, "discovering"),
            Phase::Joining => write!(f, "joining"),
            Phase::Ready => write!(f, "ready"),
            Phase::Leaving => write!(f, "leaving"),
            Phase::Disconnected => write!(f, "disconnected"),
            Phase::Error => write!(f, "error"),
        }
    }
}

/// Result of applying a full topology snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Present before and after but with changed role/name/metadata
    pub updated: Vec<String>,
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Membership table keyed by node id
#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: BTreeMap<String, Arc<NetworkNode>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&Arc<NetworkNode>> {
        self.nodes.get(node_id)
    }

    /// Node ids in ascending order
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NetworkNode>> {
        self.nodes.values()
    }

    /// Owned copies for the wire
    pub fn snapshot(&self) -> Vec<NetworkNode> {
        self.nodes.values().map(|n| n.as_ref().clone()).collect()
    }

    pub fn coordinator(&self) -> Option<&Arc<NetworkNode>> {
        self.nodes.values().find(|n| n.is_coordinator())
    }

    /// Insert or replace a node; returns `true` if it was not present
    pub fn upsert(&mut self, node: NetworkNode) -> bool {
        self.nodes.insert(node.id.clone(), Arc::new(node)).is_none()
    }

    /// Refresh `last_seen` of a member; returns `false` for unknown nodes
    pub fn touch(&mut self, node_id: &str, at: DateTime<Utc>) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                *node = Arc::new(node.seen_at(at));
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, node_id: &str) -> Option<Arc<NetworkNode>> {
        self.nodes.remove(node_id)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Replace membership with `nodes` by diffing, not wholesale
    ///
    /// Nodes absent from `nodes` are removed, new ones are added, and entries
    /// whose identity is unchanged keep their existing `Arc`.
    pub fn apply_update(&mut self, nodes: Vec<NetworkNode>) -> TopologyDiff {
        let mut incoming: BTreeMap<String, NetworkNode> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        let mut diff = TopologyDiff::default();

        let stale: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            self.nodes.remove(&id);
            diff.removed.push(id);
        }

        for (id, node) in std::mem::take(&mut incoming) {
            match self.nodes.get(&id) {
                Some(existing) if existing.same_identity(&node) => {}
                Some(_) => {
                    self.nodes.insert(id.clone(), Arc::new(node));
                    diff.updated.push(id);
                }
                None => {
                    self.nodes.insert(id.clone(), Arc::new(node));
                    diff.added.push(id);
                }
            }
        }
        diff
    }

    /// Members other than `except` silent for longer than `timeout`
    pub fn stale(&self, now: DateTime<Utc>, timeout: Duration, except: &str) -> Vec<String> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.nodes
            .values()
            .filter(|n| n.id != except && now.signed_duration_since(n.last_seen) > timeout)
            .map(|n| n.id.clone())
            .collect()
    }
}

/// Everything the local node knows about its session
#[derive(Debug, Clone)]
pub struct CoordinationState {
    pub local_node_id: String,
    pub phase: Phase,
    /// `None` until the role is fixed
    pub role: Option<NodeRole>,
    pub topology: Topology,
    pub coordinator_id: Option<String>,
}

impl CoordinationState {
    pub fn new(local_node_id: impl Into<String>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            phase: Phase::Discovering,
            role: None,
            topology: Topology::new(),
            coordinator_id: None,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == Some(NodeRole::Coordinator)
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Move to `to`; staying put is a no-op
    pub fn transition(&mut self, to: Phase) -> Result<Phase> {
        let from = self.phase;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(CoordError::InvalidState(format!(
                "illegal phase transition {} -> {}",
                from, to
            )));
        }
        self.phase = to;
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn topology(ids: &[&str]) -> Topology {
        let mut topology = Topology::new();
        for id in ids {
            topology.upsert(NetworkNode::new(*id, id.to_uppercase()).with_role(NodeRole::Participant));
        }
        topology
    }

    #[test]
    fn test_apply_update_diffs_membership() {
        let mut topology = topology(&["a", "b", "c"]);
        let b_before = topology.get("b").unwrap().clone();
        let c_before = topology.get("c").unwrap().clone();

        let incoming: Vec<NetworkNode> = ["b", "c", "d"]
            .iter()
            .map(|id| {
                // Peers serialize their own copies with fresher timestamps
                NetworkNode::new(*id, id.to_uppercase())
                    .with_role(NodeRole::Participant)
                    .touched()
            })
            .collect();
        let diff = topology.apply_update(incoming);

        assert_eq!(topology.node_ids(), vec!["b", "c", "d"]);
        assert_eq!(diff.added, vec!["d"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert!(diff.updated.is_empty());
        assert!(Arc::ptr_eq(topology.get("b").unwrap(), &b_before));
        assert!(Arc::ptr_eq(topology.get("c").unwrap(), &c_before));
    }

    #[test]
    fn test_apply_update_replaces_changed_nodes() {
        let mut topology = topology(&["a", "b"]);
        let diff = topology.apply_update(vec![
            NetworkNode::new("a", "A").with_role(NodeRole::Coordinator),
            NetworkNode::new("b", "B").with_role(NodeRole::Participant),
        ]);
        assert_eq!(diff.updated, vec!["a"]);
        assert!(topology.get("a").unwrap().is_coordinator());
        assert_eq!(topology.coordinator().unwrap().id, "a");
    }

    #[test]
    fn test_stale_nodes() {
        let mut topology = topology(&["a", "b"]);
        let now = Utc::now();
        topology.touch("a", now - chrono::Duration::seconds(10));
        topology.touch("b", now);

        assert_eq!(topology.stale(now, Duration::from_secs(5), "z"), vec!["a"]);
        assert!(topology.stale(now, Duration::from_secs(5), "a").is_empty());
        assert!(!topology.touch("missing", now));
    }

    #[test]
    fn test_phase_transitions() {
        let mut state = CoordinationState::new("n1");
        assert!(state.transition(Phase::Joining).is_ok());
        assert!(state.transition(Phase::Leaving).is_err());
        assert!(state.transition(Phase::Ready).is_ok());
        assert!(state.transition(Phase::Ready).is_ok());
        assert!(state.transition(Phase::Leaving).is_ok());
        assert!(state.transition(Phase::Disconnected).is_ok());
        assert!(state.phase.is_terminal());
        assert!(state.transition(Phase::Ready).is_err());
    }

    #[test]
    fn test_error_is_terminal() {
        let mut state = CoordinationState::new("n1");
        state.transition(Phase::Joining).unwrap();
        state.transition(Phase::Error).unwrap();
        assert!(state.phase.is_terminal());
        assert!(state.transition(Phase::Joining).is_err());
    }

    proptest! {
        #[test]
        fn test_apply_update_yields_exactly_incoming_set(
            current in proptest::collection::btree_set("[a-f]", 0..6),
            incoming in proptest::collection::btree_set("[a-f]", 0..6),
        ) {
            let ids: Vec<&str> = current.iter().map(String::as_str).collect();
            let mut topology = topology(&ids);
            let before: BTreeMap<String, Arc<NetworkNode>> = topology
                .nodes()
                .map(|n| (n.id.clone(), n.clone()))
                .collect();

            let nodes: Vec<NetworkNode> = incoming
                .iter()
                .map(|id| NetworkNode::new(id.clone(), id.to_uppercase()).with_role(NodeRole::Participant))
                .collect();
            let diff = topology.apply_update(nodes);

            let after: Vec<String> = topology.node_ids();
            let expected: Vec<String> = incoming.iter().cloned().collect();
            prop_assert_eq!(after, expected);

            for id in incoming.intersection(&current) {
                prop_assert!(Arc::ptr_eq(topology.get(id).unwrap(), &before[id]));
            }
            prop_assert_eq!(diff.added.len(), incoming.difference(&current).count());
            prop_assert_eq!(diff.removed.len(), current.difference(&incoming).count());
        }
    }
}
