//! Leader election strategies
//!
//! Every node runs the same strategy over the same candidate set and must
//! reach the same answer, so strategies are pure functions of their input.

use crate::config::ElectionConfig;
use crate::types::NetworkNode;

/// Picks the coordinator among a candidate set
pub trait ElectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Winner among `candidates`, or `None` if nobody is eligible
    fn elect_leader(&self, candidates: &[NetworkNode]) -> Option<NetworkNode>;
}

/// Lexicographically smallest node id wins
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstNodeStrategy;

impl ElectionStrategy for FirstNodeStrategy {
    fn name(&self) -> &'static str {
        "first_node"
    }

    fn elect_leader(&self, candidates: &[NetworkNode]) -> Option<NetworkNode> {
        candidates.iter().min_by(|a, b| a.id.cmp(&b.id)).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    Highest,
    Lowest,
}

/// Best value of a numeric metadata field wins
///
/// Candidates without the field, or with a non-numeric value, are not
/// eligible. On a tie the first candidate encountered wins.
#[derive(Debug, Clone)]
pub struct CapabilityStrategy {
    field: String,
    prefer: Preference,
}

impl CapabilityStrategy {
    pub fn new(field: impl Into<String>, prefer: Preference) -> Self {
        Self {
            field: field.into(),
            prefer,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    fn better(&self, candidate: f64, best: f64) -> bool {
        match self.prefer {
            Preference::Highest => candidate > best,
            Preference::Lowest => candidate < best,
        }
    }
}

impl ElectionStrategy for CapabilityStrategy {
    fn name(&self) -> &'static str {
        "capability"
    }

    fn elect_leader(&self, candidates: &[NetworkNode]) -> Option<NetworkNode> {
        let mut best: Option<(&NetworkNode, f64)> = None;
        for node in candidates {
            let value = match node.metric(&self.field) {
                Some(v) if v.is_finite() => v,
                _ => continue,
            };
            match best {
                Some((_, current)) if !self.better(value, current) => {}
                _ => best = Some((node, value)),
            }
        }
        best.map(|(node, _)| node.clone())
    }
}

/// Build the configured strategy
pub fn strategy_from_config(config: &ElectionConfig) -> Box<dyn ElectionStrategy> {
    match config {
        ElectionConfig::FirstNode => Box::new(FirstNodeStrategy),
        ElectionConfig::Capability {
            field,
            prefer_highest,
        } => {
            let prefer = if *prefer_highest {
                Preference::Highest
            } else {
                Preference::Lowest
            };
            Box::new(CapabilityStrategy::new(field.clone(), prefer))
        }
    }
}
