//! Explicit name → controller map
//!
//! Owned by whoever runs the workers (the layer manager, a session) and passed
//! by reference; there is no process-wide registry.

use super::{StopOutcome, WorkerController};
use crate::error::{CoordError, Result};
use std::collections::BTreeMap;
use std::time::Duration;

/// Running workers by name
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, WorkerController>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller; names must be unique
    pub fn register(&mut self, controller: WorkerController) -> Result<()> {
        let name = controller.name().to_string();
        if self.workers.contains_key(&name) {
            return Err(CoordError::InvalidState(format!(
                "a worker named '{}' is already registered",
                name
            )));
        }
        self.workers.insert(name, controller);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&WorkerController> {
        self.workers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut WorkerController> {
        self.workers.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    /// Take a controller out without stopping it
    pub fn remove(&mut self, name: &str) -> Option<WorkerController> {
        self.workers.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop and forget one worker
    pub fn stop(&mut self, name: &str, grace: Duration) -> Option<StopOutcome> {
        self.workers.remove(name).map(|mut controller| controller.stop(grace))
    }

    /// Stop and forget every worker
    pub fn stop_all(&mut self, grace: Duration) -> Vec<(String, StopOutcome)> {
        let workers = std::mem::take(&mut self.workers);
        workers
            .into_iter()
            .map(|(name, mut controller)| {
                let outcome = controller.stop(grace);
                (name, outcome)
            })
            .collect()
    }
}
