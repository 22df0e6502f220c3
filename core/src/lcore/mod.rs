//! Worker-core bookkeeping.
//!
//! Each packet processing worker is pinned to a core and owns a private flow
//! manager instance group. [`ManagerSet`] builds the groups once at startup;
//! every worker takes its instance as an exclusive handle, so the data path
//! shares nothing between cores.

use crate::config::FlowConfig;
use crate::flowtrack::FlowManager;

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Identifier of a worker core.
#[derive(Debug, Copy, Clone, Hash, Ord, Eq, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct CoreId(pub u32);

impl CoreId {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One flow manager per worker, constructed once at startup.
pub struct ManagerSet {
    slots: Vec<Option<FlowManager>>,
}

impl ManagerSet {
    /// Builds `nb_workers` independent managers from `config`.
    pub fn new(config: &FlowConfig, nb_workers: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(nb_workers);
        for _ in 0..nb_workers {
            slots.push(Some(FlowManager::new(config)?));
        }
        Ok(ManagerSet { slots })
    }

    /// Number of worker slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hands the manager of `core` to its worker. Each instance can be taken
    /// exactly once.
    pub fn take(&mut self, core: CoreId) -> Option<FlowManager> {
        self.slots.get_mut(core.raw() as usize).and_then(|s| s.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managers_are_taken_exactly_once() {
        let config = FlowConfig {
            capacity: 16,
            ..FlowConfig::default()
        };
        let mut set = ManagerSet::new(&config, 2).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.take(CoreId(0)).is_some());
        assert!(set.take(CoreId(0)).is_none());
        assert!(set.take(CoreId(1)).is_some());
        assert!(set.take(CoreId(2)).is_none());
    }
}
