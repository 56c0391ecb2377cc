use std::collections::{HashMap, HashSet};

use crate::ObjectId;

/// Live objects plus the delta since the last checkpoint.
///
/// Not synchronized on its own; the tracker keeps it behind its state lock so
/// every method here is applied atomically with respect to the others.
#[derive(Debug, Default)]
pub struct Registry {
    live: HashSet<ObjectId>,
    added: HashSet<ObjectId>,
    /// Type names are copied at finalization, the object is gone afterwards.
    removed: HashMap<ObjectId, String>,
}

/// Sorted copy of the registry contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub live: Vec<ObjectId>,
    pub added: Vec<ObjectId>,
    pub removed: Vec<(ObjectId, String)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `id` was already tracked.
    pub fn record_create(&mut self, id: ObjectId) -> bool {
        if !self.live.insert(id) {
            return false;
        }
        self.added.insert(id);
        true
    }

    /// Returns false if `id` was never tracked.
    pub fn record_finalize(&mut self, id: ObjectId, type_name: &str) -> bool {
        if !self.live.remove(&id) {
            return false;
        }
        // created and destroyed within one interval: not part of the baseline
        if !self.added.remove(&id) {
            self.removed.insert(id, type_name.to_string());
        }
        true
    }

    pub fn checkpoint_reset(&mut self) {
        self.added.clear();
        self.removed.clear();
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.live.contains(&id)
    }

    pub fn live(&self) -> Vec<ObjectId> {
        sorted(self.live.iter().copied().collect())
    }

    pub fn added(&self) -> Vec<ObjectId> {
        sorted(self.added.iter().copied().collect())
    }

    pub fn removed(&self) -> Vec<(ObjectId, String)> {
        let mut out: Vec<_> = self
            .removed
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect();
        out.sort_by_key(|x| x.0);
        out
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            live: self.live(),
            added: self.added(),
            removed: self.removed(),
        }
    }
}

fn sorted(mut ids: Vec<ObjectId>) -> Vec<ObjectId> {
    ids.sort();
    ids
}
