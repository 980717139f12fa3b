use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use semsearch_core::error::Result;
use semsearch_core::traits::{IndexStore, Snapshot};
use semsearch_core::types::IndexedVector;

/// In-process store. Each namespace holds one immutable snapshot that is
/// swapped wholesale on `replace`; readers keep whatever `Arc` they cloned.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: RwLock<HashMap<String, Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn replace(&self, namespace: &str, records: Vec<IndexedVector>) -> Result<()> {
        let snapshot: Snapshot = records.into();
        self.namespaces.write().insert(namespace.to_string(), snapshot);
        Ok(())
    }

    fn snapshot(&self, namespace: &str) -> Result<Option<Snapshot>> {
        Ok(self.namespaces.read().get(namespace).filter(|s| !s.is_empty()).cloned())
    }

    fn clear(&self, namespace: Option<&str>) -> Result<()> {
        let mut guard = self.namespaces.write();
        match namespace {
            Some(ns) => {
                guard.remove(ns);
            }
            None => guard.clear(),
        }
        Ok(())
    }

    fn namespaces(&self) -> Result<BTreeMap<String, usize>> {
        Ok(self.namespaces.read().iter().map(|(k, v)| (k.clone(), v.len())).collect())
    }
}
