use std::collections::BTreeSet;
use std::ops::Bound::Included;

use serde::{Deserialize, Serialize};

use crate::rid::RID;

/// Ordered set of the RIDs inserted into a secondary index, supporting range
/// enumeration. Persisted after the index container in the index file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SeedSet {
    seeds: BTreeSet<RID>,
}

impl SeedSet {
    pub fn new() -> Self {
        SeedSet {
            seeds: BTreeSet::new(),
        }
    }

    pub fn add(&mut self, rid: RID) {
        self.seeds.insert(rid);
    }

    pub fn remove(&mut self, rid: RID) {
        self.seeds.remove(&rid);
    }

    pub fn contains(&self, rid: RID) -> bool {
        self.seeds.contains(&rid)
    }

    /// All seeded RIDs in `[low, high]`, ascending.
    pub fn search_range(&self, low: RID, high: RID) -> Vec<RID> {
        self.seeds
            .range((Included(low), Included(high)))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}
