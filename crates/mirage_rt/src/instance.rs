//! Instance keys
//!
//! A node reached along several paths from the root is one scene node but
//! several placements. The path is recorded as the child slot index taken at
//! each level, and interned to a small [`InstanceId`] so cache entries key
//! on integers rather than on ancestor identity.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Child slot indices from the root down to an instance.
pub type InstancePath = SmallVec<[u32; 8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u32);

impl InstanceId {
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
struct InstanceSlot {
    path: InstancePath,
    last_used: u64,
}

/// Interns instance paths; ids of paths unused for a while are recycled.
#[derive(Debug, Default)]
pub struct InstanceKeyMap {
    ids: FxHashMap<InstancePath, InstanceId>,
    slots: Vec<Option<InstanceSlot>>,
    free: Vec<u32>,
}

impl InstanceKeyMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `path`, stamped as used in `pass`.
    pub fn intern(&mut self, path: &[u32], pass: u64) -> InstanceId {
        if let Some(&id) = self.ids.get(path) {
            if let Some(Some(slot)) = self.slots.get_mut(id.0 as usize) {
                slot.last_used = pass;
            }
            return id;
        }

        let slot = InstanceSlot {
            path: SmallVec::from_slice(path),
            last_used: pass,
        };
        let id = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                InstanceId(index)
            }
            None => {
                self.slots.push(Some(slot));
                InstanceId((self.slots.len() - 1) as u32)
            }
        };
        self.ids.insert(SmallVec::from_slice(path), id);
        id
    }

    #[must_use]
    pub fn get(&self, path: &[u32]) -> Option<InstanceId> {
        self.ids.get(path).copied()
    }

    #[must_use]
    pub fn path(&self, id: InstanceId) -> Option<&[u32]> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .map(|s| s.path.as_slice())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Frees ids whose paths were not used during the last `ttl` passes.
    /// Returns how many were freed.
    pub fn prune(&mut self, pass: u64, ttl: u64) -> usize {
        let mut freed = 0;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            let expired = entry
                .as_ref()
                .is_some_and(|s| pass.saturating_sub(s.last_used) > ttl);
            if expired && let Some(slot) = entry.take() {
                self.ids.remove(&slot.path);
                self.free.push(index as u32);
                freed += 1;
            }
        }
        freed
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.slots.clear();
        self.free.clear();
    }
}
