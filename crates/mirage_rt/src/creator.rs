//! Resource creator
//!
//! [`DalCreator`] is the factory and bulk owner of backend resources for one
//! backend context. Entries live in one arena per [`DalKind`]; scene nodes
//! hold [`DalLink`]s naming an arena slot. Releasing an entry is removing it
//! from its arena, which destroys the backend handles it owns. A link whose
//! slot is already gone resolves to nothing, so releasing twice is a no-op.

use slotmap::SlotMap;

use mirage_core::{CreatorId, DalKey, DalKind, DalLink};
use mirage_scene::MaterialParams;

use crate::backend::{BackendResult, ResourceDesc, RtBackend, RtHandle};
use crate::cache::DalData;

pub struct DalCreator<B: RtBackend> {
    id: CreatorId,
    backend: B,
    pools: [SlotMap<DalKey, DalData>; DalKind::COUNT],
    default_material: Option<RtHandle>,
}

impl<B: RtBackend> DalCreator<B> {
    pub fn new(backend: B) -> Self {
        let id = CreatorId::next();
        log::debug!("Creating DAL creator {id}");
        Self {
            id,
            backend,
            pools: std::array::from_fn(|_| SlotMap::with_key()),
            default_material: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> CreatorId {
        self.id
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Registers a freshly built entry and returns the link for its node.
    pub fn add(&mut self, data: DalData) -> DalLink {
        let kind = data.kind();
        let key = self.pools[kind.index()].insert(data);
        DalLink::new(self.id, kind, key)
    }

    /// Resolves a link of this creator.
    #[must_use]
    pub fn get(&self, link: DalLink) -> Option<&DalData> {
        if link.creator != self.id {
            return None;
        }
        self.pools[link.kind.index()].get(link.key)
    }

    pub fn get_mut(&mut self, link: DalLink) -> Option<&mut DalData> {
        if link.creator != self.id {
            return None;
        }
        self.pools[link.kind.index()].get_mut(link.key)
    }

    /// Release path for a cleared DAL slot.
    ///
    /// Removes the entry and destroys what it owns. Returns `false` when the
    /// link names no live entry (already released, or another creator's).
    pub fn on_release(&mut self, link: DalLink) -> bool {
        if link.creator != self.id {
            return false;
        }
        let Some(data) = self.pools[link.kind.index()].remove(link.key) else {
            log::trace!("Release of {:?} {:?} ignored: entry already gone", link.kind, link.key);
            return false;
        };
        log::debug!("Releasing {:?} entry of node {:?}", link.kind, data.source);
        self.destroy_owned(&data);
        true
    }

    /// Drops every entry of one kind without visiting the scene.
    pub fn release_kind(&mut self, kind: DalKind) -> usize {
        // Drained in place so slot versions survive and old links stay dead.
        let drained: Vec<DalData> = self.pools[kind.index()].drain().map(|(_, d)| d).collect();
        let count = drained.len();
        for data in &drained {
            self.destroy_owned(data);
        }
        if count > 0 {
            log::info!("Released {count} {kind:?} entries of {}", self.id);
        }
        count
    }

    /// Context teardown: every kind, then the shared default material.
    pub fn release_all(&mut self) -> usize {
        let released = DalKind::ALL.iter().map(|&k| self.release_kind(k)).sum();
        if let Some(material) = self.default_material.take() {
            self.backend.destroy(material);
        }
        released
    }

    #[must_use]
    pub fn count(&self, kind: DalKind) -> usize {
        self.pools[kind.index()].len()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.pools.iter().map(SlotMap::len).sum()
    }

    pub fn entries(&self, kind: DalKind) -> impl Iterator<Item = (DalKey, &DalData)> {
        self.pools[kind.index()].iter()
    }

    pub(crate) fn entries_mut(&mut self, kind: DalKind) -> impl Iterator<Item = (DalKey, &mut DalData)> {
        self.pools[kind.index()].iter_mut()
    }

    /// Whether any entry of any kind owns `handle`.
    #[must_use]
    pub fn owns(&self, handle: RtHandle) -> bool {
        self.pools
            .iter()
            .flat_map(SlotMap::values)
            .any(|d| d.owned_handles().contains(&handle))
    }

    /// The shared material borrowed by materials without an effect, created
    /// on first use.
    pub fn default_material(&mut self) -> BackendResult<RtHandle> {
        if let Some(handle) = self.default_material {
            return Ok(handle);
        }
        let handle = self.backend.create(&ResourceDesc::Material {
            programs: &[],
            samplers: &[],
            params: MaterialParams::default(),
        })?;
        log::debug!("Created default material for {}", self.id);
        self.default_material = Some(handle);
        Ok(handle)
    }

    #[must_use]
    pub fn default_material_handle(&self) -> Option<RtHandle> {
        self.default_material
    }

    fn destroy_owned(&mut self, data: &DalData) {
        for handle in data.owned_handles() {
            self.backend.destroy(handle);
        }
    }
}

impl<B: RtBackend> Drop for DalCreator<B> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::cache::{CachePayload, MaterialOwnership};
    use mirage_core::{Incarnation, NodeHandle};
    use mirage_scene::NodeIncarnations;

    fn node() -> NodeHandle {
        let mut map: SlotMap<NodeHandle, ()> = SlotMap::with_key();
        map.insert(())
    }

    fn group_entry(creator: &mut DalCreator<HeadlessBackend>) -> (DalLink, RtHandle) {
        let handle = creator
            .backend_mut()
            .create(&ResourceDesc::Group { children: &[] })
            .unwrap();
        let link = creator.add(DalData::new(
            node(),
            NodeIncarnations::default(),
            Some(handle),
            CachePayload::Group,
        ));
        (link, handle)
    }

    #[test]
    fn release_is_idempotent() {
        let mut creator = DalCreator::new(HeadlessBackend::new());
        let (link, handle) = group_entry(&mut creator);
        assert_eq!(creator.count(DalKind::Group), 1);

        assert!(creator.on_release(link));
        assert!(!creator.on_release(link));
        assert_eq!(creator.count(DalKind::Group), 0);
        assert_eq!(creator.backend().destroy_calls(handle), 1);
        assert_eq!(creator.backend().counters().double_destroys, 0);
        assert!(!creator.owns(handle));
    }

    #[test]
    fn foreign_links_do_not_resolve() {
        let mut a = DalCreator::new(HeadlessBackend::new());
        let mut b = DalCreator::new(HeadlessBackend::new());
        let (link, _) = group_entry(&mut a);
        assert!(b.get(link).is_none());
        assert!(!b.on_release(link));
        assert!(a.get(link).is_some());
    }

    #[test]
    fn release_kind_clears_only_that_kind() {
        let mut creator = DalCreator::new(HeadlessBackend::new());
        group_entry(&mut creator);
        group_entry(&mut creator);
        let buffer = creator
            .backend_mut()
            .create(&ResourceDesc::Buffer { bytes: &[], stride: 0 })
            .unwrap();
        creator.add(DalData::new(
            node(),
            NodeIncarnations::default(),
            Some(buffer),
            CachePayload::Buffer,
        ));

        assert_eq!(creator.release_kind(DalKind::Group), 2);
        assert_eq!(creator.count(DalKind::Buffer), 1);
        assert_eq!(creator.backend().live_count(), 1);
    }

    #[test]
    fn links_from_before_release_kind_never_resolve_again() {
        let mut creator = DalCreator::new(HeadlessBackend::new());
        let (old, _) = group_entry(&mut creator);
        creator.release_kind(DalKind::Group);

        let (fresh, _) = group_entry(&mut creator);
        assert_ne!(old, fresh);
        assert!(creator.get(old).is_none());
        assert!(!creator.on_release(old));
        assert!(creator.get(fresh).is_some());
    }

    #[test]
    fn borrowed_materials_never_destroy_the_default() {
        let mut creator = DalCreator::new(HeadlessBackend::new());
        let default = creator.default_material().unwrap();
        assert_eq!(creator.default_material().unwrap(), default);

        let link = creator.add(DalData::new(
            node(),
            NodeIncarnations::default(),
            Some(default),
            CachePayload::Material {
                ownership: MaterialOwnership::Borrowed,
                program: Incarnation::new(),
            },
        ));
        assert!(creator.on_release(link));
        assert!(creator.backend().is_live(default));

        creator.release_all();
        assert!(!creator.backend().is_live(default));
    }
}
