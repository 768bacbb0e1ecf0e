use glam::Affine3A;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use mirage_core::{BackendError, ResourceKind};

use super::{BackendResult, ResourceDesc, RtBackend, RtHandle};

/// Call counters of a [`HeadlessBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendCounters {
    pub created: u64,
    pub updated: u64,
    pub destroyed: u64,
    pub marked_dirty: u64,
    pub launches: u64,
    /// `destroy` on a handle that was already destroyed.
    pub double_destroys: u64,
    /// References to handles that were not live when the call happened.
    pub dangling_references: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCall {
    Create(RtHandle, ResourceKind),
    Update(RtHandle, ResourceKind),
    MarkDirty(RtHandle),
    Destroy(RtHandle),
    Launch(RtHandle),
}

/// What the headless backend remembers about a live object.
#[derive(Debug, Clone)]
pub struct HeadlessObject {
    pub kind: ResourceKind,
    pub references: Vec<RtHandle>,
    /// Matrix of transform objects.
    pub matrix: Option<Affine3A>,
    /// Number of updates applied since creation.
    pub version: u32,
    pub dirty: bool,
}

/// In-memory backend recording every call.
///
/// Checks the lifecycle rules a real runtime would trip over: destroying a
/// handle twice and referencing a destroyed handle both count as errors in
/// [`BackendCounters`]. Failures can be injected per resource kind.
#[derive(Debug)]
pub struct HeadlessBackend {
    next: u64,
    objects: FxHashMap<RtHandle, HeadlessObject>,
    calls: Vec<BackendCall>,
    counters: BackendCounters,
    in_place: bool,
    fail_create: FxHashSet<ResourceKind>,
    fail_update: FxHashSet<ResourceKind>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: 1,
            objects: FxHashMap::default(),
            calls: Vec::new(),
            counters: BackendCounters::default(),
            in_place: true,
            fail_create: FxHashSet::default(),
            fail_update: FxHashSet::default(),
        }
    }

    /// A backend that always replaces instead of updating.
    #[must_use]
    pub fn without_updates() -> Self {
        Self {
            in_place: false,
            ..Self::new()
        }
    }

    pub fn fail_creation(&mut self, kind: ResourceKind) {
        self.fail_create.insert(kind);
    }

    pub fn fail_updates(&mut self, kind: ResourceKind) {
        self.fail_update.insert(kind);
    }

    pub fn clear_failures(&mut self) {
        self.fail_create.clear();
        self.fail_update.clear();
    }

    #[must_use]
    pub fn counters(&self) -> BackendCounters {
        self.counters
    }

    #[must_use]
    pub fn calls(&self) -> &[BackendCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    #[must_use]
    pub fn is_live(&self, handle: RtHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    #[must_use]
    pub fn object(&self, handle: RtHandle) -> Option<&HeadlessObject> {
        self.objects.get(&handle)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn live_of_kind(&self, kind: ResourceKind) -> usize {
        self.objects.values().filter(|o| o.kind == kind).count()
    }

    /// How many times `handle` was passed to `destroy`.
    #[must_use]
    pub fn destroy_calls(&self, handle: RtHandle) -> usize {
        self.calls
            .iter()
            .filter(|c| **c == BackendCall::Destroy(handle))
            .count()
    }

    fn count_dangling(&mut self, references: &[RtHandle]) {
        let dangling = references
            .iter()
            .filter(|r| !self.objects.contains_key(r))
            .count() as u64;
        if dangling > 0 {
            log::warn!("Headless backend saw {dangling} dangling reference(s)");
        }
        self.counters.dangling_references += dangling;
    }

    fn describe(desc: &ResourceDesc<'_>) -> HeadlessObject {
        HeadlessObject {
            kind: desc.kind(),
            references: desc.references(),
            matrix: match desc {
                ResourceDesc::Transform { matrix, .. } => Some(*matrix),
                _ => None,
            },
            version: 0,
            dirty: false,
        }
    }
}

impl RtBackend for HeadlessBackend {
    fn create(&mut self, desc: &ResourceDesc<'_>) -> BackendResult<RtHandle> {
        let kind = desc.kind();
        if self.fail_create.contains(&kind) {
            return Err(BackendError::CreationFailed {
                kind,
                reason: "injected failure".into(),
            });
        }
        let object = Self::describe(desc);
        self.count_dangling(&object.references);

        let handle = RtHandle(self.next);
        self.next += 1;
        self.objects.insert(handle, object);
        self.calls.push(BackendCall::Create(handle, kind));
        self.counters.created += 1;
        Ok(handle)
    }

    fn supports_update(&self, _kind: ResourceKind) -> bool {
        self.in_place
    }

    fn update(&mut self, handle: RtHandle, desc: &ResourceDesc<'_>) -> BackendResult<()> {
        let kind = desc.kind();
        if self.fail_update.contains(&kind) {
            return Err(BackendError::UpdateFailed {
                kind,
                reason: "injected failure".into(),
            });
        }
        if !self.in_place {
            return Err(BackendError::Unsupported(format!("in-place update of {kind:?}")));
        }
        let mut replacement = Self::describe(desc);
        self.count_dangling(&replacement.references);

        let object = self
            .objects
            .get_mut(&handle)
            .ok_or(BackendError::UnknownHandle(handle.0))?;
        if object.kind != kind {
            return Err(BackendError::UpdateFailed {
                kind,
                reason: format!("handle {} is a {:?}", handle.0, object.kind),
            });
        }
        replacement.version = object.version + 1;
        *object = replacement;
        self.calls.push(BackendCall::Update(handle, kind));
        self.counters.updated += 1;
        Ok(())
    }

    fn mark_dirty(&mut self, handle: RtHandle) -> BackendResult<()> {
        let object = self
            .objects
            .get_mut(&handle)
            .ok_or(BackendError::UnknownHandle(handle.0))?;
        object.dirty = true;
        self.calls.push(BackendCall::MarkDirty(handle));
        self.counters.marked_dirty += 1;
        Ok(())
    }

    fn destroy(&mut self, handle: RtHandle) {
        self.calls.push(BackendCall::Destroy(handle));
        if self.objects.remove(&handle).is_some() {
            self.counters.destroyed += 1;
        } else if handle.0 < self.next {
            log::warn!("Headless backend: handle {} destroyed twice", handle.0);
            self.counters.double_destroys += 1;
        }
    }

    fn launch(
        &mut self,
        ray_generation: RtHandle,
        root: RtHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        if !self.objects.contains_key(&ray_generation) {
            return Err(BackendError::UnknownHandle(ray_generation.0));
        }
        if !self.objects.contains_key(&root) {
            return Err(BackendError::UnknownHandle(root.0));
        }

        // Everything reachable from the root must be live.
        let mut stack = vec![root];
        let mut seen = FxHashSet::default();
        let mut dangling = 0;
        while let Some(h) = stack.pop() {
            if !seen.insert(h) {
                continue;
            }
            match self.objects.get_mut(&h) {
                Some(object) => {
                    object.dirty = false;
                    stack.extend(object.references.iter().copied());
                }
                None => dangling += 1,
            }
        }
        self.counters.dangling_references += dangling;

        log::trace!("Headless launch {width}x{height} from {}", root.0);
        self.calls.push(BackendCall::Launch(root));
        self.counters.launches += 1;
        Ok(())
    }
}
