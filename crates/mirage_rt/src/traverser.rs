//! Scene mirror traversal
//!
//! [`RtTraverser`] walks the scene top-down once per pass. For every visited
//! node it checks the node's cache entry, rebuilds it when it is absent or
//! stale, and hands the backend handle to the parent. A parent is checked
//! before its children are enumerated and committed after them, so it always
//! links against the handles its current children resolved to.
//!
//! Every graph node reachable through active children is checked on every
//! pass; the check is a handful of integer comparisons. Inactive switch
//! children are not visited and keep their entries.
//!
//! A node reached again through another path is checked only once, but
//! containers still descend. A billboard below a shared container resolves
//! to a different instance per path, so the container gets a per-path
//! variant object for every path whose children differ from the primary.

use glam::{Affine3A, Quat, Vec3};
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;

use mirage_core::{DalKind, DalLink, Incarnation, MirageError, NodeHandle, ResourceKind, Result};
use mirage_scene::{BillboardAlignment, NodeIncarnations, NodeKind, ProgramDomain, Scene, ViewState};

use crate::backend::{GeometryInstance, ResourceDesc, RtBackend, RtHandle};
use crate::cache::{
    CachePayload, DalData, InstanceTransform, MaterialOwnership, PathVariant, dal_kind_of,
};
use crate::creator::DalCreator;
use crate::instance::{InstanceKeyMap, InstancePath};
use crate::settings::MirrorSettings;
use crate::validity::{self, CacheState, StaleFlags};

const PLACEMENT_EPSILON: f32 = 1e-5;

/// Counters of one [`RtTraverser::sync`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Validity checks performed.
    pub visited: u32,
    pub valid: u32,
    pub built: u32,
    pub updated_in_place: u32,
    /// Stale entries that got a new handle.
    pub replaced: u32,
    /// Valid entries rebuilt because a dependency handle changed.
    pub relinked: u32,
    pub refits: u32,
    pub instance_updates: u32,
    pub instances_pruned: u32,
    pub released: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub node: NodeHandle,
    pub kind: DalKind,
    pub state: CacheState,
}

/// Result of a pass: what a launch needs.
#[derive(Debug, Clone, Default)]
pub struct PublishedScene {
    pub pass: u64,
    pub root: Option<RtHandle>,
    pub effect: Option<NodeHandle>,
    pub programs: SmallVec<[(ProgramDomain, RtHandle); 4]>,
}

impl PublishedScene {
    #[must_use]
    pub fn program(&self, domain: ProgramDomain) -> Option<RtHandle> {
        self.programs
            .iter()
            .find(|(d, _)| *d == domain)
            .map(|(_, h)| *h)
    }
}

struct Walk {
    path: InstancePath,
    world: Affine3A,
}

struct Visit {
    link: Option<DalLink>,
    state: CacheState,
    /// Already synced earlier in this pass through another path.
    already: bool,
}

struct Committed {
    handle: RtHandle,
    /// Link of a freshly added entry, to be stored on the node.
    added: Option<DalLink>,
}

struct EntryInfo {
    link: DalLink,
    handle: Option<RtHandle>,
    owned: bool,
    relink: bool,
    bounding: Incarnation,
}

pub struct RtTraverser<B: RtBackend> {
    creator: DalCreator<B>,
    settings: MirrorSettings,
    instance_keys: InstanceKeyMap,
    pass: u64,
    stats: SyncStats,
    trace: Vec<TraceEvent>,
}

impl<B: RtBackend> RtTraverser<B> {
    pub fn new(backend: B, settings: MirrorSettings) -> Self {
        Self {
            creator: DalCreator::new(backend),
            settings,
            instance_keys: InstanceKeyMap::new(),
            pass: 0,
            stats: SyncStats::default(),
            trace: Vec::new(),
        }
    }

    #[inline]
    pub fn creator(&self) -> &DalCreator<B> {
        &self.creator
    }

    #[inline]
    pub fn backend(&self) -> &B {
        self.creator.backend()
    }

    #[inline]
    pub fn backend_mut(&mut self) -> &mut B {
        self.creator.backend_mut()
    }

    #[inline]
    pub fn settings(&self) -> &MirrorSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: MirrorSettings) {
        self.settings = settings;
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    #[inline]
    #[must_use]
    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Check events of the last pass, in visitation order. Empty unless
    /// `record_trace` is set.
    #[must_use]
    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    /// State recorded for `node` by its first check in the last pass.
    #[must_use]
    pub fn traced_state(&self, node: NodeHandle) -> Option<CacheState> {
        self.trace.iter().find(|e| e.node == node).map(|e| e.state)
    }

    #[inline]
    pub fn instance_keys(&self) -> &InstanceKeyMap {
        &self.instance_keys
    }

    /// Cache entry this mirror holds for `node`.
    #[must_use]
    pub fn entry(&self, scene: &Scene, node: NodeHandle) -> Option<&DalData> {
        let link = scene.dal_link(node, self.creator.id())?;
        self.creator.get(link).filter(|e| e.source == node)
    }

    /// Primary backend handle of `node`.
    #[must_use]
    pub fn handle_of(&self, scene: &Scene, node: NodeHandle) -> Option<RtHandle> {
        self.entry(scene, node).and_then(DalData::handle)
    }

    /// Per-path instance handles of a billboard, sorted.
    #[must_use]
    pub fn instance_handles(&self, scene: &Scene, node: NodeHandle) -> Vec<RtHandle> {
        let mut handles: Vec<RtHandle> = self
            .entry(scene, node)
            .and_then(DalData::instances)
            .map(|m| m.values().map(|i| i.handle).collect())
            .unwrap_or_default();
        handles.sort_unstable();
        handles
    }

    /// Per-path variant handles of a shared container, sorted.
    #[must_use]
    pub fn variant_handles(&self, scene: &Scene, node: NodeHandle) -> Vec<RtHandle> {
        let mut handles: Vec<RtHandle> = self
            .entry(scene, node)
            .map(|e| e.variants().values().map(|v| v.handle).collect())
            .unwrap_or_default();
        handles.sort_unstable();
        handles
    }

    /// Validity of `node`'s entry right now, without rebuilding anything.
    pub fn check(&self, scene: &Scene, node: NodeHandle) -> Result<CacheState> {
        let n = scene.get_node(node)?;
        let entry = self.entry(scene, node);
        Ok(validity::check(scene, n, entry, self.settings.default_build_hints))
    }

    // ========================================================================
    // Pass
    // ========================================================================

    /// Runs one pass: releases entries of removed nodes, brings every
    /// reachable entry up to date and returns the handles to launch with.
    ///
    /// A backend failure aborts the pass. Entries already rebuilt keep their
    /// new state; the failing entry keeps its old snapshot and is retried on
    /// the next pass.
    pub fn sync(&mut self, scene: &mut Scene, view: &ViewState) -> Result<PublishedScene> {
        self.pass += 1;
        self.stats = SyncStats::default();
        self.trace.clear();

        for link in scene.drain_released(self.creator.id()) {
            if self.creator.on_release(link) {
                self.stats.released += 1;
            }
        }

        let mut walk = Walk {
            path: InstancePath::new(),
            world: Affine3A::IDENTITY,
        };
        let root = match scene.root() {
            Some(root) => Some(self.sync_node(scene, view, root, &mut walk)?),
            None => None,
        };
        let effect = scene.scene_effect();
        let programs = match effect {
            Some(e) => self.sync_effect(scene, e)?,
            None => SmallVec::new(),
        };

        self.prune_instances();
        log::debug!("Mirror pass {}: {:?}", self.pass, self.stats);

        Ok(PublishedScene {
            pass: self.pass,
            root,
            effect,
            programs,
        })
    }

    /// Launches the ray-generation program over the published root.
    ///
    /// Returns `Ok(false)` when there is nothing to launch.
    pub fn launch(&mut self, published: &PublishedScene, width: u32, height: u32) -> Result<bool> {
        let (Some(root), Some(ray_generation), Some(effect)) = (
            published.root,
            published.program(ProgramDomain::RayGeneration),
            published.effect,
        ) else {
            log::warn!("Nothing to launch: missing root or ray-generation program");
            return Ok(false);
        };
        self.creator
            .backend_mut()
            .launch(ray_generation, root, width, height)
            .map_err(|e| MirageError::backend(ResourceKind::Program, effect, e))?;
        Ok(true)
    }

    /// Bulk-releases one entry kind. Nodes keep their now dangling links;
    /// they resolve to nothing and get rebuilt on the next visit.
    pub fn release_kind(&mut self, kind: DalKind) -> usize {
        self.creator.release_kind(kind)
    }

    /// Context teardown.
    pub fn shutdown(&mut self) -> usize {
        let released = self.creator.release_all();
        self.instance_keys.clear();
        log::info!("Mirror {} shut down, {released} entries released", self.creator.id());
        released
    }

    // ========================================================================
    // Per-kind sync
    // ========================================================================

    fn sync_node(
        &mut self,
        scene: &mut Scene,
        view: &ViewState,
        node: NodeHandle,
        walk: &mut Walk,
    ) -> Result<RtHandle> {
        match dal_kind_of(scene.get_node(node)?.kind()) {
            DalKind::Group | DalKind::Transform | DalKind::Selector => {
                self.sync_container(scene, view, node, walk)
            }
            DalKind::Billboard => self.sync_billboard(scene, view, node, walk),
            DalKind::GeometryGroup => self.sync_geo_node(scene, view, node, walk),
            DalKind::Geometry => self.sync_geometry(scene, node),
            _ => Err(MirageError::KindMismatch {
                node,
                expected: "graph node",
            }),
        }
    }

    fn sync_container(
        &mut self,
        scene: &mut Scene,
        view: &ViewState,
        node: NodeHandle,
        walk: &mut Walk,
    ) -> Result<RtHandle> {
        let visit = self.begin(scene, node)?;
        let local = scene
            .get_node(node)?
            .transform()
            .copied()
            .unwrap_or(Affine3A::IDENTITY);
        let children = self.sync_children(scene, view, node, walk, local)?;

        let n = scene.get_node(node)?;
        let live = n.incarnations();
        let (desc, payload) = match n.kind() {
            NodeKind::Transform(matrix) => (
                ResourceDesc::Transform {
                    matrix: *matrix,
                    children: &children,
                },
                CachePayload::Transform,
            ),
            NodeKind::Switch(switch) => (
                ResourceDesc::Selector {
                    children: &children,
                },
                CachePayload::Selector {
                    selection: switch.selection_incarnation(),
                },
            ),
            _ => (
                ResourceDesc::Group {
                    children: &children,
                },
                CachePayload::Group,
            ),
        };
        if let Some(link) = visit.link.filter(|_| visit.already) {
            return self.sync_variant(node, link, &walk.path, &desc, &children);
        }
        let committed = self.commit(node, live, &visit, &desc, &children, payload)?;
        self.finish(scene, node, committed)
    }

    fn sync_billboard(
        &mut self,
        scene: &mut Scene,
        view: &ViewState,
        node: NodeHandle,
        walk: &mut Walk,
    ) -> Result<RtHandle> {
        let n = scene.get_node(node)?;
        let Some(alignment) = n.billboard() else {
            return Err(MirageError::KindMismatch {
                node,
                expected: "Billboard",
            });
        };
        let placement = billboard_placement(alignment, &walk.world, view.camera_position());

        let visit = self.begin(scene, node)?;
        let children = self.sync_children(scene, view, node, walk, placement)?;
        let desc = ResourceDesc::Group {
            children: &children,
        };
        let group = match visit.link {
            Some(link) if visit.already => {
                self.sync_variant(node, link, &walk.path, &desc, &children)?
            }
            _ => {
                let live = scene.get_node(node)?.incarnations();
                let committed = self.commit(
                    node,
                    live,
                    &visit,
                    &desc,
                    &children,
                    CachePayload::Billboard {
                        instances: FxHashMap::default(),
                    },
                )?;
                self.finish(scene, node, committed)?
            }
        };

        let own = scene.get_node(node)?.incarnations().own;
        let Some(link) = scene.dal_link(node, self.creator.id()) else {
            return Ok(group);
        };
        self.sync_instance(node, link, group, placement, own, &walk.path)
    }

    fn sync_instance(
        &mut self,
        node: NodeHandle,
        link: DalLink,
        group: RtHandle,
        placement: Affine3A,
        own: Incarnation,
        path: &[u32],
    ) -> Result<RtHandle> {
        let id = self.instance_keys.intern(path, self.pass);
        let existing = self
            .creator
            .get(link)
            .and_then(DalData::instances)
            .and_then(|m| m.get(&id))
            .copied();

        let children = [group];
        let desc = ResourceDesc::Transform {
            matrix: placement,
            children: &children,
        };
        let handle = match existing {
            Some(instance)
                if instance.own == own
                    && instance.child == group
                    && instance.placement.abs_diff_eq(placement, PLACEMENT_EPSILON) =>
            {
                instance.handle
            }
            Some(instance) => {
                let (handle, _) = self.rebuild(node, instance.handle, &desc)?;
                self.stats.instance_updates += 1;
                log::debug!("Updated billboard instance {id:?} of {node:?}");
                handle
            }
            None => {
                let handle = self.create(node, &desc)?;
                self.stats.built += 1;
                log::debug!("Built billboard instance {id:?} of {node:?} for path {path:?}");
                handle
            }
        };

        if let Some(entry) = self.creator.get_mut(link)
            && let CachePayload::Billboard { instances } = &mut entry.payload
        {
            instances.insert(
                id,
                InstanceTransform {
                    handle,
                    placement,
                    own,
                    child: group,
                    last_seen: self.pass,
                },
            );
        }
        Ok(handle)
    }

    /// Handle of a container revisited through `path` in the same pass.
    ///
    /// Paths whose children resolved to the handles the primary object links
    /// share it. Any other path gets its own variant, kept in line with the
    /// snapshot the primary was committed with earlier in this pass.
    fn sync_variant(
        &mut self,
        node: NodeHandle,
        link: DalLink,
        path: &[u32],
        desc: &ResourceDesc<'_>,
        children: &[RtHandle],
    ) -> Result<RtHandle> {
        let Some((primary, snapshot, shared)) = self
            .creator
            .get(link)
            .and_then(|e| Some((e.handle?, e.snapshot, e.linked.as_slice() == children)))
        else {
            return Err(MirageError::NodeNotFound(node));
        };
        if shared {
            return Ok(primary);
        }

        let id = self.instance_keys.intern(path, self.pass);
        let existing = self
            .creator
            .get(link)
            .and_then(|e| e.variants.get(&id))
            .map(|v| (v.handle, v.snapshot, v.linked.as_slice() == children));

        let handle = match existing {
            Some((handle, built, true))
                if validity::compare(&built, &snapshot)
                    .difference(StaleFlags::BOUNDING)
                    .is_empty() =>
            {
                if link.kind == DalKind::Group && !built.bounding.equals(&snapshot.bounding) {
                    self.creator
                        .backend_mut()
                        .mark_dirty(handle)
                        .map_err(|e| MirageError::backend(desc.kind(), node, e))?;
                    self.stats.refits += 1;
                }
                handle
            }
            Some((handle, ..)) => {
                let (handle, in_place) = self.rebuild(node, handle, desc)?;
                if in_place {
                    self.stats.updated_in_place += 1;
                } else {
                    self.stats.replaced += 1;
                }
                handle
            }
            None => {
                let handle = self.create(node, desc)?;
                self.stats.built += 1;
                log::debug!("Built {:?} variant of {node:?} for path {path:?}", link.kind);
                handle
            }
        };

        if let Some(entry) = self.creator.get_mut(link) {
            entry.variants.insert(
                id,
                PathVariant {
                    handle,
                    linked: SmallVec::from_slice(children),
                    snapshot,
                    last_seen: self.pass,
                },
            );
        }
        Ok(handle)
    }

    fn sync_geo_node(
        &mut self,
        scene: &mut Scene,
        view: &ViewState,
        node: NodeHandle,
        walk: &mut Walk,
    ) -> Result<RtHandle> {
        let visit = self.begin(scene, node)?;
        if let Some(handle) = self.reused(&visit) {
            return Ok(handle);
        }

        let geometries = self.sync_children(scene, view, node, walk, Affine3A::IDENTITY)?;
        let (material, hints) = {
            let geo = scene
                .get_node(node)?
                .geo_node()
                .ok_or(MirageError::KindMismatch {
                    node,
                    expected: "GeoNode",
                })?;
            (geo.material, geo.hints | self.settings.default_build_hints)
        };
        let material = match material {
            Some(m) => self.sync_material(scene, m)?,
            None => self
                .creator
                .default_material()
                .map_err(|e| MirageError::backend(ResourceKind::Material, node, e))?,
        };

        let instances: SmallVec<[GeometryInstance; 8]> = geometries
            .iter()
            .map(|&geometry| GeometryInstance { geometry, material })
            .collect();
        let mut linked = geometries.clone();
        linked.push(material);

        let live = scene.get_node(node)?.incarnations();
        let committed = self.commit(
            node,
            live,
            &visit,
            &ResourceDesc::GeometryGroup {
                instances: &instances,
                hints,
            },
            &linked,
            CachePayload::GeometryGroup { hints },
        )?;
        self.finish(scene, node, committed)
    }

    /// Geometry owns two backend objects: the vertex buffer and the geometry
    /// built on it.
    fn sync_geometry(&mut self, scene: &mut Scene, node: NodeHandle) -> Result<RtHandle> {
        let visit = self.begin(scene, node)?;
        if let Some(handle) = self.reused(&visit) {
            return Ok(handle);
        }

        let live = scene.get_node(node)?.incarnations();
        let existing = visit.link.and_then(|link| {
            let entry = self.creator.get(link)?;
            match entry.payload {
                CachePayload::Geometry { vertices } => Some((link, entry.handle?, vertices)),
                _ => None,
            }
        });

        if visit.state.is_valid()
            && let Some((link, handle, _)) = existing
        {
            self.touch(link, live);
            self.stats.valid += 1;
            return Ok(handle);
        }

        let data = scene
            .get_node(node)?
            .geometry()
            .ok_or(MirageError::KindMismatch {
                node,
                expected: "Geometry",
            })?;
        let bytes: &[u8] = bytemuck::cast_slice(&data.positions);
        let primitive_count = data.primitive_count();
        let vertex_desc = ResourceDesc::Buffer { bytes, stride: 12 };

        let added = match existing {
            Some((link, handle, vertices)) => {
                let (vertices, vertices_in_place) = self.rebuild(node, vertices, &vertex_desc)?;
                // The old buffer is gone; a failing geometry rebuild must not
                // leave the entry pointing at it.
                if !vertices_in_place && let Some(entry) = self.creator.get_mut(link) {
                    entry.payload = CachePayload::Geometry { vertices };
                    entry.linked = SmallVec::from_slice(&[vertices]);
                }
                let (geometry, geometry_in_place) = self.rebuild(
                    node,
                    handle,
                    &ResourceDesc::Geometry {
                        vertices,
                        primitive_count,
                    },
                )?;
                if vertices_in_place && geometry_in_place {
                    self.stats.updated_in_place += 1;
                } else {
                    self.stats.replaced += 1;
                }
                if let Some(entry) = self.creator.get_mut(link) {
                    entry.snapshot = live;
                    entry.handle = Some(geometry);
                    entry.payload = CachePayload::Geometry { vertices };
                    entry.linked = SmallVec::from_slice(&[vertices]);
                    entry.last_visited = self.pass;
                }
                Committed {
                    handle: geometry,
                    added: None,
                }
            }
            None => {
                let vertices = self.create(node, &vertex_desc)?;
                let geometry = match self.create(
                    node,
                    &ResourceDesc::Geometry {
                        vertices,
                        primitive_count,
                    },
                ) {
                    Ok(geometry) => geometry,
                    Err(e) => {
                        self.creator.backend_mut().destroy(vertices);
                        return Err(e);
                    }
                };
                let mut entry = DalData::new(
                    node,
                    live,
                    Some(geometry),
                    CachePayload::Geometry { vertices },
                );
                entry.linked.push(vertices);
                entry.last_visited = self.pass;
                self.stats.built += 1;
                log::debug!("Built Geometry of {node:?} ({primitive_count} primitives)");
                Committed {
                    handle: geometry,
                    added: Some(self.creator.add(entry)),
                }
            }
        };
        self.finish(scene, node, added)
    }

    fn sync_material(&mut self, scene: &mut Scene, node: NodeHandle) -> Result<RtHandle> {
        let visit = self.begin(scene, node)?;
        if let Some(handle) = self.reused(&visit) {
            return Ok(handle);
        }

        let n = scene.get_node(node)?;
        let program = validity::live_program_incarnation(scene, n);
        let Some(material) = n.material() else {
            return Err(MirageError::KindMismatch {
                node,
                expected: "Material",
            });
        };
        let (effect, samplers, params) = (material.effect, material.samplers.clone(), material.params);

        let Some(effect) = effect else {
            return self.borrow_default_material(scene, node, &visit);
        };

        let mut sampler_handles: SmallVec<[RtHandle; 4]> = SmallVec::new();
        for sampler in samplers {
            sampler_handles.push(self.sync_sampler(scene, sampler)?);
        }
        let programs: SmallVec<[RtHandle; 4]> = self
            .sync_effect(scene, effect)?
            .iter()
            .filter(|(domain, _)| domain.is_hit_domain())
            .map(|(_, h)| *h)
            .collect();

        let linked: SmallVec<[RtHandle; 8]> = programs
            .iter()
            .chain(sampler_handles.iter())
            .copied()
            .collect();
        let live = scene.get_node(node)?.incarnations();
        let committed = self.commit(
            node,
            live,
            &visit,
            &ResourceDesc::Material {
                programs: &programs,
                samplers: &sampler_handles,
                params,
            },
            &linked,
            CachePayload::Material {
                ownership: MaterialOwnership::Owned,
                program,
            },
        )?;
        self.finish(scene, node, committed)
    }

    /// Materials without an effect render with the creator's default material.
    fn borrow_default_material(
        &mut self,
        scene: &mut Scene,
        node: NodeHandle,
        visit: &Visit,
    ) -> Result<RtHandle> {
        let default = self
            .creator
            .default_material()
            .map_err(|e| MirageError::backend(ResourceKind::Material, node, e))?;
        let live = scene.get_node(node)?.incarnations();
        let payload = CachePayload::Material {
            ownership: MaterialOwnership::Borrowed,
            program: Incarnation::new(),
        };

        let Some(link) = visit.link else {
            let mut entry = DalData::new(node, live, Some(default), payload);
            entry.linked.push(default);
            entry.last_visited = self.pass;
            self.stats.built += 1;
            let link = self.creator.add(entry);
            return self.finish(
                scene,
                node,
                Committed {
                    handle: default,
                    added: Some(link),
                },
            );
        };

        let previous = self.creator.get(link).map(|e| (e.owns_handle(), e.handle));
        if let Some((true, Some(owned))) = previous {
            log::debug!("Material {node:?} lost its effect; borrowing the default");
            self.creator.backend_mut().destroy(owned);
            self.stats.replaced += 1;
        } else {
            self.stats.valid += 1;
        }
        if let Some(entry) = self.creator.get_mut(link) {
            entry.snapshot = live;
            entry.handle = Some(default);
            entry.payload = payload;
            entry.linked = SmallVec::from_slice(&[default]);
            entry.last_visited = self.pass;
        }
        Ok(default)
    }

    /// Compiles every program of an effect. Programs are replaced as a set:
    /// either all new handles exist or the entry keeps its old ones.
    fn sync_effect(
        &mut self,
        scene: &mut Scene,
        node: NodeHandle,
    ) -> Result<SmallVec<[(ProgramDomain, RtHandle); 4]>> {
        let visit = self.begin(scene, node)?;
        let existing = visit.link.and_then(|link| {
            self.creator
                .get(link)
                .and_then(DalData::programs)
                .map(|p| (link, SmallVec::<[(ProgramDomain, RtHandle); 4]>::from_slice(p)))
        });

        let live = scene.get_node(node)?.incarnations();
        if let Some((link, programs)) = &existing
            && (visit.already || visit.state.is_valid())
        {
            if !visit.already {
                self.touch(*link, live);
                self.stats.valid += 1;
            }
            return Ok(programs.clone());
        }

        let effect = scene
            .get_node(node)?
            .effect()
            .ok_or(MirageError::KindMismatch {
                node,
                expected: "Effect",
            })?;
        let program = effect.program_incarnation();

        let mut fresh: SmallVec<[(ProgramDomain, RtHandle); 4]> = SmallVec::new();
        for source in effect.programs() {
            let desc = ResourceDesc::Program {
                domain: source.domain,
                entry_point: &source.entry_point,
                source: &source.source,
            };
            match self.create(node, &desc) {
                Ok(handle) => fresh.push((source.domain, handle)),
                Err(e) => {
                    for (_, handle) in fresh {
                        self.creator.backend_mut().destroy(handle);
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("Compiled {} program(s) for effect {node:?}", fresh.len());

        let payload = CachePayload::Effect {
            programs: fresh.clone(),
            program,
        };
        match existing {
            Some((link, old)) => {
                for (_, handle) in old {
                    self.creator.backend_mut().destroy(handle);
                }
                if let Some(entry) = self.creator.get_mut(link) {
                    entry.snapshot = live;
                    entry.payload = payload;
                    entry.last_visited = self.pass;
                }
                self.stats.replaced += 1;
            }
            None => {
                let mut entry = DalData::new(node, live, None, payload);
                entry.last_visited = self.pass;
                let link = self.creator.add(entry);
                scene.attach_dal(node, link)?;
                self.stats.built += 1;
            }
        }
        Ok(fresh)
    }

    fn sync_sampler(&mut self, scene: &mut Scene, node: NodeHandle) -> Result<RtHandle> {
        let visit = self.begin(scene, node)?;
        if let Some(handle) = self.reused(&visit) {
            return Ok(handle);
        }

        let (buffer, params) = {
            let sampler = scene
                .get_node(node)?
                .sampler()
                .ok_or(MirageError::KindMismatch {
                    node,
                    expected: "Sampler",
                })?;
            (sampler.buffer, sampler.params)
        };
        let buffer = match buffer {
            Some(b) => Some(self.sync_buffer(scene, b)?),
            None => None,
        };
        let linked: SmallVec<[RtHandle; 1]> = buffer.into_iter().collect();

        let live = scene.get_node(node)?.incarnations();
        let committed = self.commit(
            node,
            live,
            &visit,
            &ResourceDesc::TextureSampler { buffer, params },
            &linked,
            CachePayload::TextureSampler,
        )?;
        self.finish(scene, node, committed)
    }

    fn sync_buffer(&mut self, scene: &mut Scene, node: NodeHandle) -> Result<RtHandle> {
        let visit = self.begin(scene, node)?;
        if let Some(handle) = self.reused(&visit) {
            return Ok(handle);
        }

        let n = scene.get_node(node)?;
        let live = n.incarnations();
        let data = n.buffer().ok_or(MirageError::KindMismatch {
            node,
            expected: "Buffer",
        })?;
        let committed = self.commit(
            node,
            live,
            &visit,
            &ResourceDesc::Buffer {
                bytes: &data.bytes,
                stride: data.stride,
            },
            &[],
            CachePayload::Buffer,
        )?;
        self.finish(scene, node, committed)
    }

    // ========================================================================
    // Protocol
    // ========================================================================

    /// Checks the entry of `node` once per pass.
    fn begin(&mut self, scene: &Scene, node: NodeHandle) -> Result<Visit> {
        let n = scene.get_node(node)?;
        let link = scene
            .dal_link(node, self.creator.id())
            .filter(|&l| self.creator.get(l).is_some_and(|e| e.source == node));
        let entry = link.and_then(|l| self.creator.get(l));

        if entry.is_some_and(|e| e.last_visited == self.pass) {
            return Ok(Visit {
                link,
                state: CacheState::Valid,
                already: true,
            });
        }

        let kind = dal_kind_of(n.kind());
        let state = validity::check(scene, n, entry, self.settings.default_build_hints);
        self.stats.visited += 1;
        log::trace!("Check {kind:?} {node:?}: {state}");
        if self.settings.record_trace {
            self.trace.push(TraceEvent { node, kind, state });
        }
        Ok(Visit {
            link,
            state,
            already: false,
        })
    }

    fn reused(&self, visit: &Visit) -> Option<RtHandle> {
        if !visit.already {
            return None;
        }
        visit
            .link
            .and_then(|l| self.creator.get(l))
            .and_then(DalData::handle)
    }

    fn sync_children(
        &mut self,
        scene: &mut Scene,
        view: &ViewState,
        node: NodeHandle,
        walk: &mut Walk,
        local: Affine3A,
    ) -> Result<SmallVec<[RtHandle; 8]>> {
        let children: SmallVec<[(usize, NodeHandle); 8]> = {
            let n = scene.get_node(node)?;
            let indices = n.active_child_indices();
            if n.switch().is_some() && indices.len() != n.switch().map_or(0, |s| s.active().len()) {
                log::warn!("Switch {node:?} selects child indices out of range");
            }
            indices.iter().map(|&i| (i, n.children()[i])).collect()
        };

        let parent_world = walk.world;
        walk.world = parent_world * local;
        let mut handles = SmallVec::new();
        for (index, child) in children {
            walk.path.push(index as u32);
            let result = self.sync_node(scene, view, child, walk);
            walk.path.pop();
            match result {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    walk.world = parent_world;
                    return Err(e);
                }
            }
        }
        walk.world = parent_world;
        Ok(handles)
    }

    /// Brings one single-handle entry in line with `desc`.
    ///
    /// - absent: create and register
    /// - valid, same dependency handles: keep (refit groups whose bounds moved)
    /// - stale, or valid with changed dependency handles: update in place
    ///   when allowed, otherwise create a replacement and destroy the old one
    fn commit(
        &mut self,
        node: NodeHandle,
        live: NodeIncarnations,
        visit: &Visit,
        desc: &ResourceDesc<'_>,
        linked: &[RtHandle],
        payload: CachePayload,
    ) -> Result<Committed> {
        let info = visit.link.and_then(|link| {
            self.creator.get(link).map(|e| EntryInfo {
                link,
                handle: e.handle,
                owned: e.owns_handle(),
                relink: e.linked.as_slice() != linked,
                bounding: e.snapshot.bounding,
            })
        });

        let Some(EntryInfo {
            link,
            handle: Some(current),
            owned,
            relink,
            bounding,
        }) = info
        else {
            let handle = self.create(node, desc)?;
            let mut entry = DalData::new(node, live, Some(handle), payload);
            entry.linked = SmallVec::from_slice(linked);
            entry.last_visited = self.pass;
            self.stats.built += 1;
            log::debug!("Built {:?} for {node:?}", desc.kind());
            return Ok(Committed {
                handle,
                added: Some(self.creator.add(entry)),
            });
        };

        let handle = if !owned {
            let handle = self.create(node, desc)?;
            self.stats.built += 1;
            handle
        } else if visit.state.is_valid() && !relink {
            if matches!(link.kind, DalKind::Group | DalKind::GeometryGroup)
                && !live.bounding.equals(&bounding)
            {
                self.creator
                    .backend_mut()
                    .mark_dirty(current)
                    .map_err(|e| MirageError::backend(desc.kind(), node, e))?;
                self.stats.refits += 1;
                log::debug!("Refit {:?} of {node:?}", link.kind);
            }
            self.stats.valid += 1;
            current
        } else {
            let (handle, in_place) = self.rebuild(node, current, desc)?;
            if visit.state.is_valid() {
                self.stats.relinked += 1;
            } else if in_place {
                self.stats.updated_in_place += 1;
            } else {
                self.stats.replaced += 1;
            }
            handle
        };

        if let Some(entry) = self.creator.get_mut(link) {
            entry.snapshot = live;
            entry.handle = Some(handle);
            entry.linked = SmallVec::from_slice(linked);
            entry.last_visited = self.pass;
            if !matches!(entry.payload, CachePayload::Billboard { .. }) {
                entry.payload = payload;
            }
        }
        Ok(Committed {
            handle,
            added: None,
        })
    }

    fn finish(&mut self, scene: &mut Scene, node: NodeHandle, committed: Committed) -> Result<RtHandle> {
        if let Some(link) = committed.added {
            scene.attach_dal(node, link)?;
        }
        Ok(committed.handle)
    }

    /// Update in place when allowed, else create a replacement and destroy
    /// the old handle. Returns the handle now in use and whether it is the
    /// same one.
    fn rebuild(
        &mut self,
        node: NodeHandle,
        handle: RtHandle,
        desc: &ResourceDesc<'_>,
    ) -> Result<(RtHandle, bool)> {
        let kind = desc.kind();
        let backend = self.creator.backend_mut();
        if self.settings.update_in_place && backend.supports_update(kind) {
            backend
                .update(handle, desc)
                .map_err(|e| MirageError::backend(kind, node, e))?;
            log::debug!("Updated {kind:?} of {node:?} in place");
            Ok((handle, true))
        } else {
            let fresh = backend
                .create(desc)
                .map_err(|e| MirageError::backend(kind, node, e))?;
            backend.destroy(handle);
            log::debug!("Replaced {kind:?} of {node:?}");
            Ok((fresh, false))
        }
    }

    fn create(&mut self, node: NodeHandle, desc: &ResourceDesc<'_>) -> Result<RtHandle> {
        self.creator
            .backend_mut()
            .create(desc)
            .map_err(|e| MirageError::backend(desc.kind(), node, e))
    }

    fn touch(&mut self, link: DalLink, live: NodeIncarnations) {
        let pass = self.pass;
        if let Some(entry) = self.creator.get_mut(link) {
            entry.snapshot = live;
            entry.last_visited = pass;
        }
    }

    fn prune_instances(&mut self) {
        if !self.settings.prune_instances {
            return;
        }
        let pass = self.pass;
        let ttl = self.settings.instance_ttl_passes;

        let mut expired = Vec::new();
        for kind in [
            DalKind::Group,
            DalKind::Transform,
            DalKind::Selector,
            DalKind::Billboard,
        ] {
            for (_, entry) in self.creator.entries_mut(kind) {
                entry.variants.retain(|_, variant| {
                    let keep = pass.saturating_sub(variant.last_seen) <= ttl;
                    if !keep {
                        expired.push(variant.handle);
                    }
                    keep
                });
                if let CachePayload::Billboard { instances } = &mut entry.payload {
                    instances.retain(|_, instance| {
                        let keep = pass.saturating_sub(instance.last_seen) <= ttl;
                        if !keep {
                            expired.push(instance.handle);
                        }
                        keep
                    });
                }
            }
        }
        for handle in expired {
            self.creator.backend_mut().destroy(handle);
            self.stats.instances_pruned += 1;
        }
        let freed = self.instance_keys.prune(pass, ttl);
        if freed > 0 {
            log::debug!("Pruned {freed} instance path(s)");
        }
    }
}

/// Orientation of a billboard instance so that its local +Z faces the camera.
fn billboard_placement(alignment: BillboardAlignment, world: &Affine3A, camera: Vec3) -> Affine3A {
    let local_camera = world.inverse().transform_point3(camera);
    let Some(direction) = local_camera.try_normalize() else {
        return Affine3A::IDENTITY;
    };
    let rotation = match alignment {
        BillboardAlignment::Screen => Quat::from_rotation_arc(Vec3::Z, direction),
        BillboardAlignment::Axis(axis) => {
            let Some(axis) = axis.try_normalize() else {
                return Affine3A::IDENTITY;
            };
            let forward = Vec3::Z.reject_from_normalized(axis).try_normalize();
            let target = direction.reject_from_normalized(axis).try_normalize();
            match (forward, target) {
                (Some(f), Some(t)) => Quat::from_rotation_arc(f, t),
                _ => Quat::IDENTITY,
            }
        }
    };
    Affine3A::from_quat(rotation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_billboard_faces_camera() {
        let placement = billboard_placement(
            BillboardAlignment::Screen,
            &Affine3A::IDENTITY,
            Vec3::new(10.0, 0.0, 0.0),
        );
        let facing = placement.transform_vector3(Vec3::Z);
        assert!(facing.abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn axis_billboard_keeps_axis() {
        let placement = billboard_placement(
            BillboardAlignment::Axis(Vec3::Y),
            &Affine3A::IDENTITY,
            Vec3::new(5.0, 7.0, 0.0),
        );
        assert!(placement.transform_vector3(Vec3::Y).abs_diff_eq(Vec3::Y, 1e-5));
        assert!(placement.transform_vector3(Vec3::Z).abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn camera_at_billboard_gives_identity() {
        let placement = billboard_placement(
            BillboardAlignment::Screen,
            &Affine3A::from_translation(Vec3::ONE),
            Vec3::ONE,
        );
        assert_eq!(placement, Affine3A::IDENTITY);
    }
}
