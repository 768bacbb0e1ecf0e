use std::sync::atomic::{AtomicU32, Ordering};

use glam::{Affine3A, Vec3};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use slotmap::{SecondaryMap, SlotMap};

use mirage_core::{
    CreatorId, DalLink, Incarnation, IncarnationGuard, MirageError, NodeHandle, Result,
};

use crate::bounds::{BoundingBox, union_all};
use crate::node::{
    BillboardAlignment, BufferData, BuildHints, EffectData, GeoNodeData, GeometryData,
    MaterialData, MaterialParams, Node, NodeIncarnations, NodeKind, ProgramDomain, ProgramSource,
    SamplerData, SamplerParams, SwitchData,
};
use crate::skin::{Skin, SkinKey};

static NEXT_SCENE_ID: AtomicU32 = AtomicU32::new(1);

/// Scene graph
///
/// Owns every node in a `SlotMap` and is the only place node state can be
/// mutated. Each mutation bumps exactly the incarnations of its change class:
///
/// | Edit | Counters |
/// |------|----------|
/// | attribute edits (name, material, buffer, sampler, ...) | own |
/// | transform matrix, geometry positions | own + bounding (ancestors) |
/// | child list edits | parent tree + bounding (ancestors) |
/// | switch selection | selection + bounding (ancestors) |
/// | effect programs | program |
/// | build hints | none |
///
/// Cache consumers never get notified; they compare snapshots on their next
/// visit.
pub struct Scene {
    id: u32,

    nodes: SlotMap<NodeHandle, Node>,
    root: Option<NodeHandle>,
    effect: Option<NodeHandle>,

    skins: SlotMap<SkinKey, Skin>,

    /// DAL links detached from nodes, waiting for their creator.
    released: Vec<DalLink>,

    bounds_cache: Mutex<SecondaryMap<NodeHandle, (Incarnation, Option<BoundingBox>)>>,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_SCENE_ID.fetch_add(1, Ordering::Relaxed),
            nodes: SlotMap::with_key(),
            root: None,
            effect: None,
            skins: SlotMap::with_key(),
            released: Vec::new(),
            bounds_cache: Mutex::new(SecondaryMap::new()),
        }
    }

    /// Process-unique id of this scene.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    // ========================================================================
    // Creation & access
    // ========================================================================

    pub fn create_node(&mut self, kind: NodeKind) -> NodeHandle {
        self.create_named(kind.name(), kind)
    }

    pub fn create_named(&mut self, name: &str, kind: NodeKind) -> NodeHandle {
        self.nodes.insert(Node::new(name, kind))
    }

    pub fn create_group(&mut self) -> NodeHandle {
        self.create_node(NodeKind::Group)
    }

    pub fn create_transform(&mut self, matrix: Affine3A) -> NodeHandle {
        self.create_node(NodeKind::Transform(matrix))
    }

    pub fn create_billboard(&mut self, alignment: BillboardAlignment) -> NodeHandle {
        self.create_node(NodeKind::Billboard(alignment))
    }

    pub fn create_switch(&mut self) -> NodeHandle {
        self.create_node(NodeKind::Switch(SwitchData::new()))
    }

    pub fn create_geo_node(&mut self, hints: BuildHints) -> NodeHandle {
        self.create_node(NodeKind::GeoNode(GeoNodeData {
            material: None,
            hints,
        }))
    }

    pub fn create_geometry(&mut self, positions: Vec<Vec3>, indices: Vec<u32>) -> NodeHandle {
        self.create_node(NodeKind::Geometry(GeometryData::new(positions, indices)))
    }

    pub fn create_material(&mut self, params: MaterialParams) -> NodeHandle {
        self.create_node(NodeKind::Material(MaterialData {
            params,
            effect: None,
            samplers: Vec::new(),
        }))
    }

    pub fn create_effect(&mut self) -> NodeHandle {
        self.create_node(NodeKind::Effect(EffectData::new()))
    }

    pub fn create_buffer(&mut self, bytes: Vec<u8>, stride: u32) -> NodeHandle {
        self.create_node(NodeKind::Buffer(BufferData { bytes, stride }))
    }

    pub fn create_sampler(
        &mut self,
        buffer: Option<NodeHandle>,
        params: SamplerParams,
    ) -> Result<NodeHandle> {
        if let Some(buffer) = buffer {
            self.expect_kind(buffer, "Buffer", |k| matches!(k, NodeKind::Buffer(_)))?;
        }
        Ok(self.create_node(NodeKind::Sampler(SamplerData { buffer, params })))
    }

    #[inline]
    #[must_use]
    pub fn node(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle)
    }

    pub fn get_node(&self, handle: NodeHandle) -> Result<&Node> {
        self.nodes
            .get(handle)
            .ok_or(MirageError::NodeNotFound(handle))
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.nodes.contains_key(handle)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes.iter()
    }

    #[must_use]
    pub fn incarnations(&self, handle: NodeHandle) -> Option<NodeIncarnations> {
        self.nodes.get(handle).map(Node::incarnations)
    }

    /// Child list of `handle`; empty for unknown nodes.
    #[must_use]
    pub fn children(&self, handle: NodeHandle) -> &[NodeHandle] {
        self.nodes.get(handle).map_or(&[], Node::children)
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> Option<NodeHandle> {
        self.root
    }

    pub fn set_root(&mut self, root: Option<NodeHandle>) -> Result<()> {
        if let Some(handle) = root {
            self.expect_kind(handle, "graph node", NodeKind::is_graph_node)?;
        }
        self.root = root;
        Ok(())
    }

    /// Scene-wide effect holding ray-generation, miss and exception programs.
    #[inline]
    #[must_use]
    pub fn scene_effect(&self) -> Option<NodeHandle> {
        self.effect
    }

    pub fn set_scene_effect(&mut self, effect: Option<NodeHandle>) -> Result<()> {
        if let Some(handle) = effect {
            self.expect_kind(handle, "Effect", |k| matches!(k, NodeKind::Effect(_)))?;
        }
        self.effect = effect;
        Ok(())
    }

    /// World transform along the first-parent chain. Billboards contribute
    /// nothing since their orientation depends on the viewer.
    #[must_use]
    pub fn world_transform(&self, handle: NodeHandle) -> Affine3A {
        let mut world = Affine3A::IDENTITY;
        let mut visited = FxHashSet::default();
        let mut current = Some(handle);
        while let Some(h) = current {
            if !visited.insert(h) {
                break;
            }
            let Some(node) = self.nodes.get(h) else { break };
            if let Some(m) = node.transform() {
                world = *m * world;
            }
            current = node.parents.first().copied();
        }
        world
    }

    // ========================================================================
    // Hierarchy edits (tree + bounding)
    // ========================================================================

    /// Appends `child` to `parent`'s child list and returns its slot index.
    pub fn add_child(&mut self, parent: NodeHandle, child: NodeHandle) -> Result<usize> {
        let len = self.get_node(parent)?.children.len();
        self.insert_child(parent, len, child)?;
        Ok(len)
    }

    pub fn insert_child(&mut self, parent: NodeHandle, index: usize, child: NodeHandle) -> Result<()> {
        self.check_edge(parent, child)?;
        let node = self.node_mut(parent)?;
        let len = node.children.len();
        if index > len {
            return Err(MirageError::ChildIndexOutOfRange {
                node: parent,
                index,
                len,
            });
        }
        node.children.insert(index, child);
        if let NodeKind::Switch(switch) = &mut node.kind
            && switch.active.iter().any(|&i| i >= index)
        {
            for i in &mut switch.active {
                if *i >= index {
                    *i += 1;
                }
            }
            switch.selection.increment();
        }
        self.node_mut(child)?.parents.push(parent);
        self.bump_tree(parent);
        Ok(())
    }

    /// Removes the child at `index` and returns it. The child stays in the
    /// scene even when it has no parent left.
    pub fn remove_child(&mut self, parent: NodeHandle, index: usize) -> Result<NodeHandle> {
        let node = self.node_mut(parent)?;
        let len = node.children.len();
        if index >= len {
            return Err(MirageError::ChildIndexOutOfRange {
                node: parent,
                index,
                len,
            });
        }
        let child = node.children.remove(index);
        if let NodeKind::Switch(switch) = &mut node.kind
            && switch.active.iter().any(|&i| i >= index)
        {
            switch.active.retain(|i| *i != index);
            for i in &mut switch.active {
                if *i > index {
                    *i -= 1;
                }
            }
            switch.selection.increment();
        }
        if let Some(c) = self.nodes.get_mut(child)
            && let Some(pos) = c.parents.iter().position(|&p| p == parent)
        {
            c.parents.remove(pos);
        }
        self.bump_tree(parent);
        Ok(child)
    }

    /// Swaps the child at `index` for `child`, returning the previous one.
    pub fn replace_child(
        &mut self,
        parent: NodeHandle,
        index: usize,
        child: NodeHandle,
    ) -> Result<NodeHandle> {
        self.check_edge(parent, child)?;
        let node = self.node_mut(parent)?;
        let len = node.children.len();
        let Some(slot) = node.children.get_mut(index) else {
            return Err(MirageError::ChildIndexOutOfRange {
                node: parent,
                index,
                len,
            });
        };
        let old = std::mem::replace(slot, child);
        if let Some(o) = self.nodes.get_mut(old)
            && let Some(pos) = o.parents.iter().position(|&p| p == parent)
        {
            o.parents.remove(pos);
        }
        self.node_mut(child)?.parents.push(parent);
        self.bump_tree(parent);
        Ok(old)
    }

    /// Removes `handle` from the scene.
    ///
    /// Detaches it from every parent, clears references other nodes hold to
    /// it and removes children left without any parent. DAL links of every
    /// removed node are queued for release. Returns `false` for unknown nodes.
    pub fn remove_node(&mut self, handle: NodeHandle) -> bool {
        let Some(node) = self.nodes.get(handle) else {
            return false;
        };

        let mut parents: Vec<NodeHandle> = node.parents.to_vec();
        parents.sort_unstable();
        parents.dedup();
        for parent in parents {
            if let Some(p) = self.nodes.get_mut(parent) {
                let before = p.children.len();
                let mut removed_indices = Vec::new();
                let mut i = 0;
                p.children.retain(|&c| {
                    let keep = c != handle;
                    if !keep {
                        removed_indices.push(i);
                    }
                    i += 1;
                    keep
                });
                if let NodeKind::Switch(switch) = &mut p.kind
                    && !removed_indices.is_empty()
                {
                    let old_active = std::mem::take(&mut switch.active);
                    for idx in old_active {
                        if removed_indices.contains(&idx) {
                            continue;
                        }
                        let shift = removed_indices.iter().filter(|&&r| r < idx).count();
                        switch.active.push(idx - shift);
                    }
                    switch.selection.increment();
                }
                if before != p.children.len() {
                    self.bump_tree(parent);
                }
            }
        }

        if self.root == Some(handle) {
            self.root = None;
        }
        if self.effect == Some(handle) {
            self.effect = None;
        }
        self.clear_references_to(handle);

        self.destroy_subtree(handle);
        let nodes = &self.nodes;
        self.skins.retain(|_, skin| nodes.contains_key(skin.target));
        true
    }

    fn destroy_subtree(&mut self, handle: NodeHandle) {
        let Some(mut node) = self.nodes.remove(handle) else {
            return;
        };
        self.bounds_cache.lock().remove(handle);
        self.released.extend(node.dal.detach());
        log::trace!("Removed node {handle:?} ('{}')", node.name);

        let mut children = std::mem::take(&mut node.children);
        children.sort_unstable();
        children.dedup();
        for child in children {
            let orphaned = match self.nodes.get_mut(child) {
                Some(c) => {
                    c.parents.retain(|p| *p != handle);
                    c.parents.is_empty() && self.root != Some(child)
                }
                None => false,
            };
            if orphaned {
                self.destroy_subtree(child);
            }
        }
    }

    fn clear_references_to(&mut self, target: NodeHandle) {
        let mut referrers = Vec::new();
        for (h, node) in &mut self.nodes {
            let touched = match &mut node.kind {
                NodeKind::GeoNode(g) if g.material == Some(target) => {
                    g.material = None;
                    true
                }
                NodeKind::Material(m) => {
                    let before = m.samplers.len();
                    m.samplers.retain(|s| *s != target);
                    let mut touched = before != m.samplers.len();
                    if m.effect == Some(target) {
                        m.effect = None;
                        touched = true;
                    }
                    touched
                }
                NodeKind::Sampler(s) if s.buffer == Some(target) => {
                    s.buffer = None;
                    true
                }
                _ => false,
            };
            if touched {
                referrers.push(h);
            }
        }
        for h in referrers {
            log::warn!("Node {h:?} referenced removed node {target:?}; reference cleared");
            self.bump_own(h);
        }
    }

    // ========================================================================
    // Attribute edits
    // ========================================================================

    pub fn set_name(&mut self, handle: NodeHandle, name: &str) -> Result<()> {
        self.node_mut(handle)?.name = name.to_string();
        self.bump_own(handle);
        Ok(())
    }

    pub fn set_transform(&mut self, handle: NodeHandle, matrix: Affine3A) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Transform(m) => *m = matrix,
            _ => return Err(mismatch(handle, "Transform")),
        }
        self.bump_own(handle);
        self.propagate_bounding(handle);
        Ok(())
    }

    pub fn set_billboard_alignment(
        &mut self,
        handle: NodeHandle,
        alignment: BillboardAlignment,
    ) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Billboard(a) => *a = alignment,
            _ => return Err(mismatch(handle, "Billboard")),
        }
        self.bump_own(handle);
        Ok(())
    }

    /// Replaces the active set of a switch. Indices must name existing slots.
    pub fn set_active_children(&mut self, handle: NodeHandle, active: &[usize]) -> Result<()> {
        let node = self.node_mut(handle)?;
        let len = node.children.len();
        let NodeKind::Switch(switch) = &mut node.kind else {
            return Err(mismatch(handle, "Switch"));
        };
        if let Some(&index) = active.iter().find(|&&i| i >= len) {
            return Err(MirageError::ChildIndexOutOfRange {
                node: handle,
                index,
                len,
            });
        }
        switch.active.clear();
        for &i in active {
            if !switch.active.contains(&i) {
                switch.active.push(i);
            }
        }
        switch.selection.increment();
        self.propagate_bounding(handle);
        Ok(())
    }

    /// Activates exactly one child, or none.
    pub fn set_active_child(&mut self, handle: NodeHandle, index: Option<usize>) -> Result<()> {
        match index {
            Some(i) => self.set_active_children(handle, &[i]),
            None => self.set_active_children(handle, &[]),
        }
    }

    pub fn set_geo_material(
        &mut self,
        handle: NodeHandle,
        material: Option<NodeHandle>,
    ) -> Result<()> {
        if let Some(m) = material {
            self.expect_kind(m, "Material", |k| matches!(k, NodeKind::Material(_)))?;
        }
        match &mut self.node_mut(handle)?.kind {
            NodeKind::GeoNode(g) => g.material = material,
            _ => return Err(mismatch(handle, "GeoNode")),
        }
        self.bump_own(handle);
        Ok(())
    }

    /// Changes acceleration build hints. No incarnation moves.
    pub fn set_build_hints(&mut self, handle: NodeHandle, hints: BuildHints) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::GeoNode(g) => g.hints = hints,
            _ => return Err(mismatch(handle, "GeoNode")),
        }
        Ok(())
    }

    pub fn set_geometry(&mut self, handle: NodeHandle, data: GeometryData) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Geometry(g) => *g = data,
            _ => return Err(mismatch(handle, "Geometry")),
        }
        self.bump_own(handle);
        self.propagate_bounding(handle);
        Ok(())
    }

    /// Overwrites vertex positions, keeping the index list.
    pub fn set_positions(&mut self, handle: NodeHandle, positions: &[Vec3]) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Geometry(g) => {
                g.positions.clear();
                g.positions.extend_from_slice(positions);
            }
            _ => return Err(mismatch(handle, "Geometry")),
        }
        self.bump_own(handle);
        self.propagate_bounding(handle);
        Ok(())
    }

    pub fn set_material_params(&mut self, handle: NodeHandle, params: MaterialParams) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Material(m) => m.params = params,
            _ => return Err(mismatch(handle, "Material")),
        }
        self.bump_own(handle);
        Ok(())
    }

    /// Scoped mutable access to material parameters; the own incarnation
    /// advances when the guard drops.
    pub fn edit_material(
        &mut self,
        handle: NodeHandle,
    ) -> Option<IncarnationGuard<'_, MaterialParams>> {
        let Node {
            kind, incarnations, ..
        } = self.nodes.get_mut(handle)?;
        match kind {
            NodeKind::Material(m) => Some(IncarnationGuard::new(&mut m.params, &mut incarnations.own)),
            _ => None,
        }
    }

    pub fn set_material_effect(
        &mut self,
        handle: NodeHandle,
        effect: Option<NodeHandle>,
    ) -> Result<()> {
        if let Some(e) = effect {
            self.expect_kind(e, "Effect", |k| matches!(k, NodeKind::Effect(_)))?;
        }
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Material(m) => m.effect = effect,
            _ => return Err(mismatch(handle, "Material")),
        }
        self.bump_own(handle);
        Ok(())
    }

    pub fn set_material_samplers(
        &mut self,
        handle: NodeHandle,
        samplers: Vec<NodeHandle>,
    ) -> Result<()> {
        for &s in &samplers {
            self.expect_kind(s, "Sampler", |k| matches!(k, NodeKind::Sampler(_)))?;
        }
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Material(m) => m.samplers = samplers,
            _ => return Err(mismatch(handle, "Material")),
        }
        self.bump_own(handle);
        Ok(())
    }

    /// Installs the program for its domain. Only the program incarnation moves.
    pub fn set_effect_program(&mut self, handle: NodeHandle, program: ProgramSource) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Effect(e) => {
                e.upsert(program);
                e.program_incarnation.increment();
            }
            _ => return Err(mismatch(handle, "Effect")),
        }
        Ok(())
    }

    /// Returns whether a program was removed.
    pub fn remove_effect_program(&mut self, handle: NodeHandle, domain: ProgramDomain) -> Result<bool> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Effect(e) => {
                let removed = e.remove(domain);
                if removed {
                    e.program_incarnation.increment();
                }
                Ok(removed)
            }
            _ => Err(mismatch(handle, "Effect")),
        }
    }

    pub fn set_buffer_data(&mut self, handle: NodeHandle, bytes: Vec<u8>, stride: u32) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Buffer(b) => {
                b.bytes = bytes;
                b.stride = stride;
            }
            _ => return Err(mismatch(handle, "Buffer")),
        }
        self.bump_own(handle);
        Ok(())
    }

    pub fn set_sampler_params(&mut self, handle: NodeHandle, params: SamplerParams) -> Result<()> {
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Sampler(s) => s.params = params,
            _ => return Err(mismatch(handle, "Sampler")),
        }
        self.bump_own(handle);
        Ok(())
    }

    pub fn set_sampler_buffer(&mut self, handle: NodeHandle, buffer: Option<NodeHandle>) -> Result<()> {
        if let Some(b) = buffer {
            self.expect_kind(b, "Buffer", |k| matches!(k, NodeKind::Buffer(_)))?;
        }
        match &mut self.node_mut(handle)?.kind {
            NodeKind::Sampler(s) => s.buffer = buffer,
            _ => return Err(mismatch(handle, "Sampler")),
        }
        self.bump_own(handle);
        Ok(())
    }

    // ========================================================================
    // DAL slots
    // ========================================================================

    /// Stores `link` in the node's DAL slot. A link the same creator held
    /// before is queued for release.
    pub fn attach_dal(&mut self, handle: NodeHandle, link: DalLink) -> Result<()> {
        if let Some(old) = self.node_mut(handle)?.dal.attach(link) {
            self.released.push(old);
        }
        Ok(())
    }

    #[must_use]
    pub fn dal_link(&self, handle: NodeHandle, creator: CreatorId) -> Option<DalLink> {
        self.nodes.get(handle)?.dal.get(creator)
    }

    /// Clears the slot and queues every link it held.
    pub fn detach_dal(&mut self, handle: NodeHandle) {
        if let Some(node) = self.nodes.get_mut(handle) {
            self.released.extend(node.dal.detach());
        }
    }

    /// Clears one creator's link without queueing it. Used by a creator that
    /// already dropped the entry itself.
    pub fn forget_dal(&mut self, handle: NodeHandle, creator: CreatorId) -> Option<DalLink> {
        self.nodes.get_mut(handle)?.dal.detach_creator(creator)
    }

    /// Hands the queued links of `creator` over; links of other creators stay queued.
    pub fn drain_released(&mut self, creator: CreatorId) -> Vec<DalLink> {
        let (mine, rest): (Vec<_>, Vec<_>) = self
            .released
            .drain(..)
            .partition(|link| link.creator == creator);
        self.released = rest;
        mine
    }

    #[inline]
    #[must_use]
    pub fn pending_releases(&self) -> usize {
        self.released.len()
    }

    // ========================================================================
    // Bounds
    // ========================================================================

    /// Node-local bounding box of the subtree under `handle`, cached by the
    /// node's bounding incarnation.
    #[must_use]
    pub fn bounding_box(&self, handle: NodeHandle) -> Option<BoundingBox> {
        let node = self.nodes.get(handle)?;
        let current = node.incarnations.bounding;

        let cached = self.bounds_cache.lock().get(handle).copied();
        if let Some((inc, bbox)) = cached
            && inc == current
        {
            return bbox;
        }

        let children = || {
            node.active_child_indices()
                .into_iter()
                .map(|i| self.bounding_box(node.children[i]))
                .collect::<Vec<_>>()
        };
        let computed = match &node.kind {
            NodeKind::Geometry(g) => BoundingBox::from_points(&g.positions),
            NodeKind::Transform(m) => union_all(children()).map(|b| b.transform(m)),
            NodeKind::Billboard(_) => union_all(children()).map(|b| b.rotation_invariant()),
            NodeKind::Group | NodeKind::Switch(_) | NodeKind::GeoNode(_) => union_all(children()),
            _ => None,
        };

        self.bounds_cache.lock().insert(handle, (current, computed));
        computed
    }

    // ========================================================================
    // Skins
    // ========================================================================

    pub fn add_skin(&mut self, skin: Skin) -> Result<SkinKey> {
        skin.validate()?;
        let target = self.get_node(skin.target)?;
        let Some(geometry) = target.geometry() else {
            return Err(mismatch(skin.target, "Geometry"));
        };
        if geometry.positions.len() != skin.vertex_count() {
            return Err(MirageError::InvalidSkin(format!(
                "'{}' binds {} vertices but target has {}",
                skin.name,
                skin.vertex_count(),
                geometry.positions.len()
            )));
        }
        if let Some(&missing) = skin.joints.iter().find(|&&j| !self.nodes.contains_key(j)) {
            return Err(MirageError::NodeNotFound(missing));
        }
        Ok(self.skins.insert(skin))
    }

    #[must_use]
    pub fn skin(&self, key: SkinKey) -> Option<&Skin> {
        self.skins.get(key)
    }

    pub fn skins(&self) -> impl Iterator<Item = (SkinKey, &Skin)> {
        self.skins.iter()
    }

    pub fn remove_skin(&mut self, key: SkinKey) -> Result<Skin> {
        self.skins.remove(key).ok_or(MirageError::SkinNotFound)
    }

    /// Skins deforming `geometry`.
    pub fn skins_targeting(&self, geometry: NodeHandle) -> impl Iterator<Item = SkinKey> + '_ {
        self.skins
            .iter()
            .filter(move |(_, s)| s.target == geometry)
            .map(|(k, _)| k)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn node_mut(&mut self, handle: NodeHandle) -> Result<&mut Node> {
        self.nodes
            .get_mut(handle)
            .ok_or(MirageError::NodeNotFound(handle))
    }

    fn expect_kind(
        &self,
        handle: NodeHandle,
        expected: &'static str,
        check: impl FnOnce(&NodeKind) -> bool,
    ) -> Result<()> {
        if check(&self.get_node(handle)?.kind) {
            Ok(())
        } else {
            Err(mismatch(handle, expected))
        }
    }

    fn check_edge(&self, parent: NodeHandle, child: NodeHandle) -> Result<()> {
        let p = self.get_node(parent)?;
        let c = self.get_node(child)?;
        if !p.kind.accepts_child(&c.kind) {
            return Err(mismatch(child, "valid child kind"));
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(MirageError::CycleDetected { parent, child });
        }
        Ok(())
    }

    /// Whether `candidate` is `of` or reachable from `of` through parents.
    fn is_ancestor_or_self(&self, candidate: NodeHandle, of: NodeHandle) -> bool {
        let mut stack = vec![of];
        let mut visited = FxHashSet::default();
        while let Some(h) = stack.pop() {
            if h == candidate {
                return true;
            }
            if !visited.insert(h) {
                continue;
            }
            if let Some(node) = self.nodes.get(h) {
                stack.extend(node.parents.iter().copied());
            }
        }
        false
    }

    fn bump_own(&mut self, handle: NodeHandle) {
        if let Some(node) = self.nodes.get_mut(handle) {
            node.incarnations.own.increment();
        }
    }

    fn bump_tree(&mut self, handle: NodeHandle) {
        if let Some(node) = self.nodes.get_mut(handle) {
            node.incarnations.tree.increment();
        }
        self.propagate_bounding(handle);
    }

    /// Bumps the bounding incarnation of `start` and of each ancestor, once
    /// per node even when reachable along several paths.
    fn propagate_bounding(&mut self, start: NodeHandle) {
        let mut stack = vec![start];
        let mut visited = FxHashSet::default();
        while let Some(h) = stack.pop() {
            if !visited.insert(h) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(h) {
                node.incarnations.bounding.increment();
                stack.extend(node.parents.iter().copied());
            }
        }
    }
}

fn mismatch(node: NodeHandle, expected: &'static str) -> MirageError {
    MirageError::KindMismatch { node, expected }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri() -> Vec<Vec3> {
        vec![Vec3::ZERO, Vec3::X, Vec3::Y]
    }

    #[test]
    fn scenes_get_distinct_ids() {
        assert_ne!(Scene::new().id(), Scene::new().id());
    }

    /// Asserts which counters moved between two snapshots.
    fn moved(before: NodeIncarnations, after: NodeIncarnations) -> (bool, bool, bool) {
        (
            before.own != after.own,
            before.tree != after.tree,
            before.bounding != after.bounding,
        )
    }

    #[test]
    fn attribute_edits_bump_own_only() {
        let mut scene = Scene::new();
        let material = scene.create_material(MaterialParams::default());
        let effect = scene.create_effect();
        let buffer = scene.create_buffer(vec![0; 16], 4);
        let sampler = scene.create_sampler(None, SamplerParams::default()).unwrap();
        let geo = scene.create_geo_node(BuildHints::empty());
        let billboard = scene.create_billboard(BillboardAlignment::Screen);

        let edits: Vec<(NodeHandle, Box<dyn Fn(&mut Scene)>)> = vec![
            (material, Box::new(move |s: &mut Scene| s.set_name(material, "m").unwrap())),
            (
                material,
                Box::new(move |s: &mut Scene| s.set_material_params(material, MaterialParams::default()).unwrap()),
            ),
            (material, Box::new(move |s: &mut Scene| s.set_material_effect(material, Some(effect)).unwrap())),
            (material, Box::new(move |s: &mut Scene| s.set_material_samplers(material, vec![sampler]).unwrap())),
            (geo, Box::new(move |s: &mut Scene| s.set_geo_material(geo, Some(material)).unwrap())),
            (buffer, Box::new(move |s: &mut Scene| s.set_buffer_data(buffer, vec![1; 8], 8).unwrap())),
            (
                sampler,
                Box::new(move |s: &mut Scene| s.set_sampler_params(sampler, SamplerParams::default()).unwrap()),
            ),
            (sampler, Box::new(move |s: &mut Scene| s.set_sampler_buffer(sampler, Some(buffer)).unwrap())),
            (
                billboard,
                Box::new(move |s: &mut Scene| {
                    s.set_billboard_alignment(billboard, BillboardAlignment::Axis(Vec3::Y)).unwrap();
                }),
            ),
        ];

        for (target, edit) in edits {
            let before = scene.incarnations(target).unwrap();
            edit(&mut scene);
            let after = scene.incarnations(target).unwrap();
            assert_eq!(moved(before, after), (true, false, false));
        }
    }

    #[test]
    fn edit_material_guard_bumps_own() {
        let mut scene = Scene::new();
        let material = scene.create_material(MaterialParams::default());
        let before = scene.incarnations(material).unwrap();
        if let Some(mut params) = scene.edit_material(material) {
            params.roughness = 0.1;
        }
        let after = scene.incarnations(material).unwrap();
        assert_eq!(moved(before, after), (true, false, false));
        assert!((scene.node(material).unwrap().material().unwrap().params.roughness - 0.1).abs() < 1e-6);
    }

    #[test]
    fn transform_edit_propagates_bounding_to_ancestors() {
        let mut scene = Scene::new();
        let root = scene.create_group();
        let t = scene.create_transform(Affine3A::IDENTITY);
        scene.add_child(root, t).unwrap();

        let root_before = scene.incarnations(root).unwrap();
        let t_before = scene.incarnations(t).unwrap();
        scene
            .set_transform(t, Affine3A::from_translation(Vec3::X))
            .unwrap();

        assert_eq!(moved(t_before, scene.incarnations(t).unwrap()), (true, false, true));
        assert_eq!(moved(root_before, scene.incarnations(root).unwrap()), (false, false, true));
    }

    #[test]
    fn geometry_edit_bumps_bounding_once_per_ancestor_in_diamond() {
        let mut scene = Scene::new();
        let root = scene.create_group();
        let a = scene.create_group();
        let b = scene.create_group();
        let geo = scene.create_geo_node(BuildHints::empty());
        let mesh = scene.create_geometry(tri(), vec![]);
        scene.add_child(root, a).unwrap();
        scene.add_child(root, b).unwrap();
        scene.add_child(a, geo).unwrap();
        scene.add_child(b, geo).unwrap();
        scene.add_child(geo, mesh).unwrap();

        let root_before = scene.incarnations(root).unwrap().bounding.value();
        scene.set_positions(mesh, &[Vec3::ZERO, Vec3::X * 2.0, Vec3::Y]).unwrap();
        let root_after = scene.incarnations(root).unwrap().bounding.value();
        assert_eq!(root_after, root_before + 1);
    }

    #[test]
    fn child_edits_bump_parent_tree_not_child() {
        let mut scene = Scene::new();
        let parent = scene.create_group();
        let child = scene.create_group();
        let other = scene.create_group();

        let p0 = scene.incarnations(parent).unwrap();
        let c0 = scene.incarnations(child).unwrap();
        scene.add_child(parent, child).unwrap();
        assert_eq!(moved(p0, scene.incarnations(parent).unwrap()), (false, true, true));
        assert_eq!(scene.incarnations(child).unwrap(), c0);

        let p1 = scene.incarnations(parent).unwrap();
        scene.replace_child(parent, 0, other).unwrap();
        assert_eq!(moved(p1, scene.incarnations(parent).unwrap()), (false, true, true));
        assert!(scene.node(child).unwrap().parents().is_empty());

        let p2 = scene.incarnations(parent).unwrap();
        assert_eq!(scene.remove_child(parent, 0).unwrap(), other);
        assert_eq!(moved(p2, scene.incarnations(parent).unwrap()), (false, true, true));
        assert!(scene.contains(other));
    }

    #[test]
    fn selection_change_moves_only_selection_and_bounding() {
        let mut scene = Scene::new();
        let switch = scene.create_switch();
        let a = scene.create_group();
        let b = scene.create_group();
        scene.add_child(switch, a).unwrap();
        scene.add_child(switch, b).unwrap();

        let s0 = scene.incarnations(switch).unwrap();
        let sel0 = scene.node(switch).unwrap().switch().unwrap().selection_incarnation();
        let a0 = scene.incarnations(a).unwrap();
        let b0 = scene.incarnations(b).unwrap();

        scene.set_active_child(switch, Some(1)).unwrap();

        assert_eq!(moved(s0, scene.incarnations(switch).unwrap()), (false, false, true));
        assert_ne!(
            scene.node(switch).unwrap().switch().unwrap().selection_incarnation(),
            sel0
        );
        assert_eq!(scene.incarnations(a).unwrap(), a0);
        assert_eq!(scene.incarnations(b).unwrap(), b0);

        assert!(matches!(
            scene.set_active_children(switch, &[5]),
            Err(MirageError::ChildIndexOutOfRange { index: 5, len: 2, .. })
        ));
    }

    #[test]
    fn effect_program_edits_move_program_incarnation_only() {
        let mut scene = Scene::new();
        let effect = scene.create_effect();
        let before = scene.incarnations(effect).unwrap();
        scene
            .set_effect_program(
                effect,
                ProgramSource {
                    domain: ProgramDomain::ClosestHit,
                    entry_point: "hit".into(),
                    source: "..".into(),
                },
            )
            .unwrap();
        assert_eq!(scene.incarnations(effect).unwrap(), before);
        assert_eq!(
            scene.node(effect).unwrap().effect().unwrap().program_incarnation().value(),
            1
        );
        assert!(scene.remove_effect_program(effect, ProgramDomain::ClosestHit).unwrap());
        assert!(!scene.remove_effect_program(effect, ProgramDomain::ClosestHit).unwrap());
        assert_eq!(
            scene.node(effect).unwrap().effect().unwrap().program_incarnation().value(),
            2
        );
    }

    #[test]
    fn build_hints_move_no_incarnation() {
        let mut scene = Scene::new();
        let geo = scene.create_geo_node(BuildHints::empty());
        let before = scene.incarnations(geo).unwrap();
        scene.set_build_hints(geo, BuildHints::REFIT).unwrap();
        assert_eq!(scene.incarnations(geo).unwrap(), before);
        assert_eq!(scene.node(geo).unwrap().geo_node().unwrap().hints, BuildHints::REFIT);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut scene = Scene::new();
        let a = scene.create_group();
        let b = scene.create_group();
        scene.add_child(a, b).unwrap();
        assert!(matches!(
            scene.add_child(b, a),
            Err(MirageError::CycleDetected { .. })
        ));
        assert!(matches!(
            scene.add_child(a, a),
            Err(MirageError::CycleDetected { .. })
        ));
    }

    #[test]
    fn wrong_kind_edits_fail() {
        let mut scene = Scene::new();
        let group = scene.create_group();
        assert!(matches!(
            scene.set_transform(group, Affine3A::IDENTITY),
            Err(MirageError::KindMismatch { expected: "Transform", .. })
        ));
        let material = scene.create_material(MaterialParams::default());
        assert!(scene.add_child(group, material).is_err());
    }

    #[test]
    fn switch_selection_follows_child_removal() {
        let mut scene = Scene::new();
        let switch = scene.create_switch();
        let kids: Vec<_> = (0..3).map(|_| scene.create_group()).collect();
        for &k in &kids {
            scene.add_child(switch, k).unwrap();
        }
        scene.set_active_children(switch, &[0, 2]).unwrap();
        scene.remove_child(switch, 1).unwrap();
        assert_eq!(scene.node(switch).unwrap().switch().unwrap().active(), &[0, 1]);
    }

    #[test]
    fn remove_node_clears_references_and_queues_links() {
        use mirage_core::{DalKey, DalKind};

        let mut scene = Scene::new();
        let root = scene.create_group();
        let geo = scene.create_geo_node(BuildHints::empty());
        let mesh = scene.create_geometry(tri(), vec![]);
        let material = scene.create_material(MaterialParams::default());
        scene.set_root(Some(root)).unwrap();
        scene.add_child(root, geo).unwrap();
        scene.add_child(geo, mesh).unwrap();
        scene.set_geo_material(geo, Some(material)).unwrap();

        let mut keys: SlotMap<DalKey, ()> = SlotMap::with_key();
        let creator = CreatorId::next();
        scene
            .attach_dal(mesh, DalLink::new(creator, DalKind::Geometry, keys.insert(())))
            .unwrap();
        scene
            .attach_dal(material, DalLink::new(creator, DalKind::Material, keys.insert(())))
            .unwrap();

        let geo_own = scene.incarnations(geo).unwrap().own;
        assert!(scene.remove_node(material));
        assert!(scene.node(geo).unwrap().geo_node().unwrap().material.is_none());
        assert_ne!(scene.incarnations(geo).unwrap().own, geo_own);

        assert!(scene.remove_node(geo));
        assert!(!scene.contains(mesh));
        assert!(scene.children(root).is_empty());

        let released = scene.drain_released(creator);
        assert_eq!(released.len(), 2);
        assert!(scene.drain_released(creator).is_empty());
        assert!(!scene.remove_node(geo));
    }

    #[test]
    fn shared_child_survives_removal_of_one_parent() {
        let mut scene = Scene::new();
        let a = scene.create_group();
        let b = scene.create_group();
        let shared = scene.create_group();
        scene.add_child(a, shared).unwrap();
        scene.add_child(b, shared).unwrap();

        scene.remove_node(a);
        assert!(scene.contains(shared));
        assert_eq!(scene.node(shared).unwrap().parents(), &[b]);
    }

    #[test]
    fn bounding_box_is_cached_until_bounding_changes() {
        let mut scene = Scene::new();
        let t = scene.create_transform(Affine3A::from_translation(Vec3::new(0.0, 0.0, 5.0)));
        let geo = scene.create_geo_node(BuildHints::empty());
        let mesh = scene.create_geometry(tri(), vec![]);
        scene.add_child(t, geo).unwrap();
        scene.add_child(geo, mesh).unwrap();

        let b = scene.bounding_box(t).unwrap();
        assert_eq!(b.min, Vec3::new(0.0, 0.0, 5.0));
        assert_eq!(b.max, Vec3::new(1.0, 1.0, 5.0));

        scene.set_positions(mesh, &[Vec3::ZERO, Vec3::X * 3.0, Vec3::Y]).unwrap();
        assert_eq!(scene.bounding_box(t).unwrap().max.x, 3.0);
    }
}
