use bitflags::bitflags;
use glam::{Affine3A, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use mirage_core::{CreatorId, DalLink, Incarnation, NodeHandle};

/// The three independent version counters every node carries.
///
/// - `own`: bumped on any local attribute edit
/// - `tree`: bumped when the direct child list changes
/// - `bounding`: bumped when the spatial extent changes (propagates to ancestors)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeIncarnations {
    pub own: Incarnation,
    pub tree: Incarnation,
    pub bounding: Incarnation,
}

bitflags! {
    /// Acceleration-structure build hints carried by geometry groups.
    ///
    /// Changing hints does not move any incarnation; cache entries compare the
    /// value they were built with.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BuildHints: u32 {
        const REFIT        = 1 << 0;
        const FAST_BUILD   = 1 << 1;
        const HIGH_QUALITY = 1 << 2;
        const COMPACT      = 1 << 3;
        const DYNAMIC      = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BillboardAlignment {
    /// Children face the camera position.
    Screen,
    /// Children rotate about a local axis toward the camera.
    Axis(Vec3),
}

/// Selection state of a switch node.
///
/// The active list holds child slot indices. Changing it bumps the selection
/// incarnation, never the switch's own or tree incarnation and never any
/// child's counters.
#[derive(Debug, Clone, Default)]
pub struct SwitchData {
    pub(crate) active: SmallVec<[usize; 4]>,
    pub(crate) selection: Incarnation,
}

impl SwitchData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn active(&self) -> &[usize] {
        &self.active
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self, index: usize) -> bool {
        self.active.contains(&index)
    }

    #[inline]
    #[must_use]
    pub fn selection_incarnation(&self) -> Incarnation {
        self.selection
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeoNodeData {
    pub material: Option<NodeHandle>,
    pub hints: BuildHints,
}

#[derive(Debug, Clone, Default)]
pub struct GeometryData {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl GeometryData {
    #[must_use]
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        Self { positions, indices }
    }

    /// Triangle count; non-indexed geometry uses consecutive position triples.
    #[must_use]
    pub fn primitive_count(&self) -> u32 {
        if self.indices.is_empty() {
            (self.positions.len() / 3) as u32
        } else {
            (self.indices.len() / 3) as u32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialParams {
    pub albedo: Vec4,
    pub emission: Vec3,
    pub roughness: f32,
    pub metallic: f32,
    pub ior: f32,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            albedo: Vec4::ONE,
            emission: Vec3::ZERO,
            roughness: 0.5,
            metallic: 0.0,
            ior: 1.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaterialData {
    pub params: MaterialParams,
    /// Effect providing the hit programs; `None` falls back to the backend
    /// context's default material.
    pub effect: Option<NodeHandle>,
    pub samplers: Vec<NodeHandle>,
}

/// Execution domains an effect compiles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProgramDomain {
    RayGeneration,
    ClosestHit,
    AnyHit,
    Intersection,
    BoundingBox,
    Miss,
    Exception,
}

impl ProgramDomain {
    /// Domains bound on materials; the others are scene-level entry points.
    #[must_use]
    pub fn is_hit_domain(self) -> bool {
        matches!(self, ProgramDomain::ClosestHit | ProgramDomain::AnyHit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSource {
    pub domain: ProgramDomain,
    pub entry_point: String,
    pub source: String,
}

impl ProgramSource {
    #[must_use]
    pub fn new(domain: ProgramDomain, entry_point: &str, source: &str) -> Self {
        Self {
            domain,
            entry_point: entry_point.to_string(),
            source: source.to_string(),
        }
    }
}

/// One effect source compiled to several domain entry points.
///
/// Programs are kept sorted by domain, at most one per domain. Editing them
/// bumps the program incarnation only.
#[derive(Debug, Clone, Default)]
pub struct EffectData {
    pub(crate) programs: Vec<ProgramSource>,
    pub(crate) program_incarnation: Incarnation,
}

impl EffectData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn programs(&self) -> &[ProgramSource] {
        &self.programs
    }

    #[must_use]
    pub fn program(&self, domain: ProgramDomain) -> Option<&ProgramSource> {
        self.programs.iter().find(|p| p.domain == domain)
    }

    #[inline]
    #[must_use]
    pub fn program_incarnation(&self) -> Incarnation {
        self.program_incarnation
    }

    pub(crate) fn upsert(&mut self, program: ProgramSource) {
        match self.programs.binary_search_by_key(&program.domain, |p| p.domain) {
            Ok(pos) => self.programs[pos] = program,
            Err(pos) => self.programs.insert(pos, program),
        }
    }

    pub(crate) fn remove(&mut self, domain: ProgramDomain) -> bool {
        let before = self.programs.len();
        self.programs.retain(|p| p.domain != domain);
        before != self.programs.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferData {
    pub bytes: Vec<u8>,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapMode {
    #[default]
    Repeat,
    Clamp,
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplerParams {
    pub wrap: WrapMode,
    pub filter: FilterMode,
    pub max_anisotropy: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SamplerData {
    pub buffer: Option<NodeHandle>,
    pub params: SamplerParams,
}

/// Payload of a scene node.
///
/// Graph nodes (`Group`, `Transform`, `Billboard`, `Switch`, `GeoNode`) own
/// child lists. `Geometry` nodes appear as children of geo nodes only. The
/// remaining kinds are attribute objects reached through references.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Group,
    Transform(Affine3A),
    Billboard(BillboardAlignment),
    Switch(SwitchData),
    GeoNode(GeoNodeData),
    Geometry(GeometryData),
    Material(MaterialData),
    Effect(EffectData),
    Buffer(BufferData),
    Sampler(SamplerData),
}

impl NodeKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Group => "Group",
            NodeKind::Transform(_) => "Transform",
            NodeKind::Billboard(_) => "Billboard",
            NodeKind::Switch(_) => "Switch",
            NodeKind::GeoNode(_) => "GeoNode",
            NodeKind::Geometry(_) => "Geometry",
            NodeKind::Material(_) => "Material",
            NodeKind::Effect(_) => "Effect",
            NodeKind::Buffer(_) => "Buffer",
            NodeKind::Sampler(_) => "Sampler",
        }
    }

    /// Nodes that own a child list.
    #[must_use]
    pub fn is_graph_node(&self) -> bool {
        matches!(
            self,
            NodeKind::Group
                | NodeKind::Transform(_)
                | NodeKind::Billboard(_)
                | NodeKind::Switch(_)
                | NodeKind::GeoNode(_)
        )
    }

    /// Whether `child` may be placed in this node's child list.
    #[must_use]
    pub fn accepts_child(&self, child: &NodeKind) -> bool {
        match self {
            NodeKind::GeoNode(_) => matches!(child, NodeKind::Geometry(_)),
            kind if kind.is_graph_node() => child.is_graph_node(),
            _ => false,
        }
    }
}

/// Per-node attachment point for backend mirrors.
///
/// Holds at most one [`DalLink`] per creator. The slot never owns backend
/// state; it only names the creator entry that does.
#[derive(Debug, Clone, Default)]
pub struct DalSlot {
    links: SmallVec<[DalLink; 1]>,
}

impl DalSlot {
    /// Stores `link`, returning the link it displaced for the same creator.
    pub fn attach(&mut self, link: DalLink) -> Option<DalLink> {
        if let Some(existing) = self.links.iter_mut().find(|l| l.creator == link.creator) {
            let old = *existing;
            *existing = link;
            return (old != link).then_some(old);
        }
        self.links.push(link);
        None
    }

    /// Clears the slot, returning every link it held.
    pub fn detach(&mut self) -> SmallVec<[DalLink; 1]> {
        std::mem::take(&mut self.links)
    }

    /// Clears the link of one creator.
    pub fn detach_creator(&mut self, creator: CreatorId) -> Option<DalLink> {
        let pos = self.links.iter().position(|l| l.creator == creator)?;
        Some(self.links.swap_remove(pos))
    }

    #[must_use]
    pub fn get(&self, creator: CreatorId) -> Option<DalLink> {
        self.links.iter().find(|l| l.creator == creator).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DalLink> {
        self.links.iter()
    }
}

/// A scene node: name, payload, version counters, hierarchy and DAL slot.
///
/// Nodes form a DAG. The same child may appear under several parents, or
/// several times under one parent; `parents` records one entry per edge.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) incarnations: NodeIncarnations,
    pub(crate) parents: SmallVec<[NodeHandle; 2]>,
    pub(crate) children: Vec<NodeHandle>,
    pub(crate) dal: DalSlot,
}

impl Node {
    #[must_use]
    pub fn new(name: &str, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            incarnations: NodeIncarnations::default(),
            parents: SmallVec::new(),
            children: Vec::new(),
            dal: DalSlot::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[inline]
    #[must_use]
    pub fn incarnations(&self) -> NodeIncarnations {
        self.incarnations
    }

    #[inline]
    #[must_use]
    pub fn children(&self) -> &[NodeHandle] {
        &self.children
    }

    /// One entry per incoming edge.
    #[inline]
    #[must_use]
    pub fn parents(&self) -> &[NodeHandle] {
        &self.parents
    }

    #[inline]
    #[must_use]
    pub fn dal_slot(&self) -> &DalSlot {
        &self.dal
    }

    #[must_use]
    pub fn transform(&self) -> Option<&Affine3A> {
        match &self.kind {
            NodeKind::Transform(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn billboard(&self) -> Option<BillboardAlignment> {
        match &self.kind {
            NodeKind::Billboard(a) => Some(*a),
            _ => None,
        }
    }

    #[must_use]
    pub fn switch(&self) -> Option<&SwitchData> {
        match &self.kind {
            NodeKind::Switch(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn geo_node(&self) -> Option<&GeoNodeData> {
        match &self.kind {
            NodeKind::GeoNode(g) => Some(g),
            _ => None,
        }
    }

    #[must_use]
    pub fn geometry(&self) -> Option<&GeometryData> {
        match &self.kind {
            NodeKind::Geometry(g) => Some(g),
            _ => None,
        }
    }

    #[must_use]
    pub fn material(&self) -> Option<&MaterialData> {
        match &self.kind {
            NodeKind::Material(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn effect(&self) -> Option<&EffectData> {
        match &self.kind {
            NodeKind::Effect(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn buffer(&self) -> Option<&BufferData> {
        match &self.kind {
            NodeKind::Buffer(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn sampler(&self) -> Option<&SamplerData> {
        match &self.kind {
            NodeKind::Sampler(s) => Some(s),
            _ => None,
        }
    }

    /// Child indices that are effectively active: all of them, except for
    /// switches where only the selection counts.
    #[must_use]
    pub fn active_child_indices(&self) -> SmallVec<[usize; 8]> {
        match &self.kind {
            NodeKind::Switch(s) => s
                .active
                .iter()
                .copied()
                .filter(|&i| i < self.children.len())
                .collect(),
            _ => (0..self.children.len()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_core::{DalKey, DalKind};
    use slotmap::SlotMap;

    #[test]
    fn dal_slot_keeps_one_link_per_creator() {
        let mut keys: SlotMap<DalKey, ()> = SlotMap::with_key();
        let k1 = keys.insert(());
        let k2 = keys.insert(());
        let a = CreatorId::next();
        let b = CreatorId::next();

        let mut slot = DalSlot::default();
        assert!(slot.attach(DalLink::new(a, DalKind::Group, k1)).is_none());
        assert!(slot.attach(DalLink::new(b, DalKind::Group, k1)).is_none());

        let displaced = slot.attach(DalLink::new(a, DalKind::Group, k2));
        assert_eq!(displaced.map(|l| l.key), Some(k1));
        assert_eq!(slot.get(a).map(|l| l.key), Some(k2));

        assert_eq!(slot.detach().len(), 2);
        assert!(slot.is_empty());
    }

    #[test]
    fn reattaching_same_link_displaces_nothing() {
        let mut keys: SlotMap<DalKey, ()> = SlotMap::with_key();
        let key = keys.insert(());
        let creator = CreatorId::next();
        let link = DalLink::new(creator, DalKind::Buffer, key);

        let mut slot = DalSlot::default();
        slot.attach(link);
        assert!(slot.attach(link).is_none());
    }

    #[test]
    fn effect_programs_stay_sorted_by_domain() {
        let mut effect = EffectData::new();
        for domain in [ProgramDomain::Miss, ProgramDomain::RayGeneration, ProgramDomain::ClosestHit] {
            effect.upsert(ProgramSource {
                domain,
                entry_point: "main".into(),
                source: String::new(),
            });
        }
        let domains: Vec<_> = effect.programs().iter().map(|p| p.domain).collect();
        assert_eq!(
            domains,
            vec![ProgramDomain::RayGeneration, ProgramDomain::ClosestHit, ProgramDomain::Miss]
        );
        assert!(effect.remove(ProgramDomain::ClosestHit));
        assert!(!effect.remove(ProgramDomain::ClosestHit));
    }

    #[test]
    fn geo_nodes_only_take_geometry_children() {
        let geo = NodeKind::GeoNode(GeoNodeData::default());
        assert!(geo.accepts_child(&NodeKind::Geometry(GeometryData::default())));
        assert!(!geo.accepts_child(&NodeKind::Group));
        assert!(NodeKind::Group.accepts_child(&NodeKind::Switch(SwitchData::new())));
        assert!(!NodeKind::Group.accepts_child(&NodeKind::Material(MaterialData::default())));
    }
}
