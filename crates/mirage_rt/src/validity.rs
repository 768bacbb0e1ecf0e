//! Validity checks
//!
//! An entry is VALID when every incarnation its kind depends on still equals
//! the snapshot taken at the last build, and the per-kind extras (selection,
//! build hints, program incarnation) match too. Checks are pull-based: they
//! run when the traversal visits the node, nothing is pushed on mutation.

use std::fmt;

use bitflags::bitflags;

use mirage_core::{DalKind, Incarnation};
use mirage_scene::{BuildHints, Node, NodeIncarnations, NodeKind, Scene};

use crate::cache::{CachePayload, DalData};

bitflags! {
    /// Which dependencies moved since the last build.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StaleFlags: u8 {
        const OWN       = 1 << 0;
        const TREE      = 1 << 1;
        const BOUNDING  = 1 << 2;
        const SELECTION = 1 << 3;
        const HINTS     = 1 << 4;
        const PROGRAM   = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Absent,
    Valid,
    Stale(StaleFlags),
}

impl CacheState {
    #[must_use]
    pub fn is_valid(self) -> bool {
        matches!(self, CacheState::Valid)
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheState::Absent => write!(f, "ABSENT"),
            CacheState::Valid => write!(f, "VALID"),
            CacheState::Stale(flags) => write!(f, "STALE({flags:?})"),
        }
    }
}

/// Dependencies that force a rebuild of an entry of `kind`.
///
/// Bounding changes never force a rebuild; groups and geometry groups refit
/// their acceleration structure instead.
#[must_use]
pub fn rebuild_mask(kind: DalKind) -> StaleFlags {
    match kind {
        DalKind::Group => StaleFlags::TREE,
        DalKind::Selector => StaleFlags::TREE | StaleFlags::SELECTION,
        DalKind::Transform | DalKind::Billboard => StaleFlags::OWN | StaleFlags::TREE,
        DalKind::GeometryGroup => StaleFlags::OWN | StaleFlags::TREE | StaleFlags::HINTS,
        DalKind::Material => StaleFlags::OWN | StaleFlags::PROGRAM,
        DalKind::Effect => StaleFlags::PROGRAM,
        DalKind::Geometry | DalKind::Buffer | DalKind::TextureSampler => StaleFlags::OWN,
    }
}

/// Compares the three node counters.
#[must_use]
pub fn compare(snapshot: &NodeIncarnations, live: &NodeIncarnations) -> StaleFlags {
    let mut flags = StaleFlags::empty();
    if !live.own.equals(&snapshot.own) {
        flags |= StaleFlags::OWN;
    }
    if !live.tree.equals(&snapshot.tree) {
        flags |= StaleFlags::TREE;
    }
    if !live.bounding.equals(&snapshot.bounding) {
        flags |= StaleFlags::BOUNDING;
    }
    flags
}

/// State seen by a consumer keyed on `mask`.
#[must_use]
pub fn state_for(mask: StaleFlags, moved: StaleFlags) -> CacheState {
    let relevant = moved & mask;
    if relevant.is_empty() {
        CacheState::Valid
    } else {
        CacheState::Stale(relevant)
    }
}

/// Program incarnation a material or effect node currently exposes.
#[must_use]
pub fn live_program_incarnation(scene: &Scene, node: &Node) -> Incarnation {
    match node.kind() {
        NodeKind::Effect(e) => e.program_incarnation(),
        NodeKind::Material(m) => m
            .effect
            .and_then(|e| scene.node(e))
            .and_then(Node::effect)
            .map(|e| e.program_incarnation())
            .unwrap_or_default(),
        _ => Incarnation::new(),
    }
}

/// Full validity check of `entry` against its live node.
#[must_use]
pub fn check(
    scene: &Scene,
    node: &Node,
    entry: Option<&DalData>,
    default_hints: BuildHints,
) -> CacheState {
    let Some(entry) = entry else {
        return CacheState::Absent;
    };

    let mut moved = compare(&entry.snapshot, &node.incarnations());
    match (&entry.payload, node.kind()) {
        (CachePayload::Selector { selection }, NodeKind::Switch(switch)) => {
            if !switch.selection_incarnation().equals(selection) {
                moved |= StaleFlags::SELECTION;
            }
        }
        (CachePayload::GeometryGroup { hints }, NodeKind::GeoNode(geo)) => {
            if geo.hints | default_hints != *hints {
                moved |= StaleFlags::HINTS;
            }
        }
        (CachePayload::Material { program, .. }, NodeKind::Material(_))
        | (CachePayload::Effect { program, .. }, NodeKind::Effect(_)) => {
            if !live_program_incarnation(scene, node).equals(program) {
                moved |= StaleFlags::PROGRAM;
            }
        }
        _ => {}
    }
    state_for(rebuild_mask(entry.kind()), moved)
}
