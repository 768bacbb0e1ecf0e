//! Cache Validity Integration Tests
//!
//! Tests for:
//! - First pass builds, steady state does no backend work
//! - Own/tree/bounding/selection/hints/program changes hit exactly the
//!   entries they should
//! - Relinking parents after a child got a new handle
//! - Backend failures surface with kind and node, and are retried

use glam::{Affine3A, Vec3};

use mirage::rt::{BackendCall, CacheState, StaleFlags};
use mirage::scene::{MaterialParams, ProgramDomain, ProgramSource};
use mirage::{
    BuildHints, DalKind, HeadlessBackend, MirageError, MirrorSettings, NodeHandle, ResourceKind,
    RtTraverser, Scene, ViewState,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn traced(backend: HeadlessBackend) -> RtTraverser<HeadlessBackend> {
    RtTraverser::new(
        backend,
        MirrorSettings {
            record_trace: true,
            ..Default::default()
        },
    )
}

struct Fixture {
    scene: Scene,
    root: NodeHandle,
    xf: NodeHandle,
    geo: NodeHandle,
    geometry: NodeHandle,
    view: ViewState,
}

// root (Group) -> xf (Transform) -> geo (GeoNode) -> geometry
fn fixture() -> Fixture {
    init_logger();
    let mut scene = Scene::new();
    let root = scene.create_group();
    let xf = scene.create_transform(Affine3A::IDENTITY);
    let geo = scene.create_geo_node(BuildHints::empty());
    let geometry = scene.create_geometry(vec![Vec3::ZERO, Vec3::X, Vec3::Y], vec![0, 1, 2]);
    scene.add_child(root, xf).unwrap();
    scene.add_child(xf, geo).unwrap();
    scene.add_child(geo, geometry).unwrap();
    scene.set_root(Some(root)).unwrap();
    Fixture {
        scene,
        root,
        xf,
        geo,
        geometry,
        view: ViewState::default(),
    }
}

// ============================================================================
// Build & steady state
// ============================================================================

#[test]
fn first_pass_builds_every_reachable_entry() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());

    let published = rt.sync(&mut f.scene, &f.view).unwrap();

    assert_eq!(rt.stats().built, 4);
    assert_eq!(published.root, rt.handle_of(&f.scene, f.root));
    for node in [f.root, f.xf, f.geo, f.geometry] {
        assert_eq!(rt.traced_state(node), Some(CacheState::Absent));
        assert!(rt.handle_of(&f.scene, node).is_some());
    }
    // Four primary objects, the vertex buffer and the default material.
    assert_eq!(rt.backend().live_count(), 6);
}

#[test]
fn steady_state_pass_makes_no_backend_calls() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());
    rt.sync(&mut f.scene, &f.view).unwrap();
    rt.backend_mut().clear_calls();

    rt.sync(&mut f.scene, &f.view).unwrap();

    assert!(rt.backend().calls().is_empty());
    assert_eq!(rt.stats().visited, 4);
    assert_eq!(rt.stats().valid, 4);
    assert!(rt.trace().iter().all(|e| e.state == CacheState::Valid));
}

#[test]
fn check_reports_without_rebuilding() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());
    assert_eq!(rt.check(&f.scene, f.xf).unwrap(), CacheState::Absent);

    rt.sync(&mut f.scene, &f.view).unwrap();
    f.scene.set_name(f.xf, "moved").unwrap();

    assert_eq!(
        rt.check(&f.scene, f.xf).unwrap(),
        CacheState::Stale(StaleFlags::OWN)
    );
    assert_eq!(rt.check(&f.scene, f.root).unwrap(), CacheState::Valid);
}

// ============================================================================
// Change classes
// ============================================================================

#[test]
fn own_edit_on_child_leaves_parent_valid() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());
    rt.sync(&mut f.scene, &f.view).unwrap();
    let xf_handle = rt.handle_of(&f.scene, f.xf);

    f.scene.set_name(f.xf, "renamed").unwrap();
    rt.sync(&mut f.scene, &f.view).unwrap();

    assert_eq!(rt.traced_state(f.root), Some(CacheState::Valid));
    assert_eq!(
        rt.traced_state(f.xf),
        Some(CacheState::Stale(StaleFlags::OWN))
    );
    assert_eq!(rt.handle_of(&f.scene, f.xf), xf_handle);
    assert_eq!(rt.stats().updated_in_place, 1);
    assert_eq!(rt.stats().refits, 0);
}

#[test]
fn transform_change_updates_transform_and_refits_group() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());
    rt.sync(&mut f.scene, &f.view).unwrap();
    rt.backend_mut().clear_calls();

    let moved = Affine3A::from_translation(Vec3::new(0.0, 2.0, 0.0));
    f.scene.set_transform(f.xf, moved).unwrap();
    rt.sync(&mut f.scene, &f.view).unwrap();

    let root_handle = rt.handle_of(&f.scene, f.root).unwrap();
    let xf_handle = rt.handle_of(&f.scene, f.xf).unwrap();
    assert_eq!(rt.traced_state(f.root), Some(CacheState::Valid));
    assert_eq!(rt.stats().refits, 1);
    assert_eq!(rt.stats().updated_in_place, 1);
    assert!(rt.backend().object(root_handle).unwrap().dirty);
    assert_eq!(rt.backend().object(xf_handle).unwrap().matrix, Some(moved));
    assert!(
        rt.backend()
            .calls()
            .contains(&BackendCall::MarkDirty(root_handle))
    );
}

#[test]
fn replaced_child_handle_relinks_parent() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::without_updates());
    rt.sync(&mut f.scene, &f.view).unwrap();
    let old_xf = rt.handle_of(&f.scene, f.xf).unwrap();
    let old_root = rt.handle_of(&f.scene, f.root).unwrap();

    f.scene.set_name(f.xf, "renamed").unwrap();
    rt.sync(&mut f.scene, &f.view).unwrap();

    let new_xf = rt.handle_of(&f.scene, f.xf).unwrap();
    let new_root = rt.handle_of(&f.scene, f.root).unwrap();
    assert_ne!(old_xf, new_xf);
    assert_ne!(old_root, new_root);
    assert_eq!(rt.stats().replaced, 1);
    assert_eq!(rt.stats().relinked, 1);
    assert_eq!(rt.backend().destroy_calls(old_xf), 1);
    assert_eq!(
        rt.backend().object(new_root).unwrap().references,
        vec![new_xf]
    );
    assert_eq!(rt.backend().counters().dangling_references, 0);
}

#[test]
fn selection_change_rebuilds_selector_only() {
    init_logger();
    let mut scene = Scene::new();
    let root = scene.create_group();
    let switch = scene.create_switch();
    let a = scene.create_geo_node(BuildHints::empty());
    let b = scene.create_geo_node(BuildHints::empty());
    scene.add_child(root, switch).unwrap();
    scene.add_child(switch, a).unwrap();
    scene.add_child(switch, b).unwrap();
    scene.set_active_child(switch, Some(0)).unwrap();
    scene.set_root(Some(root)).unwrap();
    let view = ViewState::default();

    let mut rt = traced(HeadlessBackend::new());
    rt.sync(&mut scene, &view).unwrap();
    assert!(rt.handle_of(&scene, b).is_none());
    let a_handle = rt.handle_of(&scene, a).unwrap();
    let before = scene.incarnations(switch).unwrap();

    scene.set_active_child(switch, Some(1)).unwrap();
    let after = scene.incarnations(switch).unwrap();
    assert_eq!(before.own, after.own);
    assert_eq!(before.tree, after.tree);

    rt.sync(&mut scene, &view).unwrap();
    assert_eq!(
        rt.traced_state(switch),
        Some(CacheState::Stale(StaleFlags::SELECTION))
    );
    assert_eq!(rt.traced_state(a), None);
    assert_eq!(rt.traced_state(b), Some(CacheState::Absent));
    // The inactive child keeps its entry.
    assert_eq!(rt.handle_of(&scene, a), Some(a_handle));
    assert!(rt.backend().is_live(a_handle));

    let selector = rt.handle_of(&scene, switch).unwrap();
    assert_eq!(
        rt.backend().object(selector).unwrap().references,
        vec![rt.handle_of(&scene, b).unwrap()]
    );
}

#[test]
fn build_hint_change_is_detected_by_value() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());
    rt.sync(&mut f.scene, &f.view).unwrap();
    let before = f.scene.incarnations(f.geo).unwrap();

    f.scene.set_build_hints(f.geo, BuildHints::HIGH_QUALITY).unwrap();
    assert_eq!(f.scene.incarnations(f.geo).unwrap(), before);
    rt.sync(&mut f.scene, &f.view).unwrap();

    assert_eq!(
        rt.traced_state(f.geo),
        Some(CacheState::Stale(StaleFlags::HINTS))
    );
    assert_eq!(rt.stats().updated_in_place, 1);
}

#[test]
fn program_edit_recompiles_effect_and_rebinds_material() {
    let mut f = fixture();
    let effect = f.scene.create_effect();
    f.scene
        .set_effect_program(effect, ProgramSource::new(ProgramDomain::ClosestHit, "shade", "v1"))
        .unwrap();
    let material = f.scene.create_material(MaterialParams::default());
    f.scene.set_material_effect(material, Some(effect)).unwrap();
    f.scene.set_geo_material(f.geo, Some(material)).unwrap();

    let mut rt = traced(HeadlessBackend::new());
    rt.sync(&mut f.scene, &f.view).unwrap();
    let material_handle = rt.handle_of(&f.scene, material).unwrap();
    let old_program = rt.entry(&f.scene, effect).unwrap().programs().unwrap()[0].1;

    f.scene
        .set_effect_program(effect, ProgramSource::new(ProgramDomain::ClosestHit, "shade", "v2"))
        .unwrap();
    rt.sync(&mut f.scene, &f.view).unwrap();

    let new_program = rt.entry(&f.scene, effect).unwrap().programs().unwrap()[0].1;
    assert_ne!(old_program, new_program);
    assert!(!rt.backend().is_live(old_program));
    assert_eq!(
        rt.traced_state(material),
        Some(CacheState::Stale(StaleFlags::PROGRAM))
    );
    assert_eq!(rt.handle_of(&f.scene, material), Some(material_handle));
    assert_eq!(
        rt.backend().object(material_handle).unwrap().references,
        vec![new_program]
    );
    // The geometry group links the same material handle and stays valid.
    assert_eq!(rt.traced_state(f.geo), Some(CacheState::Valid));
}

#[test]
fn snapshots_equal_live_after_every_pass() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());
    rt.sync(&mut f.scene, &f.view).unwrap();

    f.scene
        .set_positions(f.geometry, &[Vec3::ZERO, Vec3::Y, Vec3::Z])
        .unwrap();
    f.scene.set_name(f.root, "edited").unwrap();
    let extra = f.scene.create_group();
    f.scene.add_child(f.root, extra).unwrap();
    rt.sync(&mut f.scene, &f.view).unwrap();

    for kind in DalKind::ALL {
        for (_, entry) in rt.creator().entries(kind) {
            assert_eq!(
                Some(entry.snapshot()),
                f.scene.incarnations(entry.source()),
                "{kind:?} entry of {:?}",
                entry.source()
            );
        }
    }
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn backend_failure_names_kind_and_node_and_is_retried() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());
    rt.sync(&mut f.scene, &f.view).unwrap();

    f.scene.set_name(f.xf, "doomed").unwrap();
    rt.backend_mut().fail_updates(ResourceKind::Transform);
    let err = rt.sync(&mut f.scene, &f.view).unwrap_err();
    match err {
        MirageError::Backend { kind, node, .. } => {
            assert_eq!(kind, ResourceKind::Transform);
            assert_eq!(node, f.xf);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        rt.check(&f.scene, f.xf).unwrap(),
        CacheState::Stale(StaleFlags::OWN)
    );

    rt.backend_mut().clear_failures();
    rt.sync(&mut f.scene, &f.view).unwrap();
    assert_eq!(rt.check(&f.scene, f.xf).unwrap(), CacheState::Valid);
}

#[test]
fn failed_creation_leaves_no_entry() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::new());
    rt.backend_mut().fail_creation(ResourceKind::Geometry);

    assert!(rt.sync(&mut f.scene, &f.view).is_err());
    assert!(rt.entry(&f.scene, f.geometry).is_none());
    // The vertex buffer built before the failure is not leaked.
    assert_eq!(rt.backend().live_of_kind(ResourceKind::Buffer), 0);

    rt.backend_mut().clear_failures();
    rt.sync(&mut f.scene, &f.view).unwrap();
    assert!(rt.handle_of(&f.scene, f.geometry).is_some());
}

#[test]
fn geometry_failure_after_vertex_replacement_destroys_nothing_twice() {
    let mut f = fixture();
    let mut rt = traced(HeadlessBackend::without_updates());
    rt.sync(&mut f.scene, &f.view).unwrap();

    f.scene
        .set_positions(f.geometry, &[Vec3::ZERO, Vec3::X * 2.0, Vec3::Y])
        .unwrap();
    rt.backend_mut().fail_creation(ResourceKind::Geometry);
    assert!(rt.sync(&mut f.scene, &f.view).is_err());
    assert_eq!(rt.backend().live_of_kind(ResourceKind::Buffer), 1);

    rt.backend_mut().clear_failures();
    rt.sync(&mut f.scene, &f.view).unwrap();
    assert_eq!(rt.check(&f.scene, f.geometry).unwrap(), CacheState::Valid);
    assert_eq!(rt.backend().live_of_kind(ResourceKind::Buffer), 1);

    assert!(f.scene.remove_node(f.geometry));
    rt.sync(&mut f.scene, &f.view).unwrap();
    assert_eq!(rt.backend().counters().double_destroys, 0);
    assert_eq!(rt.backend().live_of_kind(ResourceKind::Buffer), 0);
    assert_eq!(rt.backend().live_of_kind(ResourceKind::Geometry), 0);
}
