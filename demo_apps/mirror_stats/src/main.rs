//! Mirror statistics demo
//!
//! Builds a scene with a billboard shared under two transforms, a switch and
//! an animated transform, then scripts a few edits and prints what each frame
//! cost the backend.
//!
//! ```text
//! RUST_LOG=debug cargo run -p mirror_stats -- [settings.json]
//! ```

use anyhow::Context;
use glam::{Affine3A, Vec3};

use mirage::prelude::*;

const FRAMES: u64 = 10;

struct Demo {
    scene: Scene,
    left: NodeHandle,
    right: NodeHandle,
    switch: NodeHandle,
    material: NodeHandle,
}

fn build_scene() -> anyhow::Result<Demo> {
    let mut scene = Scene::new();

    let effect = scene.create_effect();
    for (domain, entry) in [
        (ProgramDomain::RayGeneration, "pinhole"),
        (ProgramDomain::ClosestHit, "shade"),
        (ProgramDomain::Miss, "sky"),
    ] {
        scene.set_effect_program(effect, ProgramSource::new(domain, entry, "demo.rt"))?;
    }
    scene.set_scene_effect(Some(effect))?;

    let material = scene.create_material(MaterialParams::default());
    scene.set_material_effect(material, Some(effect))?;

    let quad = scene.create_geometry(
        vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ],
        vec![0, 1, 2, 0, 2, 3],
    );
    let sprite = scene.create_geo_node(BuildHints::FAST_BUILD);
    scene.add_child(sprite, quad)?;
    scene.set_geo_material(sprite, Some(material))?;

    let billboard = scene.create_billboard(BillboardAlignment::Screen);
    scene.add_child(billboard, sprite)?;

    let root = scene.create_named("root", mirage::NodeKind::Group);
    let left = scene.create_transform(Affine3A::from_translation(Vec3::new(-3.0, 0.0, 0.0)));
    let right = scene.create_transform(Affine3A::from_translation(Vec3::new(3.0, 0.0, 0.0)));
    scene.add_child(left, billboard)?;
    scene.add_child(right, billboard)?;
    scene.add_child(root, left)?;
    scene.add_child(root, right)?;

    let switch = scene.create_switch();
    let plain = scene.create_geo_node(BuildHints::empty());
    let plain_geometry = scene.create_geometry(
        vec![Vec3::ZERO, Vec3::X, Vec3::Y],
        vec![0, 1, 2],
    );
    scene.add_child(plain, plain_geometry)?;
    scene.add_child(switch, plain)?;
    scene.add_child(switch, sprite)?;
    scene.set_active_child(switch, Some(0))?;
    scene.add_child(root, switch)?;

    scene.set_root(Some(root))?;
    Ok(Demo {
        scene,
        left,
        right,
        switch,
        material,
    })
}

fn load_settings() -> anyhow::Result<EngineSettings> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(EngineSettings::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {path}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let settings = load_settings()?;
    let Demo {
        mut scene,
        left,
        right,
        switch,
        material,
    } = build_scene()?;

    let mut engine = MirageEngine::new(HeadlessBackend::new(), settings);
    engine.app_mut().add_animation(FramedTransformAnimation::new(
        "sway",
        left,
        (0..4)
            .map(|i| Affine3A::from_translation(Vec3::new(-3.0, i as f32 * 0.25, 0.0)))
            .collect(),
    ));
    let view = ViewState::looking_at(Vec3::new(0.0, 2.0, 10.0), Vec3::ZERO, Vec3::Y);

    for tick in 0..FRAMES {
        match tick {
            5 => scene.set_active_child(switch, Some(1))?,
            6 => {
                if let Some(mut params) = scene.edit_material(material) {
                    params.roughness = 0.2;
                }
            }
            8 => {
                scene.remove_node(right);
            }
            _ => {}
        }

        let report = engine.render_frame(&mut scene, &view, tick, 320, 240)?;
        println!("{}", serde_json::to_string(&report)?);
    }

    let released = engine.shutdown();
    log::info!("Released {released} cache entries");
    println!("{}", serde_json::to_string(&engine.backend().counters())?);
    Ok(())
}
