//! Application-side traversal
//!
//! [`AppTraverser::apply`] runs before the mirror pass. It drives framed
//! animations, then walks the active part of the graph to collect skins and
//! their joints, and finally lets the skinning processor deform everything
//! in a single batched call.

use rustc_hash::FxHashSet;
use serde::Serialize;

use mirage_core::{NodeHandle, Result};
use mirage_scene::{Scene, ViewState};

use crate::framed::FramedTransformAnimation;
use crate::gate::FrameGate;
use crate::settings::AnimationSettings;
use crate::skinning::{SkinningProcessor, create_skinning_processor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppFrameReport {
    /// False when the frame gate found nothing to do.
    pub traversed: bool,
    pub animated: u32,
    pub joints: u32,
    pub skins: u32,
    pub skinned: u32,
}

pub struct AppTraverser {
    settings: AnimationSettings,
    gate: FrameGate,
    animations: Vec<FramedTransformAnimation>,
    processor: Box<dyn SkinningProcessor>,
}

impl AppTraverser {
    #[must_use]
    pub fn new(settings: AnimationSettings) -> Self {
        let processor = create_skinning_processor(settings.skinning);
        Self {
            settings,
            gate: FrameGate::new(),
            animations: Vec::new(),
            processor,
        }
    }

    #[inline]
    pub fn settings(&self) -> &AnimationSettings {
        &self.settings
    }

    #[inline]
    pub fn gate(&self) -> &FrameGate {
        &self.gate
    }

    pub fn force_traversal(&mut self) {
        self.gate.force_traversal();
    }

    pub fn add_animation(&mut self, animation: FramedTransformAnimation) {
        self.animations.push(animation);
        self.gate.force_traversal();
    }

    #[must_use]
    pub fn animations(&self) -> &[FramedTransformAnimation] {
        &self.animations
    }

    #[must_use]
    pub fn processor(&self) -> &dyn SkinningProcessor {
        self.processor.as_ref()
    }

    /// Replaces the skinning processor. The old one is shut down and the next
    /// frame reprocesses every skin.
    pub fn set_processor(&mut self, processor: Box<dyn SkinningProcessor>) {
        self.processor.shutdown();
        log::info!(
            "Skinning processor switched from {:?} to {:?}",
            self.processor.kind(),
            processor.kind()
        );
        self.processor = processor;
        self.gate.force_traversal();
    }

    pub fn apply(&mut self, scene: &mut Scene, view: &ViewState, tick: u64) -> Result<AppFrameReport> {
        if !self.gate.needs_traversal(scene, view, tick) {
            return Ok(AppFrameReport::default());
        }
        let require_processing = self.gate.is_forced();
        let mut report = AppFrameReport {
            traversed: true,
            ..Default::default()
        };

        let before = self.animations.len();
        self.animations.retain(|a| scene.contains(a.target()));
        if self.animations.len() != before {
            log::debug!(
                "Dropped {} animation(s) targeting removed nodes",
                before - self.animations.len()
            );
        }
        for animation in &self.animations {
            if animation.apply(scene, tick, self.settings.loop_animations)? {
                report.animated += 1;
            }
        }

        self.processor.begin_frame();
        let reachable = active_nodes(scene);
        let skins: Vec<_> = scene
            .skins()
            .filter(|(_, skin)| reachable.contains(&skin.target))
            .map(|(key, skin)| (key, skin.joints.clone()))
            .collect();
        let mut joints_seen = FxHashSet::default();
        for (key, joints) in skins {
            for joint in joints {
                if !scene.contains(joint) {
                    log::warn!("Skin {key:?} references a removed joint {joint:?}");
                    continue;
                }
                if joints_seen.insert(joint) {
                    self.processor.add_joint(joint, scene.world_transform(joint));
                    report.joints += 1;
                }
            }
            self.processor.add_skin(key);
            report.skins += 1;
        }
        report.skinned = self.processor.process(scene, require_processing)? as u32;

        self.gate.record(scene, view, tick);
        Ok(report)
    }

    pub fn shutdown(&mut self) {
        self.processor.shutdown();
        self.gate.reset();
    }
}

/// Nodes reachable from the root through active children.
fn active_nodes(scene: &Scene) -> FxHashSet<NodeHandle> {
    let mut reachable = FxHashSet::default();
    let mut stack: Vec<NodeHandle> = scene.root().into_iter().collect();
    while let Some(handle) = stack.pop() {
        if !reachable.insert(handle) {
            continue;
        }
        if let Some(node) = scene.node(handle) {
            let children = node.children();
            stack.extend(node.active_child_indices().iter().map(|&i| children[i]));
        }
    }
    reachable
}
