//! Settings Integration Tests
//!
//! Tests for:
//! - Partial JSON documents falling back to defaults
//! - Enum parsing for the skinning processor
//! - Settings flowing into a running engine

use mirage::prelude::*;
use mirage::{AnimationSettings, MirrorSettings};

#[test]
fn partial_document_keeps_defaults() -> anyhow::Result<()> {
    let settings: EngineSettings =
        serde_json::from_str(r#"{ "mirror": { "record_trace": true } }"#)?;

    assert!(settings.mirror.record_trace);
    assert!(settings.mirror.update_in_place);
    assert!(settings.mirror.prune_instances);
    assert_eq!(settings.mirror.instance_ttl_passes, 3);
    assert_eq!(settings.animation, AnimationSettings::default());
    Ok(())
}

#[test]
fn empty_document_is_default() {
    let settings: EngineSettings = serde_json::from_str("{}").unwrap();
    assert_eq!(settings, EngineSettings::default());
}

#[test]
fn skinning_processor_is_parsed_by_name() {
    let settings: EngineSettings =
        serde_json::from_str(r#"{ "animation": { "skinning": "None", "loop_animations": false } }"#)
            .unwrap();
    assert_eq!(settings.animation.skinning, SkinningProcessorKind::None);
    assert!(!settings.animation.loop_animations);

    let unknown = serde_json::from_str::<EngineSettings>(r#"{ "animation": { "skinning": "Gpu" } }"#);
    assert!(unknown.is_err());
}

#[test]
fn settings_survive_serialization() -> anyhow::Result<()> {
    let settings = EngineSettings {
        mirror: MirrorSettings {
            update_in_place: false,
            instance_ttl_passes: 7,
            ..Default::default()
        },
        animation: AnimationSettings {
            skinning: SkinningProcessorKind::None,
            ..Default::default()
        },
    };
    let text = serde_json::to_string(&settings)?;
    let parsed: EngineSettings = serde_json::from_str(&text)?;
    assert_eq!(parsed, settings);
    Ok(())
}

#[test]
fn engine_applies_animation_settings() {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = MirageEngine::new(
        HeadlessBackend::new(),
        EngineSettings {
            animation: AnimationSettings {
                skinning: SkinningProcessorKind::None,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    assert_eq!(engine.app().processor().kind(), SkinningProcessorKind::None);
    assert_eq!(engine.mirror().settings(), &MirrorSettings::default());
}
