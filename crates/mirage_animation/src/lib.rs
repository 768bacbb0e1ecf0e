//! Application-side frame work for Mirage scenes: framed transform
//! animation, the frame-level dirty gate, and pluggable skinning.

pub mod framed;
pub mod gate;
pub mod settings;
pub mod skinning;
pub mod traverser;

pub use framed::FramedTransformAnimation;
pub use gate::FrameGate;
pub use settings::AnimationSettings;
pub use skinning::{
    CpuSkinningProcessor, DisabledSkinningProcessor, SkinningProcessor, SkinningProcessorKind,
    create_skinning_processor,
};
pub use traverser::{AppFrameReport, AppTraverser};
