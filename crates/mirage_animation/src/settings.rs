use serde::{Deserialize, Serialize};

use crate::skinning::SkinningProcessorKind;

/// Settings of the application-side traversal.
///
/// # Example
///
/// ```rust,ignore
/// let settings = AnimationSettings {
///     skinning: SkinningProcessorKind::None,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationSettings {
    /// Processor created at startup. `Custom` processors are installed with
    /// [`AppTraverser::set_processor`](crate::AppTraverser::set_processor).
    pub skinning: SkinningProcessorKind,

    /// Wrap framed animations around instead of holding the last frame.
    pub loop_animations: bool,
}

impl Default for AnimationSettings {
    fn default() -> Self {
        Self {
            skinning: SkinningProcessorKind::Cpu,
            loop_animations: true,
        }
    }
}
