use serde::{Deserialize, Serialize};

use mirage_animation::AnimationSettings;
use mirage_rt::MirrorSettings;

/// Configuration of a [`MirageEngine`](crate::MirageEngine).
///
/// Missing fields fall back to their defaults, so partial JSON documents
/// are accepted:
///
/// ```rust,ignore
/// let settings: EngineSettings = serde_json::from_str(r#"{ "mirror": { "record_trace": true } }"#)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub mirror: MirrorSettings,
    pub animation: AnimationSettings,
}
