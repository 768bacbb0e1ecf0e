//! Scene graph consumed by the Mirage backend mirror.
//!
//! Nodes live in a [`Scene`] arena and form a DAG. Every node carries
//! own/tree/bounding incarnations that mutations bump according to their
//! change class, and a [`DalSlot`] where backend mirrors park their links.

pub mod bounds;
pub mod node;
pub mod scene;
pub mod skin;
pub mod view;

pub use bounds::BoundingBox;
pub use node::{
    BillboardAlignment, BufferData, BuildHints, DalSlot, EffectData, FilterMode, GeoNodeData,
    GeometryData, MaterialData, MaterialParams, Node, NodeIncarnations, NodeKind, ProgramDomain,
    ProgramSource, SamplerData, SamplerParams, SwitchData, WrapMode,
};
pub use scene::Scene;
pub use skin::{JointInfluence, Skin, SkinKey};
pub use view::ViewState;
