//! Orchestrator integration: event posting, node cache, PV annotations and
//! attachment state recovery.

pub mod events;
pub mod nodes;
pub mod pv;
pub mod rebuild;

pub use events::{EventPoster, KubeEventPoster, NoopPoster};
pub use nodes::{KubeNodeLister, NodeLister, StaticNodeLister};
pub use pv::PvAnnotator;
pub use rebuild::rebuild_attachments;
