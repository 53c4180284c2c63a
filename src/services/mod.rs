//! Services layer
//!
//! - **Editing**: capability-checked entity, relation and presence
//!   operations with per-entity broadcast

pub mod editing;

pub use editing::{spawn_reaper_task, EditingConfig, EditingService, EditingStats};
