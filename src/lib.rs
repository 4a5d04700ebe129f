// Client-side conversation synchronization for the maintenance portals
pub mod config;
pub mod models;
pub mod sync;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use models::*;
pub use sync::{ChatEngine, ChatError, ConnectionStatus, EngineUpdate};
