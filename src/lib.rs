pub mod analysis;
pub mod config;
pub mod context;
pub mod ecosystem;
pub mod executor;
pub mod harvest;
pub mod logging;
pub mod maintenance;
pub mod model;
pub mod traits;

// Re-export common types for convenience
pub use context::{ContextError, HarvestContext};
pub use executor::*;
pub use model::*;
pub use traits::*;
