pub mod resolver;
pub mod selector;
pub mod sync;
pub mod tree;

pub use resolver::{Resolved, ResolveError, resolve};
pub use selector::{SelectorFactory, TargetSelector};
pub use sync::{SharedRoutes, SyncEngine, shared_routes};
pub use tree::ConfigTree;
