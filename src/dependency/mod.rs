pub mod discovery;
pub mod order;
pub mod resolver;

pub use discovery::{Discovery, RootLookup, RootRow};
pub use order::{apply_order, ApplyOrder};
pub use resolver::{DependencySet, DraftSource, Resolution, Resolver, RootRecord};
