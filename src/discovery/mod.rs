// Universe filtering and curated selection sets
pub mod selection;
pub mod universe;

pub use selection::{SelectionManager, SelectionSet};
pub use universe::{Sorting, UniverseFilter};
