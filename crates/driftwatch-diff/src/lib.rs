pub mod cache;
pub mod comparator;
pub mod differ;

pub use cache::{CacheStatsSnapshot, ComparisonCache};
pub use comparator::{structural_comparator, Comparator};
pub use differ::{ComparisonPair, DiffPool, DiffStatsSnapshot};
