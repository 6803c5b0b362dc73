//! Family dataset: model, data sources and derived rollups.

pub mod model;
pub mod source;
pub mod stats;

pub use model::FamilyData;
pub use source::{FamilyDataSource, FileFamilySource, HttpFamilySource};
pub use stats::{member_stats, MemberStats, MEMBER_STATS_KEY};
