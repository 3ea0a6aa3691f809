pub mod aggregate;
pub mod atomic;
pub mod dedup;
pub mod density;
pub mod error;
pub mod export;
pub mod ontology;
pub mod points;
pub mod resample;
pub mod staging;
pub mod volume;

pub use aggregate::{aggregate_regions, RegionAggregator, RegionStats, RegionSummary, VoxelSize};
pub use dedup::{remove_overlap, PointDeduplicator};
pub use error::{Error, Result};
pub use export::{write_region_outputs, OutputFormat};
pub use ontology::{RegionId, RegionNode, RegionOntology, SentinelIds};
pub use points::Point;
pub use resample::Resampler;
pub use volume::{LabelTally, LabelVolume, VolumeShape};
