use thiserror::Error;

use crate::ontology::RegionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Column '{0}' not found in table")]
    MissingColumn(String),

    #[error("Unable to parse '{value}' in column '{column}' on line {line}")]
    Parse {
        column: String,
        value: String,
        line: u64,
    },

    #[error("Ontology error: {0}")]
    Ontology(String),

    #[error("Region {0} is part of a parent cycle")]
    Cycle(RegionId),

    #[error("Parent chain of region {region} ends at {at} without reaching the root")]
    BrokenChain { region: RegionId, at: RegionId },

    #[error("Parent chain of region {0} exceeds {1} hops")]
    TooDeep(RegionId, usize),

    #[error("Points are not sorted by decreasing intensity (index {0})")]
    Unsorted(usize),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Unknown output format: {0}")]
    Format(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
