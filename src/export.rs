// Region statistics output: a flat table (csv, csv.gz or parquet) and a
// JSON array of per-region records that also lists each region's children.

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, UInt64Array};
use arrow::csv;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::ValueEnum;
use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::izip;
use log::info;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::aggregate::RegionSummary;
use crate::atomic::{commit_all, AtomicFile};
use crate::error::{Error, Result};
use crate::ontology::{RegionId, RegionOntology};

pub const REGION_TABLE_NAME: &str = "regions.csv";
pub const REGION_RECORDS_NAME: &str = "region_data.json";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
}

pub fn determine_format(path: &Path, fmt: OutputFormat) -> Result<OutputFormat> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    let name = path.to_string_lossy();
    if name.ends_with(".csv.gz") {
        Ok(OutputFormat::CsvGz)
    } else if name.ends_with(".csv") {
        Ok(OutputFormat::Csv)
    } else if name.ends_with(".parquet") {
        Ok(OutputFormat::Parquet)
    } else {
        Err(Error::Format(name.into_owned()))
    }
}

pub fn region_table_schema() -> Schema {
    Schema::new(vec![
        Field::new("Name", DataType::Utf8, false),
        Field::new("Acronym", DataType::Utf8, false),
        Field::new("ID", DataType::Int64, false),
        Field::new("Parent ID", DataType::Int64, true),
        Field::new("Volume (mm^3)", DataType::Float64, false),
        Field::new("Count", DataType::UInt64, false),
        Field::new("Count per mm^3", DataType::Float64, false),
    ])
}

fn region_table(ontology: &RegionOntology, summary: &RegionSummary) -> Result<RecordBatch> {
    let nodes = ontology.nodes();
    let stats = &summary.stats;
    if nodes.len() != stats.len() {
        return Err(Error::Shape(format!(
            "{} region statistics for an ontology of {} regions",
            stats.len(),
            nodes.len()
        )));
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(nodes.iter().map(|n| Some(n.name.as_str())).collect::<StringArray>()),
        Arc::new(nodes.iter().map(|n| Some(n.acronym.as_str())).collect::<StringArray>()),
        Arc::new(nodes.iter().map(|n| n.id).collect::<Int64Array>()),
        Arc::new(nodes.iter().map(|n| n.parent_id).collect::<Int64Array>()),
        Arc::new(stats.iter().map(|s| s.volume).collect::<Float64Array>()),
        Arc::new(stats.iter().map(|s| s.count).collect::<UInt64Array>()),
        Arc::new(stats.iter().map(|s| s.density).collect::<Float64Array>()),
    ];

    Ok(RecordBatch::try_new(Arc::new(region_table_schema()), columns)?)
}

// Encode the table into a file that is not yet published.
pub fn stage_region_table(
    path: &Path,
    fmt: OutputFormat,
    ontology: &RegionOntology,
    summary: &RegionSummary,
) -> Result<AtomicFile> {
    let fmt = determine_format(path, fmt)?;
    let batch = region_table(ontology, summary)?;
    let file = AtomicFile::create(path)?;

    match fmt {
        OutputFormat::Infer | OutputFormat::Csv => {
            let mut writer = csv::WriterBuilder::new()
                .with_header(true)
                .build(BufWriter::new(file.as_file()));
            writer.write(&batch)?;
            writer.into_inner().into_inner().map_err(|e| e.into_error())?;
        }
        OutputFormat::CsvGz => {
            let encoder = GzEncoder::new(file.as_file(), Compression::default());
            let mut writer = csv::WriterBuilder::new().with_header(true).build(encoder);
            writer.write(&batch)?;
            writer.into_inner().finish()?;
        }
        OutputFormat::Parquet => {
            let props = WriterProperties::builder()
                .set_compression(ZSTD(ZstdLevel::try_new(3)?))
                .build();
            let mut writer = ArrowWriter::try_new(file.as_file(), batch.schema(), Some(props))?;
            writer.write(&batch)?;
            writer.close()?;
        }
    }

    info!("Wrote {} regions to {}", batch.num_rows(), path.display());
    Ok(file)
}

pub fn write_region_table(
    path: &Path,
    fmt: OutputFormat,
    ontology: &RegionOntology,
    summary: &RegionSummary,
) -> Result<()> {
    stage_region_table(path, fmt, ontology, summary)?.commit()
}

#[derive(Debug, Serialize)]
struct RegionRecord<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Acronym")]
    acronym: &'a str,
    #[serde(rename = "ID")]
    id: RegionId,
    #[serde(rename = "ParentID")]
    parent_id: Option<RegionId>,
    #[serde(rename = "Children")]
    children: Vec<String>,
    #[serde(rename = "Volume")]
    volume: f64,
    #[serde(rename = "Count")]
    count: u64,
    #[serde(rename = "Density")]
    density: f64,
}

pub fn stage_region_records(
    path: &Path,
    ontology: &RegionOntology,
    summary: &RegionSummary,
) -> Result<AtomicFile> {
    let records: Vec<RegionRecord> = izip!(0.., ontology.nodes(), &summary.stats)
        .map(|(i, node, stats)| RegionRecord {
            name: &node.name,
            acronym: &node.acronym,
            id: node.id,
            parent_id: node.parent_id,
            children: ontology.child_names(i),
            volume: stats.volume,
            count: stats.count,
            density: stats.density,
        })
        .collect();

    let file = AtomicFile::create(path)?;
    let mut writer = BufWriter::new(file.as_file());
    serde_json::to_writer_pretty(&mut writer, &records)?;
    writer.into_inner().map_err(|e| e.into_error())?;

    info!("Wrote {} region records to {}", records.len(), path.display());
    Ok(file)
}

pub fn write_region_records(
    path: &Path,
    ontology: &RegionOntology,
    summary: &RegionSummary,
) -> Result<()> {
    stage_region_records(path, ontology, summary)?.commit()
}

pub fn region_output_paths(dir: &Path, fmt: OutputFormat) -> (PathBuf, PathBuf) {
    let table_path = match fmt {
        OutputFormat::Infer | OutputFormat::Csv => dir.join(REGION_TABLE_NAME),
        OutputFormat::CsvGz => dir.join("regions.csv.gz"),
        OutputFormat::Parquet => dir.join("regions.parquet"),
    };
    (table_path, dir.join(REGION_RECORDS_NAME))
}

// Both outputs for `dir`, written but not yet published. The table name
// follows the chosen format.
pub fn stage_region_outputs(
    dir: &Path,
    fmt: OutputFormat,
    ontology: &RegionOntology,
    summary: &RegionSummary,
) -> Result<Vec<AtomicFile>> {
    let (table_path, records_path) = region_output_paths(dir, fmt);
    Ok(vec![
        stage_region_table(&table_path, fmt, ontology, summary)?,
        stage_region_records(&records_path, ontology, summary)?,
    ])
}

// Write and publish both outputs; either both appear or neither does.
pub fn write_region_outputs(
    dir: &Path,
    fmt: OutputFormat,
    ontology: &RegionOntology,
    summary: &RegionSummary,
) -> Result<(PathBuf, PathBuf)> {
    commit_all(stage_region_outputs(dir, fmt, ontology, summary)?)?;
    Ok(region_output_paths(dir, fmt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{aggregate_regions, VoxelSize};
    use crate::ontology::{RegionNode, SentinelIds};
    use crate::points::Point;
    use crate::volume::{LabelTally, LabelVolume};
    use flate2::read::GzDecoder;
    use ndarray::Array3;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;
    use tempfile::TempDir;

    fn fixture() -> (RegionOntology, RegionSummary) {
        let ontology = RegionOntology::from_nodes(
            vec![
                RegionNode::new(0, None, "universe", "univ"),
                RegionNode::new(997, None, "root", "root"),
                RegionNode::new(10, Some(997), "A", "a"),
                RegionNode::new(20, Some(10), "B", "b"),
                RegionNode::new(30, Some(10), "C", "c"),
            ],
            SentinelIds::default(),
        )
        .unwrap();

        let points: Vec<Point> = [20, 20, 30]
            .iter()
            .map(|&id| {
                let mut p = Point::new(0.0, 0.0, 0.0, 1.0);
                p.region_id = Some(id);
                p
            })
            .collect();
        let labels: LabelVolume = Array3::from_shape_fn((1, 2, 2), |(_, y, _)| 20 + 10 * y as u32);
        let summary = aggregate_regions(
            &ontology,
            VoxelSize::isotropic(100.0),
            &points,
            &LabelTally::from_volume(&labels),
        )
        .unwrap();
        (ontology, summary)
    }

    #[test]
    fn test_determine_format() {
        let infer = OutputFormat::Infer;
        assert_eq!(determine_format(Path::new("a.csv"), infer).unwrap(), OutputFormat::Csv);
        assert_eq!(determine_format(Path::new("a.csv.gz"), infer).unwrap(), OutputFormat::CsvGz);
        assert_eq!(
            determine_format(Path::new("a.parquet"), infer).unwrap(),
            OutputFormat::Parquet
        );
        assert_eq!(
            determine_format(Path::new("a.txt"), OutputFormat::Csv).unwrap(),
            OutputFormat::Csv
        );
        assert!(matches!(
            determine_format(Path::new("a.txt"), infer),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_write_csv_table() {
        let dir = TempDir::new().unwrap();
        let (ontology, summary) = fixture();
        let (table, records) =
            write_region_outputs(dir.path(), OutputFormat::Infer, &ontology, &summary).unwrap();
        assert_eq!(table, dir.path().join(REGION_TABLE_NAME));
        assert!(records.exists());

        let mut rdr = ::csv::Reader::from_path(&table).unwrap();
        let headers: Vec<String> = rdr.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(
            headers,
            vec![
                "Name",
                "Acronym",
                "ID",
                "Parent ID",
                "Volume (mm^3)",
                "Count",
                "Count per mm^3"
            ]
        );

        let rows: Vec<::csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(&rows[0][0], "root");
        assert_eq!(&rows[0][3], "");
        assert_eq!(&rows[0][5], "3");
        assert_eq!(&rows[2][0], "B");
        assert_eq!(&rows[2][3], "10");
        assert_eq!(&rows[2][5], "2");

        // only the published files remain
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_write_gzip_table() {
        let dir = TempDir::new().unwrap();
        let (ontology, summary) = fixture();
        let path = dir.path().join("regions.csv.gz");
        write_region_table(&path, OutputFormat::Infer, &ontology, &summary).unwrap();

        let mut rdr = ::csv::Reader::from_reader(GzDecoder::new(File::open(&path).unwrap()));
        assert_eq!(rdr.records().count(), 4);
    }

    #[test]
    fn test_write_parquet_table() {
        let dir = TempDir::new().unwrap();
        let (ontology, summary) = fixture();
        let path = dir.path().join("regions.parquet");
        write_region_table(&path, OutputFormat::Infer, &ontology, &summary).unwrap();

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let nrows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(nrows, 4);

        let counts = batches[0]
            .column(5)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        assert_eq!(counts.values().to_vec(), vec![3, 3, 2, 1]);
    }

    #[test]
    fn test_unknown_format_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let (ontology, summary) = fixture();
        let path = dir.path().join("regions.xlsx");
        let result = write_region_table(&path, OutputFormat::Infer, &ontology, &summary);
        assert!(matches!(result, Err(Error::Format(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_records() {
        let dir = TempDir::new().unwrap();
        let (ontology, summary) = fixture();
        let path = dir.path().join(REGION_RECORDS_NAME);
        write_region_records(&path, &ontology, &summary).unwrap();

        let records: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        let records = records.as_array().unwrap();
        assert_eq!(records.len(), 4);

        let a = &records[1];
        assert_eq!(a["Name"], "A");
        assert_eq!(a["Acronym"], "a");
        assert_eq!(a["ID"], 10);
        assert_eq!(a["ParentID"], 997);
        assert_eq!(a["Children"], serde_json::json!(["B", "C"]));
        assert_eq!(a["Count"], 3);
        assert!((a["Volume"].as_f64().unwrap() - 4e-3).abs() < 1e-12);
        assert!((a["Density"].as_f64().unwrap() - 750.0).abs() < 1e-9);

        assert!(records[0]["ParentID"].is_null());
    }

    #[test]
    fn test_failed_outputs_publish_nothing() {
        let dir = TempDir::new().unwrap();
        let (ontology, summary) = fixture();
        std::fs::create_dir(dir.path().join(REGION_RECORDS_NAME)).unwrap();

        let result = write_region_outputs(dir.path(), OutputFormat::Infer, &ontology, &summary);
        assert!(result.is_err());
        assert!(!dir.path().join(REGION_TABLE_NAME).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
