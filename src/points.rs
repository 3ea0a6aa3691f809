use csv;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::atomic::AtomicFile;
use crate::error::{Error, Result};
use crate::ontology::{RegionId, RegionOntology};

// A single detected cell. Coordinates are in whatever frame the table was
// written in (voxel indices of the stitched volume, or atlas space after
// transformation).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: f64,
    pub size: f64,
    pub region_id: Option<RegionId>,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64, intensity: f64) -> Point {
        Point {
            x,
            y,
            z,
            intensity,
            size: 0.0,
            region_id: None,
        }
    }
}

// Column names used when reading a point table.
#[derive(Clone, Debug)]
pub struct PointColumns {
    pub x: String,
    pub y: String,
    pub z: String,
    pub intensity: String,
    pub size: String,
    pub region_id: String,
}

impl Default for PointColumns {
    fn default() -> Self {
        PointColumns {
            x: String::from("x"),
            y: String::from("y"),
            z: String::from("z"),
            intensity: String::from("source_intensity"),
            size: String::from("size"),
            region_id: String::from("region_id"),
        }
    }
}

// Older tables name the raw intensity column just "source".
const INTENSITY_FALLBACK_COLUMN: &str = "source";

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

fn find_column(headers: &csv::StringRecord, column: &str) -> Result<usize> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| Error::MissingColumn(column.to_string()))
}

fn parse_float(row: &csv::StringRecord, col: usize, column: &str) -> Result<f64> {
    let value = &row[col];
    value.parse::<f64>().map_err(|_| Error::Parse {
        column: column.to_string(),
        value: value.to_string(),
        line: row.position().map_or(0, |p| p.line()),
    })
}

// Region ids are sometimes written as floats ("997.0"), and missing labels
// as empty or "nan".
fn parse_region_id(row: &csv::StringRecord, col: usize, column: &str) -> Result<Option<RegionId>> {
    let value = &row[col];
    if value.is_empty() || value.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }

    if let Ok(id) = value.parse::<RegionId>() {
        return Ok(Some(id));
    }

    match value.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 => Ok(Some(v as RegionId)),
        _ => Err(Error::Parse {
            column: column.to_string(),
            value: value.to_string(),
            line: row.position().map_or(0, |p| p.line()),
        }),
    }
}

pub fn read_points_csv(path: &Path, columns: &PointColumns) -> Result<Vec<Point>> {
    let file = File::open(path)?;
    if is_gzip(path) {
        read_points(GzDecoder::new(file), columns)
    } else {
        read_points(file, columns)
    }
}

pub fn read_points<R: Read>(input: R, columns: &PointColumns) -> Result<Vec<Point>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = rdr.headers()?.clone();
    let x_col = find_column(&headers, &columns.x)?;
    let y_col = find_column(&headers, &columns.y)?;
    let z_col = find_column(&headers, &columns.z)?;
    let intensity_col = find_column(&headers, &columns.intensity)
        .or_else(|_| find_column(&headers, INTENSITY_FALLBACK_COLUMN))
        .map_err(|_| Error::MissingColumn(columns.intensity.clone()))?;
    let size_col = find_column(&headers, &columns.size).ok();
    let region_col = find_column(&headers, &columns.region_id).ok();

    let mut points = Vec::new();
    for result in rdr.records() {
        let row = result?;

        let size = match size_col {
            Some(col) => parse_float(&row, col, &columns.size)?,
            None => f64::NAN,
        };

        let region_id = match region_col {
            Some(col) => parse_region_id(&row, col, &columns.region_id)?,
            None => None,
        };

        points.push(Point {
            x: parse_float(&row, x_col, &columns.x)?,
            y: parse_float(&row, y_col, &columns.y)?,
            z: parse_float(&row, z_col, &columns.z)?,
            intensity: parse_float(&row, intensity_col, &columns.intensity)?,
            size,
            region_id,
        });
    }

    Ok(points)
}

// Inclusive intensity and size bounds. A missing bound is unbounded.
#[derive(Clone, Copy, Debug, Default)]
pub struct Thresholds {
    pub intensity_min: Option<f64>,
    pub intensity_max: Option<f64>,
    pub size_min: Option<f64>,
    pub size_max: Option<f64>,
}

fn within(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}

impl Thresholds {
    pub fn accepts(&self, point: &Point) -> bool {
        within(point.intensity, self.intensity_min, self.intensity_max)
            && within(point.size, self.size_min, self.size_max)
    }
}

pub fn filter_thresholds(points: &[Point], thresholds: &Thresholds) -> Vec<Point> {
    let filtered: Vec<Point> = points
        .iter()
        .filter(|p| thresholds.accepts(p))
        .cloned()
        .collect();
    info!(
        "Threshold filter kept {} of {} points",
        filtered.len(),
        points.len()
    );
    filtered
}

// Descending intensity with NaN intensities at the end.
pub fn intensity_order(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

// Equal intensities end up in reverse input order, as if sorted ascending
// and then flipped.
pub fn sort_by_intensity_desc(points: &mut [Point]) {
    points.reverse();
    points.sort_by(|a, b| intensity_order(a.intensity, b.intensity));
}

pub fn sort_by_z(points: &mut [Point]) {
    points.sort_by(|a, b| a.z.total_cmp(&b.z));
}

// Drop points that fell outside every annotated structure.
pub fn remove_background(points: &[Point], universe: RegionId) -> Vec<Point> {
    points
        .iter()
        .filter(|p| p.region_id != Some(universe))
        .cloned()
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabeledPoint {
    pub point: Point,
    pub region_name: String,
    pub region_parent_id: Option<RegionId>,
}

pub fn attach_labels(points: &[Point], ontology: &RegionOntology) -> Vec<LabeledPoint> {
    let mut unknown: HashSet<RegionId> = HashSet::new();
    let universe = ontology.sentinels().universe;

    let labeled = points
        .iter()
        .map(|p| {
            let (region_name, region_parent_id) = match p.region_id {
                Some(id) if id == universe => (ontology.universe_name().to_string(), None),
                Some(id) => match ontology.get(id) {
                    Some(node) => (node.name.clone(), node.parent_id),
                    None => {
                        unknown.insert(id);
                        (String::new(), None)
                    }
                },
                None => (String::new(), None),
            };
            LabeledPoint {
                point: *p,
                region_name,
                region_parent_id,
            }
        })
        .collect();

    for id in unknown {
        warn!("Region id {} is not present in the ontology", id);
    }

    labeled
}

const POINT_TABLE_HEADER: [&str; 8] = [
    "x",
    "y",
    "z",
    "source_intensity",
    "size",
    "region_id",
    "region_name",
    "region_parent_id",
];

fn opt_to_string(v: Option<RegionId>) -> String {
    v.map_or(String::new(), |v| v.to_string())
}

fn write_points<W: Write>(wtr: &mut csv::Writer<W>, rows: &[LabeledPoint]) -> Result<()> {
    wtr.write_record(POINT_TABLE_HEADER)?;
    for row in rows {
        let p = &row.point;
        wtr.write_record(&[
            p.x.to_string(),
            p.y.to_string(),
            p.z.to_string(),
            p.intensity.to_string(),
            p.size.to_string(),
            opt_to_string(p.region_id),
            row.region_name.clone(),
            opt_to_string(row.region_parent_id),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

// Write the table into a file that is not yet published.
pub fn stage_points_csv(path: &Path, rows: &[LabeledPoint]) -> Result<AtomicFile> {
    let file = AtomicFile::create(path)?;

    if is_gzip(path) {
        let mut wtr = csv::Writer::from_writer(GzEncoder::new(file.as_file(), Compression::default()));
        write_points(&mut wtr, rows)?;
        let encoder = wtr.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        encoder.finish()?;
    } else {
        let mut wtr = csv::Writer::from_writer(file.as_file());
        write_points(&mut wtr, rows)?;
    }

    info!("Wrote {} points to {}", rows.len(), path.display());
    Ok(file)
}

pub fn write_points_csv(path: &Path, rows: &[LabeledPoint]) -> Result<()> {
    stage_points_csv(path, rows)?.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::{RegionNode, SentinelIds};
    use tempfile::TempDir;

    #[test]
    fn test_read_points_with_fallback_intensity_column() {
        let data = "x, y, z, source, size, region_id\n\
                    1.0, 2.0, 3.0, 100.0, 12, 10\n\
                    4.0, 5.0, 6.0, 90.5, 20, 997.0\n\
                    7.0, 8.0, 9.0, 10.0, 30, \n";
        let points = read_points(data.as_bytes(), &PointColumns::default()).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].region_id, Some(10));
        assert_eq!(points[1].intensity, 90.5);
        assert_eq!(points[1].region_id, Some(997));
        assert_eq!(points[2].region_id, None);
        assert_eq!(points[2].size, 30.0);
    }

    #[test]
    fn test_read_points_missing_column() {
        let data = "x,y,size\n1,2,3\n";
        match read_points(data.as_bytes(), &PointColumns::default()) {
            Err(Error::MissingColumn(col)) => assert_eq!(col, "z"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_read_points_missing_intensity_names_configured_column() {
        let data = "x,y,z,size\n1,2,3,4\n";
        match read_points(data.as_bytes(), &PointColumns::default()) {
            Err(Error::MissingColumn(col)) => assert_eq!(col, "source_intensity"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_read_points_bad_value() {
        let data = "x,y,z,source_intensity\n1,2,oops,4\n";
        match read_points(data.as_bytes(), &PointColumns::default()) {
            Err(Error::Parse { column, value, .. }) => {
                assert_eq!(column, "z");
                assert_eq!(value, "oops");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_thresholds() {
        let mut a = Point::new(0.0, 0.0, 0.0, 50.0);
        a.size = 10.0;
        let mut b = Point::new(0.0, 0.0, 0.0, 500.0);
        b.size = 10.0;
        let mut c = Point::new(0.0, 0.0, 0.0, 50.0);
        c.size = 100.0;

        let thresholds = Thresholds {
            intensity_min: Some(20.0),
            intensity_max: Some(200.0),
            size_min: None,
            size_max: Some(45.0),
        };
        let kept = filter_thresholds(&[a, b, c], &thresholds);
        assert_eq!(kept, vec![a]);

        let kept = filter_thresholds(&[a, b, c], &Thresholds::default());
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_sort_by_intensity_puts_nan_last() {
        let mut points = vec![
            Point::new(0.0, 0.0, 0.0, 1.0),
            Point::new(1.0, 0.0, 0.0, f64::NAN),
            Point::new(2.0, 0.0, 0.0, 3.0),
            Point::new(3.0, 0.0, 0.0, 2.0),
        ];
        sort_by_intensity_desc(&mut points);
        let xs: Vec<f64> = points.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![2.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_sort_by_intensity_reverses_ties() {
        let mut points = vec![
            Point::new(0.0, 0.0, 0.0, 5.0),
            Point::new(1.0, 0.0, 0.0, 9.0),
            Point::new(2.0, 0.0, 0.0, 5.0),
            Point::new(3.0, 0.0, 0.0, 5.0),
        ];
        sort_by_intensity_desc(&mut points);
        let xs: Vec<f64> = points.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![1.0, 3.0, 2.0, 0.0]);
    }

    #[test]
    fn test_remove_background() {
        let mut a = Point::new(0.0, 0.0, 0.0, 1.0);
        a.region_id = Some(0);
        let mut b = Point::new(0.0, 0.0, 0.0, 1.0);
        b.region_id = Some(10);
        let c = Point::new(0.0, 0.0, 0.0, 1.0);
        assert_eq!(remove_background(&[a, b, c], 0), vec![b, c]);
    }

    #[test]
    fn test_write_and_read_labeled_points() {
        let ontology = RegionOntology::from_nodes(
            vec![
                RegionNode::new(997, None, "root", "root"),
                RegionNode::new(10, Some(997), "A", "A"),
            ],
            SentinelIds::default(),
        )
        .unwrap();

        let mut a = Point::new(1.0, 2.0, 3.0, 4.0);
        a.region_id = Some(10);
        let mut b = Point::new(5.0, 6.0, 7.0, 8.0);
        b.region_id = Some(12345);
        let labeled = attach_labels(&[a, b], &ontology);
        assert_eq!(labeled[0].region_name, "A");
        assert_eq!(labeled[0].region_parent_id, Some(997));
        assert_eq!(labeled[1].region_name, "");

        let dir = TempDir::new().unwrap();
        for name in ["cells.csv", "cells.csv.gz"] {
            let path = dir.path().join(name);
            write_points_csv(&path, &labeled).unwrap();
            let points = read_points_csv(&path, &PointColumns::default()).unwrap();
            assert_eq!(points, vec![a, b]);
        }
    }
}
