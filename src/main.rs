use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use cellmap::atomic::commit_all;
use cellmap::dedup::{PointDeduplicator, ScanStrategy};
use cellmap::density::{stage_density_maps, SphereRadius};
use cellmap::export::{region_output_paths, stage_region_outputs, OutputFormat};
use cellmap::ontology::{RegionOntology, SentinelIds};
use cellmap::points::{
    attach_labels, filter_thresholds, read_points_csv, remove_background, sort_by_intensity_desc,
    sort_by_z, stage_points_csv, write_points_csv, LabeledPoint, PointColumns, Thresholds,
};
use cellmap::resample::{resolve_target, Resampler};
use cellmap::volume::{label_points, probe_shape, read_volume, LabelTally, LabelVolume, VolumeShape};
use cellmap::{aggregate_regions, Result, VoxelSize};

#[derive(Parser, Debug)]
#[command(name = "cellmap")]
#[command(about = "Post-processing of registered cell detections: deduplication, per-region statistics, density maps and volume resampling.")]
struct Args {
    #[arg(short = 't', long, default_value = None)]
    nthreads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Remove detections that overlap a brighter one.
    Dedup(DedupArgs),

    /// Count cells and measure volumes per anatomical region.
    Regions(RegionArgs),

    /// Nearest-neighbour resize of a TIFF stack, out of core.
    Resample(ResampleArgs),

    /// Cell count and intensity density maps in the annotation frame.
    Density(DensityArgs),
}

#[derive(clap::Args, Debug)]
struct DedupArgs {
    input: PathBuf,
    output: PathBuf,

    #[arg(short = 'd', long, default_value_t = 5.0)]
    min_distance: f64,

    #[arg(long, default_value = None)]
    intensity_min: Option<f64>,

    #[arg(long, default_value = None)]
    intensity_max: Option<f64>,

    #[arg(long, default_value = None)]
    size_min: Option<f64>,

    #[arg(long, default_value = None)]
    size_max: Option<f64>,

    #[arg(short, long, default_value = "x")]
    x_column: String,

    #[arg(short, long, default_value = "y")]
    y_column: String,

    #[arg(short, long, default_value = "z")]
    z_column: String,

    #[arg(long, default_value = "source_intensity")]
    intensity_column: String,

    #[arg(long, default_value = "size")]
    size_column: String,

    /// Compare every pair of points instead of querying a k-d tree.
    #[arg(long, default_value_t = false)]
    exhaustive: bool,
}

#[derive(clap::Args, Debug)]
struct RegionArgs {
    /// Region hierarchy, a JSON array of region records.
    ontology: PathBuf,

    /// Detected cells, already transformed into the annotation frame.
    cells: PathBuf,

    /// Registered annotation (label) volume.
    annotation: PathBuf,

    /// Voxel size in micrometres, x y z.
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], default_values_t = [25.0, 25.0, 25.0])]
    resolution: Vec<f64>,

    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_fmt: OutputFormat,

    #[arg(long, default_value_t = 0)]
    universe_id: i64,

    #[arg(long, default_value_t = 997)]
    root_id: i64,

    /// Label cells by looking up their voxel in the annotation volume,
    /// instead of reading a region_id column.
    #[arg(long, default_value_t = false)]
    label_points: bool,

    /// Write the labelled cells, background removed, sorted by z.
    #[arg(long, default_value = None)]
    points_out: Option<PathBuf>,

    #[arg(long, default_value = "region_id")]
    region_column: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Dtype {
    U8,
    U16,
    U32,
    F32,
}

#[derive(clap::Args, Debug)]
struct ResampleArgs {
    source: PathBuf,
    output: PathBuf,

    /// Match the shape of this volume. Defaults to twice the source shape.
    #[arg(long, default_value = None)]
    like: Option<PathBuf>,

    /// Explicit target shape, z y x.
    #[arg(long, num_args = 3, value_names = ["Z", "Y", "X"], conflicts_with = "like")]
    shape: Option<Vec<usize>>,

    /// Directory for the temporary staging volumes.
    #[arg(long, default_value = None)]
    staging_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Dtype::U32)]
    dtype: Dtype,
}

#[derive(clap::Args, Debug)]
struct DensityArgs {
    /// Detected cells, already transformed into the annotation frame.
    cells: PathBuf,

    /// Annotation volume; only its shape is used.
    annotation: PathBuf,

    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Sphere radius in voxels, x y z.
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], default_values_t = [7, 7, 7])]
    radius: Vec<usize>,

    #[arg(long, default_value = "source_intensity")]
    intensity_column: String,
}

fn run_dedup(args: DedupArgs) -> Result<()> {
    let columns = PointColumns {
        x: args.x_column,
        y: args.y_column,
        z: args.z_column,
        intensity: args.intensity_column,
        size: args.size_column,
        ..PointColumns::default()
    };
    let points = read_points_csv(&args.input, &columns)?;
    info!("Read {} points from {}", points.len(), args.input.display());

    let thresholds = Thresholds {
        intensity_min: args.intensity_min,
        intensity_max: args.intensity_max,
        size_min: args.size_min,
        size_max: args.size_max,
    };
    let mut points = filter_thresholds(&points, &thresholds);
    sort_by_intensity_desc(&mut points);

    let strategy = if args.exhaustive {
        ScanStrategy::Exhaustive
    } else {
        ScanStrategy::KdTree
    };
    let mut kept = PointDeduplicator::new(args.min_distance)
        .with_strategy(strategy)
        .run(&points)?;
    sort_by_z(&mut kept);

    let rows: Vec<LabeledPoint> = kept
        .into_iter()
        .map(|point| LabeledPoint {
            point,
            region_name: String::new(),
            region_parent_id: None,
        })
        .collect();
    write_points_csv(&args.output, &rows)
}

fn run_regions(args: RegionArgs) -> Result<()> {
    let sentinels = SentinelIds {
        universe: args.universe_id,
        root: args.root_id,
    };
    let ontology = RegionOntology::from_path(&args.ontology, sentinels)?;
    info!("Loaded {} regions", ontology.len());

    let columns = PointColumns {
        region_id: args.region_column,
        ..PointColumns::default()
    };
    let mut points = read_points_csv(&args.cells, &columns)?;
    info!("Read {} cells from {}", points.len(), args.cells.display());

    let tally = if args.label_points {
        let labels: LabelVolume = read_volume(&args.annotation)?;
        label_points(&mut points, &labels, sentinels.universe);
        LabelTally::from_volume(&labels)
    } else {
        LabelTally::from_tiff(&args.annotation)?
    };

    let voxel_size = VoxelSize::new(args.resolution[0], args.resolution[1], args.resolution[2]);
    let summary = aggregate_regions(&ontology, voxel_size, &points, &tally)?;
    let mut outputs = stage_region_outputs(&args.output_dir, args.output_fmt, &ontology, &summary)?;
    if let Some(points_out) = args.points_out {
        let mut points = remove_background(&points, sentinels.universe);
        sort_by_z(&mut points);
        outputs.push(stage_points_csv(&points_out, &attach_labels(&points, &ontology))?);
    }
    commit_all(outputs)?;

    let (table, records) = region_output_paths(&args.output_dir, args.output_fmt);
    info!("Region statistics in {} and {}", table.display(), records.display());
    Ok(())
}

fn run_resample(args: ResampleArgs) -> Result<()> {
    let source_shape = probe_shape(&args.source)?;
    let target = match &args.shape {
        Some(shape) => VolumeShape::new(shape[0], shape[1], shape[2]),
        None => resolve_target(source_shape, args.like.as_deref())?,
    };

    let mut resampler = Resampler::new(target).with_progress(true);
    if let Some(dir) = &args.staging_dir {
        resampler = resampler.with_staging_dir(dir);
    }

    resample_as(&resampler, args.dtype, &args.source, &args.output)
}

fn resample_as(resampler: &Resampler, dtype: Dtype, source: &Path, output: &Path) -> Result<()> {
    match dtype {
        Dtype::U8 => resampler.resample_file::<u8>(source, output)?,
        Dtype::U16 => resampler.resample_file::<u16>(source, output)?,
        Dtype::U32 => resampler.resample_file::<u32>(source, output)?,
        Dtype::F32 => resampler.resample_file::<f32>(source, output)?,
    };
    Ok(())
}

fn run_density(args: DensityArgs) -> Result<()> {
    let columns = PointColumns {
        intensity: args.intensity_column,
        ..PointColumns::default()
    };
    let points = read_points_csv(&args.cells, &columns)?;
    let shape = probe_shape(&args.annotation)?;
    info!("Voxelizing {} cells into {}", points.len(), shape);

    let radius = SphereRadius::new(args.radius[0], args.radius[1], args.radius[2]);
    commit_all(stage_density_maps(&args.output_dir, &points, shape, radius)?)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(nthreads) = args.nthreads {
        if let Err(err) = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()
        {
            error!("Unable to configure thread pool: {}", err);
            return ExitCode::FAILURE;
        }
    }
    info!("Using {} threads", rayon::current_num_threads());

    let t0 = Instant::now();
    let result = match args.command {
        Command::Dedup(args) => run_dedup(args),
        Command::Regions(args) => run_regions(args),
        Command::Resample(args) => run_resample(args),
        Command::Density(args) => run_density(args),
    };

    match result {
        Ok(()) => {
            info!("Finished in {:?}", t0.elapsed());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
