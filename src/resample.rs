// Out-of-core nearest-neighbour resizing of label and intensity volumes.
//
// The 2-D resize primitive only touches two axes at a time, so the volume is
// resized in two passes through on-disk staging volumes:
//
//   1. every z slice is resized in (y, x) into staging volume A [z, y', x'];
//   2. A is rotated a quarter turn in its (z, y) plane so z becomes a slice
//      axis, and every slice is resized in (z, x') into staging volume B
//      [y', z', x'];
//   3. B is rotated back and streamed out slice by slice as [z', y', x'].
//
// Only one staging volume is written at a time and at most one input slice
// and one output slice are held in memory. Nearest-neighbour sampling never
// produces a value that is not already in the input, which is what keeps
// label volumes valid.

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::staging::{Rotation, StagingVolume};
use crate::volume::{probe_shape, PageReader, VolumeShape, VolumeWriter, Voxel};

// Scale applied to every axis when no usable reference shape is given.
pub const DEFAULT_UPSCALE: usize = 2;

// Source index sampled for destination index `i`, matching the pixel-centre
// convention of common image libraries.
pub fn nearest_index(i: usize, src_len: usize, dst_len: usize) -> usize {
    let pos = (i as f64 + 0.5) * (src_len as f64) / (dst_len as f64);
    (pos.floor() as usize).min(src_len.saturating_sub(1))
}

fn index_map(src_len: usize, dst_len: usize) -> Vec<usize> {
    (0..dst_len).map(|i| nearest_index(i, src_len, dst_len)).collect()
}

// Both planes must be non-empty; `run` rejects empty shapes up front.
fn resize_nearest<T: Copy>(plane: &ArrayView2<T>, rows: usize, cols: usize) -> Array2<T> {
    let (src_rows, src_cols) = plane.dim();
    let row_map = index_map(src_rows, rows);
    let col_map = index_map(src_cols, cols);
    Array2::from_shape_fn((rows, cols), |(r, c)| plane[[row_map[r], col_map[c]]])
}

// Target shape: the shape of a reference volume when one is given and
// non-empty, otherwise the source shape scaled by `DEFAULT_UPSCALE`.
pub fn resolve_target(source: VolumeShape, reference: Option<&Path>) -> Result<VolumeShape> {
    let reference = match reference {
        Some(path) if !path.as_os_str().is_empty() => path,
        _ => return Ok(source.scaled(DEFAULT_UPSCALE)),
    };

    let shape = probe_shape(reference)?;
    if shape.is_empty() {
        warn!(
            "Reference volume {} is empty, upscaling by {}",
            reference.display(),
            DEFAULT_UPSCALE
        );
        return Ok(source.scaled(DEFAULT_UPSCALE));
    }
    Ok(shape)
}

pub struct Resampler {
    target: VolumeShape,
    staging_dir: Option<PathBuf>,
    cancel: Option<Arc<AtomicBool>>,
    progress: bool,
}

impl Resampler {
    pub fn new(target: VolumeShape) -> Resampler {
        Resampler {
            target,
            staging_dir: None,
            cancel: None,
            progress: false,
        }
    }

    // Directory for staging files. Defaults to the system temporary directory.
    pub fn with_staging_dir(mut self, dir: &Path) -> Self {
        self.staging_dir = Some(dir.to_path_buf());
        self
    }

    // Checked between slices; setting it aborts with `Error::Cancelled`.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn target(&self) -> VolumeShape {
        self.target
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    fn progress_bar(&self, len: usize, msg: &'static str) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template("{msg:>12} [{bar:40}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(msg);
        bar
    }

    // Resample a TIFF stack into a new TIFF stack. The output only appears
    // once every slice has been written; staging files are removed on every
    // path out of this function.
    pub fn resample_file<T: Voxel>(&self, source: &Path, output: &Path) -> Result<VolumeShape> {
        let source_shape = probe_shape(source)?;
        let t0 = Instant::now();
        info!(
            "Resampling {} from {} to {}",
            source.display(),
            source_shape,
            self.target
        );

        let mut writer = VolumeWriter::<T>::create(output, self.target.y, self.target.x)?;
        self.run(
            source_shape,
            PageReader::<T>::open(source)?,
            |slice| writer.write_page(slice),
        )?;
        writer.finish()?;

        info!("Wrote {} in {:?}", output.display(), t0.elapsed());
        Ok(self.target)
    }

    pub fn resample_array<T: Voxel>(&self, source: &ArrayView3<T>) -> Result<Array3<T>> {
        let (z, y, x) = source.dim();
        let mut data = Vec::with_capacity(self.target.voxels());
        self.run(
            VolumeShape::new(z, y, x),
            source.axis_iter(Axis(0)).map(|s| Ok(s.to_owned())),
            |slice| {
                data.extend(slice.iter().cloned());
                Ok(())
            },
        )?;
        Array3::from_shape_vec((self.target.z, self.target.y, self.target.x), data)
            .map_err(|e| Error::Shape(e.to_string()))
    }

    fn run<T, I, F>(&self, source: VolumeShape, slices: I, mut sink: F) -> Result<()>
    where
        T: Voxel,
        I: Iterator<Item = Result<Array2<T>>>,
        F: FnMut(&ArrayView2<T>) -> Result<()>,
    {
        let target = self.target;
        if source.is_empty() {
            return Err(Error::Shape(format!("cannot resample empty volume {}", source)));
        }
        if target.is_empty() {
            return Err(Error::Shape(format!("cannot resample to empty shape {}", target)));
        }
        let dir = self.staging_dir.as_deref();

        // pass 1: (y, x)
        let bar = self.progress_bar(source.z, "x,y pass");
        let mut stage_xy = StagingVolume::<T>::create([source.z, target.y, target.x], dir)?;
        let mut nslices = 0;
        for (k, slice) in slices.enumerate() {
            self.check_cancelled()?;
            let slice = slice?;
            if k >= source.z || slice.dim() != (source.y, source.x) {
                return Err(Error::Shape(format!(
                    "slice {} is {:?}, expected {} slices of {:?}",
                    k,
                    slice.dim(),
                    source.z,
                    (source.y, source.x)
                )));
            }
            let resized = resize_nearest(&slice.view(), target.y, target.x);
            stage_xy.write_slice(k, &resized.view())?;
            nslices += 1;
            bar.inc(1);
        }
        bar.finish_and_clear();
        if nslices != source.z {
            return Err(Error::Shape(format!(
                "expected {} slices, read {}",
                source.z, nslices
            )));
        }

        // pass 2: (z, x) on the rotated volume, [y', z, x'] -> [y', z', x']
        let rotated = stage_xy.rot90(Rotation::Forward);
        let bar = self.progress_bar(target.y, "z pass");
        let mut stage_z = StagingVolume::<T>::create([target.y, target.z, target.x], dir)?;
        for i in 0..target.y {
            self.check_cancelled()?;
            let plane = rotated.read_slice(i)?;
            let resized = resize_nearest(&plane.view(), target.z, target.x);
            stage_z.write_slice(i, &resized.view())?;
            bar.inc(1);
        }
        bar.finish_and_clear();
        stage_xy.close()?;

        // undo the rotation while streaming out
        let restored = stage_z.rot90(Rotation::Inverse);
        let bar = self.progress_bar(target.z, "writing");
        for k in 0..target.z {
            self.check_cancelled()?;
            let slice = restored.read_slice(k)?;
            sink(&slice.view())?;
            bar.inc(1);
        }
        bar.finish_and_clear();
        stage_z.close()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{read_volume, write_volume};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn labels() -> Array3<u32> {
        Array3::from_shape_fn((4, 5, 6), |(z, y, x)| {
            if x < 3 {
                10 + z as u32
            } else if y < 2 {
                20
            } else {
                997
            }
        })
    }

    fn direct_resize<T: Copy>(volume: &Array3<T>, target: VolumeShape) -> Array3<T> {
        let (z, y, x) = volume.dim();
        let zmap = index_map(z, target.z);
        let ymap = index_map(y, target.y);
        let xmap = index_map(x, target.x);
        Array3::from_shape_fn((target.z, target.y, target.x), |(k, j, i)| {
            volume[[zmap[k], ymap[j], xmap[i]]]
        })
    }

    fn distinct(volume: &Array3<u32>) -> BTreeSet<u32> {
        volume.iter().cloned().collect()
    }

    #[test]
    fn test_nearest_index() {
        // upscale by two repeats each source index twice
        let up: Vec<usize> = (0..6).map(|i| nearest_index(i, 3, 6)).collect();
        assert_eq!(up, vec![0, 0, 1, 1, 2, 2]);

        // downscale by two takes the second of each pair
        let down: Vec<usize> = (0..3).map(|i| nearest_index(i, 6, 3)).collect();
        assert_eq!(down, vec![1, 3, 5]);

        assert_eq!(nearest_index(0, 1, 10), 0);
        assert_eq!(nearest_index(9, 1, 10), 0);
    }

    #[test]
    fn test_resize_nearest() {
        let plane = Array2::from_shape_vec((2, 2), vec![1u32, 2, 3, 4]).unwrap();
        let resized = resize_nearest(&plane.view(), 4, 4);
        let expected = Array2::from_shape_vec(
            (4, 4),
            vec![1, 1, 2, 2, 1, 1, 2, 2, 3, 3, 4, 4, 3, 3, 4, 4],
        )
        .unwrap();
        assert_eq!(resized, expected);
    }

    #[test]
    fn test_two_pass_matches_direct_resize() {
        let volume = labels();
        for target in [
            VolumeShape::new(8, 10, 12),
            VolumeShape::new(3, 7, 4),
            VolumeShape::new(9, 2, 13),
        ] {
            let resampled = Resampler::new(target)
                .resample_array(&volume.view())
                .unwrap();
            assert_eq!(resampled, direct_resize(&volume, target));
        }
    }

    #[test]
    fn test_round_trip_preserves_labels() {
        let volume = labels();
        let up = Resampler::new(VolumeShape::of(&volume).scaled(2))
            .resample_array(&volume.view())
            .unwrap();
        assert_eq!(distinct(&up), distinct(&volume));

        let down = Resampler::new(VolumeShape::of(&volume))
            .resample_array(&up.view())
            .unwrap();
        assert_eq!(distinct(&down), distinct(&volume));
        assert_eq!(down, volume);

        // a non-integer factor may shift boundaries but never invents labels
        let odd = Resampler::new(VolumeShape::new(7, 3, 11))
            .resample_array(&volume.view())
            .unwrap();
        assert!(distinct(&odd).is_subset(&distinct(&volume)));
    }

    #[test]
    fn test_resample_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("annotation.tif");
        let output = dir.path().join("annotation_upscaled.tif");
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();

        let volume = labels();
        write_volume(&source, &volume).unwrap();

        let target = resolve_target(VolumeShape::of(&volume), None).unwrap();
        assert_eq!(target, VolumeShape::new(8, 10, 12));

        let shape = Resampler::new(target)
            .with_staging_dir(&staging)
            .resample_file::<u32>(&source, &output)
            .unwrap();
        assert_eq!(shape, target);

        let resampled: Array3<u32> = read_volume(&output).unwrap();
        assert_eq!(resampled, direct_resize(&volume, target));
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_target_from_reference() {
        let dir = TempDir::new().unwrap();
        let reference = dir.path().join("stitched.tif");
        write_volume(&reference, &Array3::<u16>::zeros((6, 7, 8))).unwrap();

        let target = resolve_target(VolumeShape::new(2, 2, 2), Some(reference.as_path())).unwrap();
        assert_eq!(target, VolumeShape::new(6, 7, 8));

        let target = resolve_target(VolumeShape::new(2, 2, 2), Some(Path::new(""))).unwrap();
        assert_eq!(target, VolumeShape::new(4, 4, 4));

        let missing = dir.path().join("missing.tif");
        assert!(matches!(
            resolve_target(VolumeShape::new(2, 2, 2), Some(missing.as_path())),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_cancel_cleans_up() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("annotation.tif");
        let output = dir.path().join("out.tif");
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        write_volume(&source, &labels()).unwrap();

        let flag = Arc::new(AtomicBool::new(true));
        let result = Resampler::new(VolumeShape::new(8, 10, 12))
            .with_staging_dir(&staging)
            .with_cancel_flag(flag)
            .resample_file::<u32>(&source, &output);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
        // only the source remains next to the output
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_empty_source_rejected() {
        let volume = Array3::<u32>::zeros((2, 0, 3));
        let result = Resampler::new(VolumeShape::new(4, 4, 6)).resample_array(&volume.view());
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn test_empty_target_rejected() {
        let volume = labels();
        let result = Resampler::new(VolumeShape::new(0, 10, 12)).resample_array(&volume.view());
        assert!(matches!(result, Err(Error::Shape(_))));
    }
}
