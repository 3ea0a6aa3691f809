// Cell density maps: every point spreads its weight (1 for a count map, its
// intensity for an intensity map) over the voxels of an ellipsoid centred
// on the point's nearest voxel. Maps are built one z page at a time, so only
// a single page is held in memory regardless of the volume size.

use log::{debug, info};
use ndarray::{Array2, Array3, ArrayView2};
use std::path::Path;

use crate::atomic::AtomicFile;
use crate::error::{Error, Result};
use crate::points::Point;
use crate::volume::{VolumeShape, VolumeWriter, Voxel};

pub const DENSITY_COUNTS_NAME: &str = "density_counts.tif";
pub const DENSITY_INTENSITIES_NAME: &str = "density_intensities.tif";

// Ellipsoid semi-axes in voxels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SphereRadius {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl SphereRadius {
    pub fn new(x: usize, y: usize, z: usize) -> SphereRadius {
        SphereRadius { x, y, z }
    }

    pub fn isotropic(r: usize) -> SphereRadius {
        SphereRadius::new(r, r, r)
    }
}

impl Default for SphereRadius {
    fn default() -> Self {
        SphereRadius::isotropic(7)
    }
}

// Normalized squared offset along one axis. A zero radius only admits a zero
// offset.
fn axis_term(d: isize, r: usize) -> Option<f64> {
    if r == 0 {
        return if d == 0 { Some(0.0) } else { None };
    }
    let t = d as f64 / r as f64;
    Some(t * t)
}

// Voxel offsets inside the ellipsoid, grouped by z offset.
#[derive(Clone, Debug)]
pub struct SphereKernel {
    rz: usize,
    planes: Vec<Vec<(isize, isize)>>,
}

impl SphereKernel {
    pub fn new(radius: SphereRadius) -> SphereKernel {
        let (rx, ry, rz) = (radius.x as isize, radius.y as isize, radius.z as isize);
        let planes = (-rz..=rz)
            .map(|dz| {
                let mut plane = Vec::new();
                for dy in -ry..=ry {
                    for dx in -rx..=rx {
                        let terms = (
                            axis_term(dz, radius.z),
                            axis_term(dy, radius.y),
                            axis_term(dx, radius.x),
                        );
                        if let (Some(a), Some(b), Some(c)) = terms {
                            if a + b + c <= 1.0 {
                                plane.push((dy, dx));
                            }
                        }
                    }
                }
                plane
            })
            .collect();

        SphereKernel {
            rz: radius.z,
            planes,
        }
    }

    pub fn len(&self) -> usize {
        self.planes.iter().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn plane(&self, dz: isize) -> &[(isize, isize)] {
        &self.planes[(dz + self.rz as isize) as usize]
    }
}

struct Splat {
    y: isize,
    x: isize,
    weight: f64,
}

fn nearest_voxel(coord: f64) -> isize {
    coord.round() as isize
}

// Points bucketed by the z page holding their centre. Centres may lie up to
// one radius outside the volume and still touch it.
fn bucket_points(
    points: &[Point],
    weights: Option<&[f64]>,
    shape: VolumeShape,
    rz: usize,
) -> Result<Vec<Vec<Splat>>> {
    if let Some(weights) = weights {
        if weights.len() != points.len() {
            return Err(Error::Shape(format!(
                "{} weights for {} points",
                weights.len(),
                points.len()
            )));
        }
    }

    let nbuckets = shape.z + 2 * rz;
    let mut buckets: Vec<Vec<Splat>> = (0..nbuckets).map(|_| Vec::new()).collect();
    let mut skipped = 0;
    for (i, p) in points.iter().enumerate() {
        let weight = weights.map_or(1.0, |w| w[i]);
        if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite() && weight.is_finite()) {
            skipped += 1;
            continue;
        }

        let bucket = nearest_voxel(p.z) + rz as isize;
        if bucket < 0 || bucket >= nbuckets as isize {
            continue;
        }
        buckets[bucket as usize].push(Splat {
            y: nearest_voxel(p.y),
            x: nearest_voxel(p.x),
            weight,
        });
    }
    if skipped > 0 {
        debug!("Skipped {} points with non-finite coordinates or weights", skipped);
    }
    Ok(buckets)
}

fn voxelize_pages<F>(
    points: &[Point],
    weights: Option<&[f64]>,
    shape: VolumeShape,
    radius: SphereRadius,
    mut sink: F,
) -> Result<()>
where
    F: FnMut(&ArrayView2<f64>) -> Result<()>,
{
    let kernel = SphereKernel::new(radius);
    let rz = radius.z;
    let buckets = bucket_points(points, weights, shape, rz)?;
    let (ny, nx) = (shape.y as isize, shape.x as isize);

    let mut page = Array2::<f64>::zeros((shape.y, shape.x));
    for k in 0..shape.z {
        page.fill(0.0);
        // bucket b holds centres on page b - rz, which reach pages within rz
        for (b, bucket) in buckets.iter().enumerate().skip(k).take(2 * rz + 1) {
            let dz = k as isize + rz as isize - b as isize;
            for splat in bucket {
                for &(dy, dx) in kernel.plane(dz) {
                    let (y, x) = (splat.y + dy, splat.x + dx);
                    if y >= 0 && y < ny && x >= 0 && x < nx {
                        page[[y as usize, x as usize]] += splat.weight;
                    }
                }
            }
        }
        sink(&page.view())?;
    }
    Ok(())
}

// In-memory density map, indexed [z, y, x].
pub fn voxelize_points(
    points: &[Point],
    weights: Option<&[f64]>,
    shape: VolumeShape,
    radius: SphereRadius,
) -> Result<Array3<f64>> {
    let mut data = Vec::with_capacity(shape.voxels());
    voxelize_pages(points, weights, shape, radius, |page| {
        data.extend(page.iter().cloned());
        Ok(())
    })?;
    Array3::from_shape_vec((shape.z, shape.y, shape.x), data)
        .map_err(|e| Error::Shape(e.to_string()))
}

// Stream a density map into a TIFF stack that is written but not yet
// published.
pub fn stage_density_volume<T: Voxel>(
    path: &Path,
    points: &[Point],
    weights: Option<&[f64]>,
    shape: VolumeShape,
    radius: SphereRadius,
) -> Result<AtomicFile> {
    let mut writer = VolumeWriter::<T>::create(path, shape.y, shape.x)?;
    let mut converted = Array2::<T>::default((shape.y, shape.x));
    voxelize_pages(points, weights, shape, radius, |page| {
        converted.zip_mut_with(page, |out, &v| *out = T::from_f64(v));
        writer.write_page(&converted.view())
    })?;
    info!("Wrote {} density map to {}", shape, path.display());
    writer.into_staged()
}

// Count map (u32) and intensity-weighted map (f32) in `dir`, written but not
// yet published.
pub fn stage_density_maps(
    dir: &Path,
    points: &[Point],
    shape: VolumeShape,
    radius: SphereRadius,
) -> Result<Vec<AtomicFile>> {
    let intensities: Vec<f64> = points.iter().map(|p| p.intensity).collect();
    Ok(vec![
        stage_density_volume::<u32>(&dir.join(DENSITY_COUNTS_NAME), points, None, shape, radius)?,
        stage_density_volume::<f32>(
            &dir.join(DENSITY_INTENSITIES_NAME),
            points,
            Some(&intensities),
            shape,
            radius,
        )?,
    ])
}
