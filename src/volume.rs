// Volumes on disk are multi-page single-channel TIFF stacks, one page per z
// slice. In memory they are `Array3` indexed as [z, y, x].

use log::debug;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek, Write};
use std::marker::PhantomData;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder, TiffKind, TiffKindBig};

use crate::atomic::AtomicFile;
use crate::error::{Error, Result};
use crate::ontology::RegionId;
use crate::points::Point;

pub type LabelVolume = Array3<u32>;

// Element types that can live in a volume: plain-old-data so they can be
// staged on disk byte-for-byte, and with a TIFF grayscale representation.
pub trait Voxel: bytemuck::Pod + Default + PartialEq + Send + Sync + std::fmt::Debug {
    fn write_page<W: Write + Seek, K: TiffKind>(
        encoder: &mut TiffEncoder<W, K>,
        width: u32,
        height: u32,
        data: &[Self],
    ) -> Result<()>;

    fn from_decoded(result: DecodingResult) -> Option<Vec<Self>>;

    // Saturating for integer voxels.
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_voxel {
    ($t:ty, $color:ty, $($variant:ident),+) => {
        impl Voxel for $t {
            fn write_page<W: Write + Seek, K: TiffKind>(
                encoder: &mut TiffEncoder<W, K>,
                width: u32,
                height: u32,
                data: &[Self],
            ) -> Result<()> {
                encoder.write_image::<$color>(width, height, data)?;
                Ok(())
            }

            // narrower integer pages are widened
            fn from_decoded(result: DecodingResult) -> Option<Vec<Self>> {
                match result {
                    $(DecodingResult::$variant(v) => Some(v.into_iter().map(<$t>::from).collect()),)+
                    _ => None,
                }
            }

            fn from_f64(value: f64) -> Self {
                value as $t
            }
        }
    };
}

impl_voxel!(u8, colortype::Gray8, U8);
impl_voxel!(u16, colortype::Gray16, U8, U16);
impl_voxel!(u32, colortype::Gray32, U8, U16, U32);
impl_voxel!(f32, colortype::Gray32Float, U8, U16, F32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VolumeShape {
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl VolumeShape {
    pub fn new(z: usize, y: usize, x: usize) -> VolumeShape {
        VolumeShape { z, y, x }
    }

    pub fn of<T>(volume: &Array3<T>) -> VolumeShape {
        let (z, y, x) = volume.dim();
        VolumeShape { z, y, x }
    }

    pub fn voxels(&self) -> usize {
        self.z * self.y * self.x
    }

    pub fn is_empty(&self) -> bool {
        self.voxels() == 0
    }

    pub fn scaled(&self, factor: usize) -> VolumeShape {
        VolumeShape::new(self.z * factor, self.y * factor, self.x * factor)
    }
}

impl std::fmt::Display for VolumeShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{} (z, y, x)", self.z, self.y, self.x)
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    let decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());
    Ok(decoder)
}

fn dimensions(decoder: &mut Decoder<BufReader<File>>) -> Result<(usize, usize)> {
    let (width, height) = decoder.dimensions()?;
    Ok((height as usize, width as usize))
}

// Page-at-a-time reader, so volumes can be streamed without holding the
// whole stack in memory.
pub struct PageReader<T: Voxel> {
    decoder: Decoder<BufReader<File>>,
    started: bool,
    done: bool,
    _voxel: PhantomData<T>,
}

impl<T: Voxel> PageReader<T> {
    pub fn open(path: &Path) -> Result<PageReader<T>> {
        Ok(PageReader {
            decoder: open_decoder(path)?,
            started: false,
            done: false,
            _voxel: PhantomData,
        })
    }

    fn read_page(&mut self) -> Result<Array2<T>> {
        let (rows, cols) = dimensions(&mut self.decoder)?;
        let data = T::from_decoded(self.decoder.read_image()?).ok_or_else(|| {
            Error::Shape(String::from("TIFF page has an unsupported sample type"))
        })?;
        Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| Error::Shape(format!("TIFF page does not match its dimensions: {}", e)))
    }

    fn advance(&mut self) -> Result<bool> {
        if !self.started {
            self.started = true;
            return Ok(true);
        }
        if !self.decoder.more_images() {
            return Ok(false);
        }
        self.decoder.next_image()?;
        Ok(true)
    }
}

impl<T: Voxel> Iterator for PageReader<T> {
    type Item = Result<Array2<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let page = match self.advance() {
            Ok(true) => self.read_page(),
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(e),
        };
        if page.is_err() {
            self.done = true;
        }
        Some(page)
    }
}

// Shape of a TIFF stack, read from the page directories only.
pub fn probe_shape(path: &Path) -> Result<VolumeShape> {
    let mut decoder = open_decoder(path)?;
    let (y, x) = dimensions(&mut decoder)?;
    let mut z = 1;
    while decoder.more_images() {
        decoder.next_image()?;
        let dims = dimensions(&mut decoder)?;
        if dims != (y, x) {
            return Err(Error::Shape(format!(
                "page {} of {} is {}x{}, expected {}x{}",
                z,
                path.display(),
                dims.0,
                dims.1,
                y,
                x
            )));
        }
        z += 1;
    }
    Ok(VolumeShape::new(z, y, x))
}

pub fn read_volume<T: Voxel>(path: &Path) -> Result<Array3<T>> {
    let mut pages = 0;
    let mut data = Vec::new();
    let mut plane = None;
    for page in PageReader::<T>::open(path)? {
        let page = page?;
        match plane {
            None => plane = Some(page.dim()),
            Some(dim) if dim != page.dim() => {
                return Err(Error::Shape(format!(
                    "inconsistent page sizes in {}",
                    path.display()
                )))
            }
            _ => {}
        }
        data.extend(page.iter().cloned());
        pages += 1;
    }

    let (rows, cols) = plane.unwrap_or((0, 0));
    let volume = Array3::from_shape_vec((pages, rows, cols), data)
        .map_err(|e| Error::Shape(e.to_string()))?;
    debug!("Read {} volume from {}", VolumeShape::of(&volume), path.display());
    Ok(volume)
}

// Streams pages into a BigTIFF file that only appears at `path` once
// `finish` succeeds.
pub struct VolumeWriter<T: Voxel> {
    encoder: TiffEncoder<File, TiffKindBig>,
    output: AtomicFile,
    plane: (usize, usize),
    pages: usize,
    _voxel: PhantomData<T>,
}

impl<T: Voxel> VolumeWriter<T> {
    pub fn create(path: &Path, rows: usize, cols: usize) -> Result<VolumeWriter<T>> {
        let output = AtomicFile::create(path)?;
        let encoder = TiffEncoder::new_big(output.as_file().try_clone()?)?;
        Ok(VolumeWriter {
            encoder,
            output,
            plane: (rows, cols),
            pages: 0,
            _voxel: PhantomData,
        })
    }

    pub fn write_page(&mut self, page: &ArrayView2<T>) -> Result<()> {
        if page.dim() != self.plane {
            return Err(Error::Shape(format!(
                "page is {:?}, expected {:?}",
                page.dim(),
                self.plane
            )));
        }

        let (rows, cols) = self.plane;
        match page.as_slice() {
            Some(data) => T::write_page(&mut self.encoder, cols as u32, rows as u32, data)?,
            None => {
                let data: Vec<T> = page.iter().cloned().collect();
                T::write_page(&mut self.encoder, cols as u32, rows as u32, &data)?
            }
        }
        self.pages += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<usize> {
        let pages = self.pages;
        self.into_staged()?.commit()?;
        Ok(pages)
    }

    // Close the stack without publishing it, for callers that publish
    // several outputs together.
    pub fn into_staged(self) -> Result<AtomicFile> {
        drop(self.encoder);
        Ok(self.output)
    }
}

pub fn write_volume<T: Voxel>(path: &Path, volume: &Array3<T>) -> Result<()> {
    let (_, rows, cols) = volume.dim();
    let mut writer = VolumeWriter::<T>::create(path, rows, cols)?;
    for page in volume.axis_iter(Axis(0)) {
        writer.write_page(&page)?;
    }
    writer.finish()?;
    Ok(())
}

// Voxel count per distinct label, sorted by label.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelTally {
    entries: Vec<(u32, u64)>,
}

fn merge_counts(mut a: HashMap<u32, u64>, b: HashMap<u32, u64>) -> HashMap<u32, u64> {
    for (label, count) in b {
        *a.entry(label).or_insert(0) += count;
    }
    a
}

fn count_plane(mut counts: HashMap<u32, u64>, plane: ArrayView2<u32>) -> HashMap<u32, u64> {
    for &label in plane.iter() {
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}

impl LabelTally {
    fn from_counts(counts: HashMap<u32, u64>) -> LabelTally {
        let mut entries: Vec<(u32, u64)> = counts.into_iter().collect();
        entries.sort_unstable();
        LabelTally { entries }
    }

    pub fn from_volume(volume: &LabelVolume) -> LabelTally {
        let counts = volume
            .axis_iter(Axis(0))
            .into_par_iter()
            .fold(HashMap::new, count_plane)
            .reduce(HashMap::new, merge_counts);
        Self::from_counts(counts)
    }

    // Streams the stack page by page.
    pub fn from_tiff(path: &Path) -> Result<LabelTally> {
        let mut counts = HashMap::new();
        for page in PageReader::<u32>::open(path)? {
            counts = count_plane(counts, page?.view());
        }
        Ok(Self::from_counts(counts))
    }

    pub fn entries(&self) -> &[(u32, u64)] {
        &self.entries
    }

    pub fn get(&self, label: u32) -> u64 {
        match self.entries.binary_search_by_key(&label, |&(l, _)| l) {
            Ok(i) => self.entries[i].1,
            Err(_) => 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.entries.iter().map(|&(_, n)| n).sum()
    }
}

fn voxel_index(coord: f64, len: usize) -> Option<usize> {
    if !coord.is_finite() {
        return None;
    }
    let i = coord.round();
    if i < 0.0 || i >= len as f64 {
        None
    } else {
        Some(i as usize)
    }
}

// Assign each point the label of the voxel containing it. Points outside
// the volume are placed in the universe.
pub fn label_points(points: &mut [Point], labels: &LabelVolume, universe: RegionId) {
    let (nz, ny, nx) = labels.dim();
    points.par_iter_mut().for_each(|p| {
        let index = match (voxel_index(p.z, nz), voxel_index(p.y, ny), voxel_index(p.x, nx)) {
            (Some(k), Some(j), Some(i)) => Some([k, j, i]),
            _ => None,
        };
        p.region_id = Some(match index {
            Some(index) => labels[index] as RegionId,
            None => universe,
        });
    });
}
