// Fixed-size on-disk volume used as scratch space by the resampler.
//
// The backing file is a private temporary file, unique per staging volume,
// and is removed when the volume is closed or dropped, whichever comes first,
// so staging data never outlives the call that created it even on error.
// Data is laid out row-major as [slice][row][col] and only ever moved through
// memory one slice or one row at a time.

use log::trace;
use ndarray::{Array2, ArrayView2};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::volume::Voxel;

pub struct StagingVolume<T: Voxel> {
    file: NamedTempFile,
    shape: [usize; 3],
    _voxel: PhantomData<T>,
}

impl<T: Voxel> StagingVolume<T> {
    // Reserve a zero-filled [slices, rows, cols] volume in `dir`, or in the
    // system temporary directory.
    pub fn create(shape: [usize; 3], dir: Option<&Path>) -> Result<StagingVolume<T>> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".cellmap-staging-").suffix(".raw");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        let nbytes = shape.iter().product::<usize>() * std::mem::size_of::<T>();
        file.as_file().set_len(nbytes as u64)?;
        trace!(
            "Staging volume {:?} ({} bytes) at {}",
            shape,
            nbytes,
            file.path().display()
        );

        Ok(StagingVolume {
            file,
            shape,
            _voxel: PhantomData,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn row_offset(&self, slice: usize, row: usize) -> u64 {
        let [_, rows, cols] = self.shape;
        ((slice * rows + row) * cols * std::mem::size_of::<T>()) as u64
    }

    fn seek_to(&self, slice: usize, row: usize) -> Result<&File> {
        let [slices, rows, _] = self.shape;
        if slice >= slices || row >= rows {
            return Err(Error::Shape(format!(
                "row ({}, {}) is outside staging volume {:?}",
                slice, row, self.shape
            )));
        }
        let mut file = self.file.as_file();
        file.seek(SeekFrom::Start(self.row_offset(slice, row)))?;
        Ok(file)
    }

    pub fn write_slice(&mut self, slice: usize, data: &ArrayView2<T>) -> Result<()> {
        let [_, rows, cols] = self.shape;
        if data.dim() != (rows, cols) {
            return Err(Error::Shape(format!(
                "slice is {:?}, staging volume expects {:?}",
                data.dim(),
                (rows, cols)
            )));
        }

        let mut file = self.seek_to(slice, 0)?;
        match data.as_slice() {
            Some(values) => file.write_all(bytemuck::cast_slice(values))?,
            None => {
                let values: Vec<T> = data.iter().cloned().collect();
                file.write_all(bytemuck::cast_slice(&values))?
            }
        }
        Ok(())
    }

    pub fn read_row(&self, slice: usize, row: usize, out: &mut [T]) -> Result<()> {
        let cols = self.shape[2];
        if out.len() != cols {
            return Err(Error::Shape(format!(
                "row buffer holds {} values, staging rows have {}",
                out.len(),
                cols
            )));
        }
        let mut file = self.seek_to(slice, row)?;
        file.read_exact(bytemuck::cast_slice_mut(out))?;
        Ok(())
    }

    pub fn read_slice(&self, slice: usize) -> Result<Array2<T>> {
        let [_, rows, cols] = self.shape;
        let mut values = vec![<T as bytemuck::Zeroable>::zeroed(); rows * cols];
        let mut file = self.seek_to(slice, 0)?;
        file.read_exact(bytemuck::cast_slice_mut(&mut values))?;
        Array2::from_shape_vec((rows, cols), values).map_err(|e| Error::Shape(e.to_string()))
    }

    pub fn rot90(&self, rotation: Rotation) -> RotatedView<'_, T> {
        RotatedView {
            source: self,
            rotation,
        }
    }

    // Remove the backing file now, reporting any failure to do so.
    pub fn close(self) -> Result<()> {
        self.file.close()?;
        Ok(())
    }
}

// Quarter turn in the plane of the first two axes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rotation {
    // view[i][j] = source[j][rows - 1 - i]
    Forward,
    // view[i][j] = source[slices - 1 - j][i], undoing `Forward`
    Inverse,
}

// A rotated view of a staging volume. Slices of the view are gathered row
// by row from the underlying file. The view of a [a, b, c] volume has shape
// [b, a, c] in both directions.
pub struct RotatedView<'a, T: Voxel> {
    source: &'a StagingVolume<T>,
    rotation: Rotation,
}

impl<'a, T: Voxel> RotatedView<'a, T> {
    pub fn shape(&self) -> [usize; 3] {
        let [a, b, c] = self.source.shape;
        [b, a, c]
    }

    pub fn read_slice(&self, i: usize) -> Result<Array2<T>> {
        let [a, b, c] = self.source.shape;
        if i >= b {
            return Err(Error::Shape(format!(
                "slice {} is outside rotated view {:?}",
                i,
                self.shape()
            )));
        }

        let mut values = vec![<T as bytemuck::Zeroable>::zeroed(); a * c];
        for (j, row) in values.chunks_mut(c.max(1)).enumerate().take(a) {
            let (slice, source_row) = match self.rotation {
                Rotation::Forward => (j, b - 1 - i),
                Rotation::Inverse => (a - 1 - j, i),
            };
            self.source.read_row(slice, source_row, &mut row[..c])?;
        }
        Array2::from_shape_vec((a, c), values).map_err(|e| Error::Shape(e.to_string()))
    }
}
