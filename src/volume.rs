//! NIfTI volume I/O and voxel grid geometry.

use crate::error::{Error, Result};
use ndarray::{Array3, Array4, ArrayD, ArrayView3, Axis, Ix3, Ix4};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions, WriterOptions};
use std::path::Path;

/// tolerance used when comparing the affines of two grids
pub const AFFINE_TOLERANCE: f64 = 1e-4;

/// The spatial sampling of a volume: the shape of the first three axes and the voxel to
/// world (mm) affine.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub shape: [usize; 3],
    pub affine: [[f64; 4]; 4],
}

impl Grid {
    pub fn new(shape: [usize; 3], affine: [[f64; 4]; 4]) -> Self {
        Self { shape, affine }
    }

    /// a grid with unit voxels at the origin
    pub fn identity(shape: [usize; 3]) -> Self {
        let mut affine = [[0.; 4]; 4];
        (0..4).for_each(|i| affine[i][i] = 1.);
        Self { shape, affine }
    }

    /// resolves the voxel to world transform of a header. The sform is preferred, then the
    /// qform, then plain voxel scaling from pixdim.
    pub fn from_header(header: &NiftiHeader) -> Self {
        let shape = [header.dim[1] as usize, header.dim[2].max(1) as usize, header.dim[3].max(1) as usize];
        let affine = if header.sform_code > 0 {
            sform_affine(header)
        } else if header.qform_code > 0 {
            qform_affine(header)
        } else {
            let mut a = [[0.; 4]; 4];
            (0..3).for_each(|i| a[i][i] = header.pixdim[i + 1] as f64);
            a[3][3] = 1.;
            a
        };
        Self { shape, affine }
    }

    /// true when both grids sample the same points in world space
    pub fn is_aligned(&self, other: &Grid) -> bool {
        self.shape == other.shape && self.affine.iter().flatten().zip(other.affine.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= AFFINE_TOLERANCE)
    }

    pub fn n_voxels(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn voxel_to_world(&self, ijk: [f64; 3]) -> [f64; 3] {
        let a = &self.affine;
        let mut xyz = [0.; 3];
        xyz.iter_mut().enumerate().for_each(|(r, x)| {
            *x = a[r][0] * ijk[0] + a[r][1] * ijk[1] + a[r][2] * ijk[2] + a[r][3];
        });
        xyz
    }

    /// returns the inverse transform, mapping world coordinates back into this grid's voxel space
    pub fn world_to_voxel(&self) -> Result<[[f64; 4]; 4]> {
        invert_affine(&self.affine)
    }
}

/// A volume read from disk together with its grid. Volumes with more than three axes keep the
/// extra axes after the spatial ones.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: ArrayD<f32>,
    pub grid: Grid,
}

impl Volume {
    /// views the volume as 4-D, treating a 3-D volume as a single frame
    pub fn into_4d(self) -> Result<(Array4<f32>, Grid)> {
        let data = match self.data.ndim() {
            3 => self.data.insert_axis(Axis(3)),
            _ => self.data,
        };
        Ok((data.into_dimensionality::<Ix4>()?, self.grid))
    }

    /// views the volume as 3-D, dropping a trailing singleton frame axis
    pub fn into_3d(self) -> Result<(Array3<f32>, Grid)> {
        let mut data = self.data;
        while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
            data = data.index_axis_move(Axis(data.ndim() - 1), 0);
        }
        Ok((data.into_dimensionality::<Ix3>()?, self.grid))
    }
}

pub fn read_volume(path: impl AsRef<Path>) -> Result<Volume> {
    let obj = ReaderOptions::new().read_file(path.as_ref())?;
    let grid = Grid::from_header(obj.header());
    let data = obj.into_volume().into_ndarray::<f32>()?;
    if data.ndim() < 3 {
        return Err(Error::Grid(format!("{} has {} dimensions, expected at least 3", path.as_ref().display(), data.ndim())));
    }
    Ok(Volume { data, grid })
}

/// reads a binary mask. Any non-zero voxel is part of the mask.
pub fn read_mask(path: impl AsRef<Path>) -> Result<(Array3<bool>, Grid)> {
    let (data, grid) = read_volume(path)?.into_3d()?;
    Ok((data.mapv(|x| x != 0.), grid))
}

/// writes an array to a NIfTI file carrying the affine of `grid` as its sform
pub fn write_volume(path: impl AsRef<Path>, data: &ArrayD<f32>, grid: &Grid) -> Result<()> {
    let header = header_for_grid(grid);
    WriterOptions::new(path.as_ref())
        .reference_header(&header)
        .write_nifti(data)?;
    Ok(())
}

pub fn write_mask(path: impl AsRef<Path>, mask: ArrayView3<bool>, grid: &Grid) -> Result<()> {
    let data = mask.mapv(|m| if m { 1f32 } else { 0. }).into_dyn();
    write_volume(path, &data, grid)
}

fn header_for_grid(grid: &Grid) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    header.sform_code = 1;
    header.qform_code = 0;
    let row = |r: usize| {
        let mut v = [0f32; 4];
        v.iter_mut().zip(&grid.affine[r]).for_each(|(v, &a)| *v = a as f32);
        v
    };
    header.srow_x = row(0);
    header.srow_y = row(1);
    header.srow_z = row(2);
    (0..3).for_each(|c| {
        let col_norm = (0..3).map(|r| grid.affine[r][c].powi(2)).sum::<f64>().sqrt();
        header.pixdim[c + 1] = col_norm as f32;
    });
    header
}

fn sform_affine(h: &NiftiHeader) -> [[f64; 4]; 4] {
    let mut a = [[0.; 4]; 4];
    for (dst, src) in a.iter_mut().zip([&h.srow_x, &h.srow_y, &h.srow_z]) {
        dst.iter_mut().zip(src).for_each(|(d, &s)| *d = s as f64);
    }
    a[3][3] = 1.;
    a
}

fn qform_affine(h: &NiftiHeader) -> [[f64; 4]; 4] {
    let b = h.quatern_b as f64;
    let c = h.quatern_c as f64;
    let d = h.quatern_d as f64;
    let a = (1. - (b * b + c * c + d * d)).max(0.).sqrt();
    let qfac = if h.pixdim[0] < 0. { -1. } else { 1. };
    let rot = [
        [a * a + b * b - c * c - d * d, 2. * (b * c - a * d), 2. * (b * d + a * c)],
        [2. * (b * c + a * d), a * a + c * c - b * b - d * d, 2. * (c * d - a * b)],
        [2. * (b * d - a * c), 2. * (c * d + a * b), a * a + d * d - b * b - c * c],
    ];
    let scale = [h.pixdim[1] as f64, h.pixdim[2] as f64, qfac * h.pixdim[3] as f64];
    let offset = [h.quatern_x as f64, h.quatern_y as f64, h.quatern_z as f64];
    let mut out = [[0.; 4]; 4];
    for r in 0..3 {
        for col in 0..3 {
            out[r][col] = rot[r][col] * scale[col];
        }
        out[r][3] = offset[r];
    }
    out[3][3] = 1.;
    out
}

fn invert_affine(a: &[[f64; 4]; 4]) -> Result<[[f64; 4]; 4]> {
    // inverse of the 3x3 linear part via cofactors, translation follows
    let m = |r: usize, c: usize| a[r][c];
    let det = m(0, 0) * (m(1, 1) * m(2, 2) - m(1, 2) * m(2, 1))
        - m(0, 1) * (m(1, 0) * m(2, 2) - m(1, 2) * m(2, 0))
        + m(0, 2) * (m(1, 0) * m(2, 1) - m(1, 1) * m(2, 0));
    if det.abs() < f64::EPSILON {
        return Err(Error::Grid("affine is singular".to_string()));
    }
    let mut inv = [[0.; 4]; 4];
    inv[0][0] = (m(1, 1) * m(2, 2) - m(1, 2) * m(2, 1)) / det;
    inv[0][1] = (m(0, 2) * m(2, 1) - m(0, 1) * m(2, 2)) / det;
    inv[0][2] = (m(0, 1) * m(1, 2) - m(0, 2) * m(1, 1)) / det;
    inv[1][0] = (m(1, 2) * m(2, 0) - m(1, 0) * m(2, 2)) / det;
    inv[1][1] = (m(0, 0) * m(2, 2) - m(0, 2) * m(2, 0)) / det;
    inv[1][2] = (m(0, 2) * m(1, 0) - m(0, 0) * m(1, 2)) / det;
    inv[2][0] = (m(1, 0) * m(2, 1) - m(1, 1) * m(2, 0)) / det;
    inv[2][1] = (m(0, 1) * m(2, 0) - m(0, 0) * m(2, 1)) / det;
    inv[2][2] = (m(0, 0) * m(1, 1) - m(0, 1) * m(1, 0)) / det;
    for r in 0..3 {
        inv[r][3] = -(0..3).map(|c| inv[r][c] * a[c][3]).sum::<f64>();
    }
    inv[3][3] = 1.;
    Ok(inv)
}
