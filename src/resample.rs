//! Resampling of volumes from one voxel grid onto another.

use crate::error::Result;
use crate::volume::Grid;
use ndarray::{Array3, Array4, ArrayView3, Axis, ShapeBuilder};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Linear,
}

/// composes target voxel -> world -> source voxel
fn target_to_source(source: &Grid, target: &Grid) -> Result<[[f64; 4]; 4]> {
    let inv = source.world_to_voxel()?;
    let mut m = [[0.; 4]; 4];
    for r in 0..4 {
        for c in 0..4 {
            m[r][c] = (0..4).map(|k| inv[r][k] * target.affine[k][c]).sum();
        }
    }
    Ok(m)
}

/// source voxel coordinates for every target voxel, in C order of the target grid
fn source_coords(source: &Grid, target: &Grid) -> Result<Vec<[f64; 3]>> {
    let m = target_to_source(source, target)?;
    let [_, ny, nz] = target.shape;
    Ok((0..target.n_voxels()).into_par_iter().map(|idx| {
        let i = (idx / (ny * nz)) as f64;
        let j = ((idx / nz) % ny) as f64;
        let k = (idx % nz) as f64;
        let mut p = [0.; 3];
        p.iter_mut().enumerate().for_each(|(r, p)| *p = m[r][0] * i + m[r][1] * j + m[r][2] * k + m[r][3]);
        p
    }).collect())
}

fn sample_nearest(vol: &ArrayView3<f32>, p: &[f64; 3]) -> f32 {
    let dims = vol.dim();
    let dims = [dims.0, dims.1, dims.2];
    let mut idx = [0usize; 3];
    for d in 0..3 {
        let r = p[d].round();
        if r < 0. || r >= dims[d] as f64 {
            return 0.;
        }
        idx[d] = r as usize;
    }
    vol[idx]
}

fn sample_linear(vol: &ArrayView3<f32>, p: &[f64; 3]) -> f32 {
    let dims = vol.dim();
    let dims = [dims.0 as i64, dims.1 as i64, dims.2 as i64];
    let base = [p[0].floor(), p[1].floor(), p[2].floor()];
    let frac = [p[0] - base[0], p[1] - base[1], p[2] - base[2]];
    let mut acc = 0f64;
    for corner in 0..8 {
        let mut w = 1f64;
        let mut idx = [0usize; 3];
        let mut inside = true;
        for d in 0..3 {
            let upper = (corner >> d) & 1 == 1;
            let c = base[d] as i64 + upper as i64;
            w *= if upper { frac[d] } else { 1. - frac[d] };
            if c < 0 || c >= dims[d] {
                inside = false;
                break;
            }
            idx[d] = c as usize;
        }
        if inside && w > 0. {
            acc += w * vol[idx] as f64;
        }
    }
    acc as f32
}

/// resamples every frame (axis 3) of `data` from the `source` grid onto the `target` grid.
/// Target voxels that map outside the source volume are set to zero.
pub fn resample_frames(data: &Array4<f32>, source: &Grid, target: &Grid, interpolation: Interpolation) -> Result<Array4<f32>> {
    let coords = source_coords(source, target)?;
    let [nx, ny, nz] = target.shape;
    let n_frames = data.len_of(Axis(3));
    let mut out = Array4::<f32>::zeros((nx, ny, nz, n_frames).f());
    for (frame, mut dst) in data.axis_iter(Axis(3)).zip(out.axis_iter_mut(Axis(3))) {
        let values: Vec<f32> = coords.par_iter().map(|p| match interpolation {
            Interpolation::Nearest => sample_nearest(&frame, p),
            Interpolation::Linear => sample_linear(&frame, p),
        }).collect();
        dst.assign(&Array3::from_shape_vec((nx, ny, nz), values)?);
    }
    Ok(out)
}

/// resamples a binary mask onto another grid with nearest neighbour lookup
pub fn resample_mask(mask: &Array3<bool>, source: &Grid, target: &Grid) -> Result<Array3<bool>> {
    let as_float = mask.mapv(|m| if m { 1f32 } else { 0. }).insert_axis(Axis(3));
    let resampled = resample_frames(&as_float, source, target, Interpolation::Nearest)?;
    Ok(resampled.index_axis(Axis(3), 0).mapv(|x| x > 0.5))
}
