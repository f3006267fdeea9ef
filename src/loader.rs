//! Loading a subject's diffusion scan as a voxel x measurement matrix.

use crate::error::{Error, Result};
use crate::external::BrainExtractor;
use crate::logging::PipelineLog;
use crate::resample::resample_mask;
use crate::subject::Subject;
use crate::volume::{read_mask, read_volume, Grid};
use ndarray::{Array2, Array3, Array4, Axis};
use rayon::prelude::*;
use std::path::PathBuf;

/// A scan restricted to the voxels of its brain mask.
#[derive(Debug, Clone)]
pub struct MaskedScan {
    /// voxel x measurement
    pub matrix: Array2<f32>,
    /// the mask on the scan grid that selected the rows of `matrix`
    pub mask: Array3<bool>,
    pub grid: Grid,
}

impl MaskedScan {
    pub fn n_voxels(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_measurements(&self) -> usize {
        self.matrix.ncols()
    }
}

/// coordinates of the mask voxels in C order (first axis slowest)
pub fn mask_voxels(mask: &Array3<bool>) -> Vec<[usize; 3]> {
    mask.indexed_iter().filter(|(_, &m)| m).map(|((i, j, k), _)| [i, j, k]).collect()
}

/// extracts the masked voxels of a 4-D volume. Row `v` of the result is the time series of the
/// `v`-th mask voxel in C order.
pub fn apply_mask(volume: &Array4<f32>, mask: &Array3<bool>) -> Result<Array2<f32>> {
    let (nx, ny, nz, nq) = volume.dim();
    if mask.dim() != (nx, ny, nz) {
        return Err(Error::Grid(format!("mask shape {:?} does not match volume shape {:?}", mask.dim(), (nx, ny, nz))));
    }
    let voxels = mask_voxels(mask);
    let mut matrix = Array2::<f32>::zeros((voxels.len(), nq));
    matrix.axis_iter_mut(Axis(0)).into_par_iter().zip(voxels.par_iter()).for_each(|(mut row, &[i, j, k])| {
        row.iter_mut().enumerate().for_each(|(q, x)| *x = volume[[i, j, k, q]]);
    });
    Ok(matrix)
}

/// returns the brain mask path of a subject, running the extractor when no mask exists yet
pub fn ensure_brain_mask(subject: &mut Subject, extractor: &dyn BrainExtractor, log: &PipelineLog) -> Result<PathBuf> {
    if let Some(mask) = &subject.masks.brain_mask {
        if mask.is_file() {
            return Ok(mask.clone());
        }
    }
    let target = subject.files.brain_mask_target.clone();
    log.info(format_args!("event=brain_mask_generate subject={} output={}", subject.name, target.display()));
    extractor.extract(&subject.files.diffusion, &subject.files.scheme, &target, log)?;
    if !target.is_file() {
        return Err(subject.missing("brain extraction finished without writing a mask"));
    }
    subject.masks.brain_mask = Some(target.clone());
    Ok(target)
}

/// loads a subject's diffusion scan and applies its brain mask. A mask sampled on a different
/// grid than the scan is resampled onto the scan grid first.
pub fn load_scan(subject: &mut Subject, extractor: &dyn BrainExtractor, log: &PipelineLog) -> Result<MaskedScan> {
    let mask_path = ensure_brain_mask(subject, extractor, log)?;
    let (volume, grid) = read_volume(&subject.files.diffusion)?.into_4d()?;
    let (mut mask, mask_grid) = read_mask(&mask_path)?;
    if !mask_grid.is_aligned(&grid) {
        log.warn(format_args!("event=grid_mismatch subject={} input=brain_mask action=resample", subject.name));
        mask = resample_mask(&mask, &mask_grid, &grid)?;
    }
    let matrix = apply_mask(&volume, &mask)?;
    log.info(format_args!(
        "event=scan_loaded subject={} voxels={} measurements={}", subject.name, matrix.nrows(), matrix.ncols()
    ));
    Ok(MaskedScan { matrix, mask, grid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_rows_follow_c_order() {
        let volume = Array4::from_shape_fn((2, 2, 2, 3), |(i, j, k, q)| (100 * i + 10 * j + k + 1000 * q) as f32);
        let mut mask = Array3::from_elem((2, 2, 2), false);
        mask[[1, 0, 1]] = true;
        mask[[0, 1, 0]] = true;
        let m = apply_mask(&volume, &mask).unwrap();
        assert_eq!(m.dim(), (2, 3));
        assert_eq!(m.row(0).to_vec(), vec![10., 1010., 2010.]);
        assert_eq!(m.row(1).to_vec(), vec![101., 1101., 2101.]);
    }

    #[test]
    fn mask_shape_must_match() {
        let volume = Array4::<f32>::zeros((2, 2, 2, 3));
        let mask = Array3::from_elem((2, 2, 3), true);
        assert!(matches!(apply_mask(&volume, &mask), Err(Error::Grid(_))));
    }

    #[test]
    fn empty_mask_gives_empty_matrix() {
        let volume = Array4::<f32>::zeros((2, 2, 2, 3));
        let mask = Array3::from_elem((2, 2, 2), false);
        assert_eq!(apply_mask(&volume, &mask).unwrap().dim(), (0, 3));
    }
}
