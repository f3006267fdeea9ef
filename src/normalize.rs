//! Cross-subject intensity calibration.
//!
//! One subject acts as the reference. Its 95th percentile intensity becomes the global scale,
//! and the per-voxel median of its non-diffusion-weighted measurements becomes the target every
//! other subject is regressed onto. Each subject is then rescaled as
//! `matrix * coefficient / scale`.

use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PERCENTILE: f64 = 95.;

/// The scalars used to normalize one subject.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub scale: f64,
    pub coefficient: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self { scale: 1., coefficient: 1. }
    }
}

/// q-th percentile (0..=100) with linear interpolation between the two closest ranks
pub fn percentile(values: &[f32], q: f64) -> Result<f64> {
    if !(0. ..=100.).contains(&q) {
        return Err(Error::numeric(format!("percentile {q} is outside [0, 100]")));
    }
    if values.is_empty() {
        return Err(Error::numeric("percentile of an empty set"));
    }
    let mut sorted = values.to_vec();
    sorted.par_sort_unstable_by(|a, b| a.total_cmp(b));
    let rank = q / 100. * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Ok(sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac)
}

fn median(values: &mut [f32]) -> f64 {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2] as f64
    } else {
        0.5 * (values[n / 2 - 1] as f64 + values[n / 2] as f64)
    }
}

/// per-voxel (row) median over the measurement columns flagged in `zero_mask`
pub fn zero_gradient_median(matrix: ArrayView2<f32>, zero_mask: &[bool]) -> Result<Array1<f64>> {
    if zero_mask.len() != matrix.ncols() {
        return Err(Error::numeric(format!("zero gradient mask has {} entries for {} measurements", zero_mask.len(), matrix.ncols())));
    }
    let columns = zero_mask.iter().enumerate().filter(|(_, &z)| z).map(|(i, _)| i).collect::<Vec<_>>();
    if columns.is_empty() {
        return Err(Error::numeric("scheme has no zero gradient measurements"));
    }
    let medians = (0..matrix.nrows()).into_par_iter().map(|r| {
        let row = matrix.row(r);
        let mut values = columns.iter().map(|&c| row[c]).collect::<Vec<f32>>();
        median(&mut values)
    }).collect::<Vec<f64>>();
    Ok(Array1::from(medians))
}

/// scalar `c` minimizing `||x * c - y||` (no intercept)
pub fn least_squares_coefficient(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<f64> {
    if x.len() != y.len() {
        return Err(Error::numeric(format!("cannot regress {} values onto {}", x.len(), y.len())));
    }
    let xx = x.dot(&x);
    if xx == 0. || !xx.is_finite() {
        return Err(Error::numeric("regressor is zero or non-finite"));
    }
    Ok(x.dot(&y) / xx)
}

/// The reference subject's calibration targets.
#[derive(Debug, Clone)]
pub struct Reference {
    pub scale: f64,
    pub median: Array1<f64>,
    zero_mask: Vec<bool>,
}

impl Reference {
    /// computes the reference targets from the reference subject's voxel x measurement matrix
    pub fn from_matrix(matrix: ArrayView2<f32>, zero_mask: &[bool], q: f64) -> Result<Self> {
        let scale = match matrix.as_slice_memory_order() {
            Some(values) => percentile(values, q)?,
            None => percentile(&matrix.iter().copied().collect::<Vec<f32>>(), q)?,
        };
        if scale <= 0. || !scale.is_finite() {
            return Err(Error::numeric(format!("reference intensity scale is {scale}")));
        }
        let median = zero_gradient_median(matrix, zero_mask)?;
        Ok(Self { scale, median, zero_mask: zero_mask.to_vec() })
    }

    /// the reference subject's own calibration, coefficient exactly 1
    pub fn calibration(&self) -> Calibration {
        Calibration { scale: self.scale, coefficient: 1. }
    }

    /// regresses a subject's zero gradient medians onto the reference medians
    pub fn calibrate(&self, matrix: ArrayView2<f32>) -> Result<Calibration> {
        let median = zero_gradient_median(matrix, &self.zero_mask)?;
        if median.len() != self.median.len() {
            return Err(Error::numeric(format!(
                "subject has {} voxels but the reference has {}", median.len(), self.median.len()
            )));
        }
        let coefficient = least_squares_coefficient(median.view(), self.median.view())?;
        Ok(Calibration { scale: self.scale, coefficient })
    }
}

/// applies `matrix * coefficient / scale` and returns single precision values
pub fn rescale(matrix: ArrayView2<f32>, calibration: &Calibration) -> Result<Array2<f32>> {
    if calibration.scale == 0. || !calibration.scale.is_finite() {
        return Err(Error::numeric(format!("invalid intensity scale {}", calibration.scale)));
    }
    let factor = calibration.coefficient / calibration.scale;
    let mut out = matrix.to_owned();
    out.axis_iter_mut(Axis(0)).into_par_iter().for_each(|mut row| {
        row.mapv_inplace(|x| (x as f64 * factor) as f32);
    });
    Ok(out)
}
