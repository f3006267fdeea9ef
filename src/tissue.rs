//! Categorical tissue labels from tissue probability volumes.
//!
//! Segmentation tools produce either three channels (grey matter, white matter, CSF) or five
//! (cortical grey matter, sub-cortical grey matter, white matter, CSF, pathological tissue).
//! Each brain voxel is assigned its most probable class, the grey matter channels are merged,
//! and the result is encoded as one integer label per voxel.

use crate::error::{Error, Result};
use crate::external::TissueSegmenter;
use crate::loader::apply_mask;
use crate::logging::PipelineLog;
use crate::resample::{resample_frames, Interpolation};
use crate::subject::Subject;
use crate::volume::{read_volume, Grid};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;
use std::path::PathBuf;

/// label of voxels whose most probable class has no counterpart in the three class encoding
pub const UNCLASSIFIED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TissueClass {
    Grey = 0,
    White = 1,
    Csf = 2,
}

impl TissueClass {
    pub fn from_label(label: i32) -> Option<Self> {
        match label {
            0 => Some(Self::Grey),
            1 => Some(Self::White),
            2 => Some(Self::Csf),
            _ => None,
        }
    }
}

/// one-hot encodes the arg-max of each row. Ties resolve to the first class.
pub fn one_hot_argmax(probabilities: ArrayView2<f32>) -> Array2<u8> {
    let mut one_hot = Array2::<u8>::zeros(probabilities.dim());
    if probabilities.ncols() == 0 {
        return one_hot;
    }
    one_hot.axis_iter_mut(Axis(0)).into_par_iter().enumerate().for_each(|(v, mut row)| {
        let probs = probabilities.row(v);
        let best = probs.iter().enumerate().fold(0, |best, (c, &p)| if p > probs[best] { c } else { best });
        row[best] = 1;
    });
    one_hot
}

/// reduces a one-hot matrix to grey matter, white matter and CSF columns. Five class input has
/// its two grey matter columns merged and the pathological column dropped.
pub fn collapse_classes(one_hot: ArrayView2<u8>) -> Result<Array2<u8>> {
    match one_hot.ncols() {
        3 => Ok(one_hot.to_owned()),
        5 => {
            let mut out = Array2::<u8>::zeros((one_hot.nrows(), 3));
            out.axis_iter_mut(Axis(0)).zip(one_hot.axis_iter(Axis(0))).for_each(|(mut dst, src)| {
                dst[0] = src[0] | src[1];
                dst[1] = src[2];
                dst[2] = src[3];
            });
            Ok(out)
        }
        n => Err(Error::Grid(format!("tissue volume has {n} classes, expected 3 or 5"))),
    }
}

/// additive encoding `1*gm + 2*wm + 3*csf - 1`: grey 0, white 1, csf 2
pub fn encode_labels(three_class: ArrayView2<u8>) -> Array1<i32> {
    three_class.axis_iter(Axis(0))
        .map(|row| row[0] as i32 + 2 * row[1] as i32 + 3 * row[2] as i32 - 1)
        .collect()
}

/// voxel x class probabilities to one label per voxel
pub fn labels_from_probabilities(probabilities: ArrayView2<f32>) -> Result<Array1<i32>> {
    let one_hot = one_hot_argmax(probabilities);
    let three = collapse_classes(one_hot.view())?;
    Ok(encode_labels(three.view()))
}

/// returns the tissue volume of a subject, running the segmenter when it does not exist yet
pub fn ensure_tissue_volume(subject: &mut Subject, segmenter: &dyn TissueSegmenter, log: &PipelineLog) -> Result<PathBuf> {
    if let Some(tissue) = &subject.masks.tissue {
        if tissue.is_file() {
            return Ok(tissue.clone());
        }
    }
    let structural = subject.files.structural.clone()
        .ok_or_else(|| subject.missing("structural scan required for tissue segmentation"))?;
    let brain_mask = subject.masks.brain_mask.clone()
        .ok_or_else(|| subject.missing("brain mask required for tissue segmentation"))?;
    let target = subject.files.tissue_target.clone();
    log.info(format_args!("event=tissue_generate subject={} output={}", subject.name, target.display()));
    segmenter.segment(&structural, &brain_mask, &target, log)?;
    if !target.is_file() {
        return Err(subject.missing("tissue segmentation finished without writing a volume"));
    }
    subject.masks.tissue = Some(target.clone());
    Ok(target)
}

/// builds one tissue label per voxel of `mask`, in the same row order as the scan matrix
/// extracted with that mask. Tissue volumes on another grid are resampled onto `grid`.
pub fn build_tissue_labels(
    subject: &mut Subject,
    segmenter: &dyn TissueSegmenter,
    mask: &Array3<bool>,
    grid: &Grid,
    log: &PipelineLog,
) -> Result<Array1<i32>> {
    let path = ensure_tissue_volume(subject, segmenter, log)?;
    let (mut tissue, tissue_grid) = read_volume(&path)?.into_4d()?;
    if !tissue_grid.is_aligned(grid) {
        log.warn(format_args!("event=grid_mismatch subject={} input=tissue action=resample", subject.name));
        tissue = resample_frames(&tissue, &tissue_grid, grid, Interpolation::Linear)?;
    }
    let probabilities = apply_mask(&tissue, mask)?;
    let labels = labels_from_probabilities(probabilities.view())?;
    let unclassified = labels.iter().filter(|&&l| l == UNCLASSIFIED).count();
    if unclassified > 0 {
        log.warn(format_args!("event=tissue_unclassified subject={} voxels={unclassified}", subject.name));
    }
    log.info(format_args!("event=tissue_labels subject={} voxels={}", subject.name, labels.len()));
    Ok(labels)
}
