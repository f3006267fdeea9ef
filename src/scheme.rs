//! Gradient schemes: reading, writing, validation and cross-subject aggregation.
//!
//! A scheme has one row per diffusion measurement. The first three columns hold the gradient
//! direction, the fourth the gradient strength (b-value), and any further columns auxiliary
//! acquisition parameters which are carried along untouched.

use crate::error::{Error, Result};
use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis, ShapeBuilder};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const STRENGTH_COLUMN: usize = 3;
pub const MIN_COLUMNS: usize = 4;

/// strengths are rounded to a multiple of this value when schemes are aggregated
pub const STRENGTH_ROUNDING: f64 = 1000.;

/// name of the dataset holding the scheme inside a scheme archive
pub const PARAMETERS_DATASET: &str = "parameters";

#[derive(Debug, Clone, PartialEq)]
pub struct Scheme {
    params: Array2<f64>,
}

/// The directions acquired at one non-zero gradient strength.
#[derive(Debug, Clone, PartialEq)]
pub struct Shell {
    pub strength: f64,
    pub indices: Vec<usize>,
    pub directions: Vec<[f64; 3]>,
}

impl Scheme {
    pub fn new(params: Array2<f64>) -> Result<Self> {
        if params.ncols() < MIN_COLUMNS {
            return Err(invalid(None, format!("expected at least {MIN_COLUMNS} columns, found {}", params.ncols())));
        }
        if params.iter().any(|x| !x.is_finite()) {
            return Err(invalid(None, "scheme contains non-finite values"));
        }
        Ok(Self { params })
    }

    /// parses whitespace or comma delimited text. Empty lines and lines starting with `#` are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rows: Vec<Vec<f64>> = vec![];
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = line.split(|c: char| c.is_ascii_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<f64>().map_err(|e| invalid(None, format!("line {}: {e}", line_no + 1))))
                .collect::<Result<Vec<f64>>>()?;
            if let Some(first) = rows.first() {
                if first.len() != row.len() {
                    return Err(invalid(None, format!("line {} has {} columns, expected {}", line_no + 1, row.len(), first.len())));
                }
            }
            rows.push(row);
        }
        if rows.is_empty() {
            return Err(invalid(None, "scheme is empty"));
        }
        let n_cols = rows[0].len();
        let flat = rows.into_iter().flatten().collect::<Vec<f64>>();
        Scheme::new(Array2::from_shape_vec((flat.len() / n_cols, n_cols), flat)?)
    }

    pub fn read_text(path: impl AsRef<Path>) -> Result<Self> {
        let mut s = String::new();
        File::open(path.as_ref())?.read_to_string(&mut s)?;
        Scheme::parse(&s).map_err(|e| with_path(e, path.as_ref()))
    }

    /// formats the scheme with fixed precision: six decimals for directions and auxiliary
    /// columns, one decimal for the strength
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for row in self.params.axis_iter(Axis(0)) {
            let fields = row.iter().enumerate().map(|(c, v)| {
                if c == STRENGTH_COLUMN { format!("{v:.1}") } else { format!("{v:.6}") }
            }).collect::<Vec<_>>();
            out.push_str(&fields.join(" "));
            out.push('\n');
        }
        out
    }

    pub fn write_text(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_text())?;
        Ok(())
    }

    /// builds a scheme from an FSL `bvals`/`bvecs` pair. bvecs hold three rows of n entries.
    pub fn from_fsl(bvals: impl AsRef<Path>, bvecs: impl AsRef<Path>) -> Result<Self> {
        let read_values = |p: &Path| -> Result<Vec<f64>> {
            let mut s = String::new();
            File::open(p)?.read_to_string(&mut s)?;
            s.split_ascii_whitespace()
                .map(|v| v.parse::<f64>().map_err(|e| invalid(Some(p.to_path_buf()), e.to_string())))
                .collect()
        };
        let b = read_values(bvals.as_ref())?;
        let v = read_values(bvecs.as_ref())?;
        let n = b.len();
        if v.len() != 3 * n {
            return Err(invalid(Some(bvecs.as_ref().to_path_buf()), format!("expected {} values for {n} b-values, found {}", 3 * n, v.len())));
        }
        let vecs = Array2::from_shape_vec((n, 3).f(), v)?;
        let mut params = Array2::<f64>::zeros((n, MIN_COLUMNS));
        params.slice_mut(s![.., 0..3]).assign(&vecs);
        params.column_mut(STRENGTH_COLUMN).iter_mut().zip(&b).for_each(|(dst, &b)| *dst = b);
        Scheme::new(params)
    }

    pub fn write_archive(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = hdf5::File::create(path)?;
        let ds = file.new_dataset::<f64>()
            .shape(self.params.dim())
            .create(PARAMETERS_DATASET)?;
        ds.write(&self.params)?;
        Ok(())
    }

    pub fn read_archive(path: impl AsRef<Path>) -> Result<Self> {
        let file = hdf5::File::open(path)?;
        let params = file.dataset(PARAMETERS_DATASET)?.read_2d::<f64>()?;
        Scheme::new(params)
    }

    pub fn params(&self) -> ArrayView2<f64> {
        self.params.view()
    }

    pub fn n_measurements(&self) -> usize {
        self.params.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.params.ncols()
    }

    pub fn directions(&self) -> ArrayView2<f64> {
        self.params.slice(s![.., 0..3])
    }

    pub fn strengths(&self) -> ArrayView1<f64> {
        self.params.column(STRENGTH_COLUMN)
    }

    /// flags the measurements acquired without diffusion weighting (strength == 0)
    pub fn zero_gradient_mask(&self) -> Vec<bool> {
        self.zero_gradient_mask_within(0.)
    }

    /// like [Scheme::zero_gradient_mask] but treats strengths up to `tolerance` as zero
    pub fn zero_gradient_mask_within(&self, tolerance: f64) -> Vec<bool> {
        assert!(tolerance >= 0., "strength tolerance must be non-negative");
        self.strengths().iter().map(|b| b.abs() <= tolerance).collect()
    }

    /// groups the non-zero strength measurements by their strength, in ascending order
    pub fn shells(&self) -> Vec<Shell> {
        let mut shells: Vec<Shell> = vec![];
        for (idx, row) in self.params.axis_iter(Axis(0)).enumerate() {
            let b = row[STRENGTH_COLUMN];
            if b == 0. {
                continue;
            }
            let dir = [row[0], row[1], row[2]];
            match shells.iter_mut().find(|s| s.strength == b) {
                Some(shell) => {
                    shell.indices.push(idx);
                    shell.directions.push(dir);
                }
                None => shells.push(Shell { strength: b, indices: vec![idx], directions: vec![dir] }),
            }
        }
        shells.sort_by(|a, b| a.strength.total_cmp(&b.strength));
        shells
    }

    /// checks that every direction is zero when its strength is zero and unit length otherwise
    pub fn validate(&self, tolerance: f64) -> Result<()> {
        for (idx, row) in self.params.axis_iter(Axis(0)).enumerate() {
            let norm = (row[0].powi(2) + row[1].powi(2) + row[2].powi(2)).sqrt();
            let b = row[STRENGTH_COLUMN];
            if b == 0. && norm > tolerance {
                return Err(invalid(None, format!("row {idx} has zero strength but direction norm {norm}")));
            }
            if b != 0. && (norm - 1.).abs() > tolerance {
                return Err(invalid(None, format!("row {idx} direction norm is {norm}, expected 1")));
            }
        }
        Ok(())
    }
}

/// combines co-registered per-subject schemes into one canonical scheme. Directions and
/// auxiliary columns are averaged across subjects, strengths are averaged and rounded to the
/// nearest multiple of 1000, non-zero strength directions are renormalized to unit length and
/// zero strength directions are zeroed.
pub fn aggregate(schemes: &[Scheme]) -> Result<Scheme> {
    let first = schemes.first().ok_or_else(|| invalid(None, "no schemes to aggregate"))?;
    let dim = first.params.dim();
    if let Some(bad) = schemes.iter().find(|s| s.params.dim() != dim) {
        return Err(invalid(None, format!("scheme shape {:?} differs from {:?}", bad.params.dim(), dim)));
    }

    let mut params = Array2::<f64>::zeros(dim);
    schemes.iter().for_each(|s| params += &s.params);
    params /= schemes.len() as f64;

    for mut row in params.axis_iter_mut(Axis(0)) {
        let b = (row[STRENGTH_COLUMN] / STRENGTH_ROUNDING).round_ties_even() * STRENGTH_ROUNDING;
        row[STRENGTH_COLUMN] = b;
        let norm = (row[0].powi(2) + row[1].powi(2) + row[2].powi(2)).sqrt();
        if b == 0. || norm == 0. {
            row.slice_mut(s![0..3]).fill(0.);
        } else {
            row.slice_mut(s![0..3]).mapv_inplace(|x| x / norm);
        }
    }

    Scheme::new(params)
}

/// reads and aggregates a set of scheme text files
pub fn aggregate_files<P: AsRef<Path>>(paths: &[P]) -> Result<Scheme> {
    let schemes = paths.iter().map(|p| Scheme::read_text(p)).collect::<Result<Vec<_>>>()?;
    aggregate(&schemes)
}

fn invalid(path: Option<PathBuf>, reason: impl Into<String>) -> Error {
    Error::InvalidScheme { path, reason: reason.into() }
}

fn with_path(err: Error, path: &Path) -> Error {
    match err {
        Error::InvalidScheme { path: None, reason } => Error::InvalidScheme { path: Some(path.to_path_buf()), reason },
        other => other,
    }
}
