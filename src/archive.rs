//! Append-only HDF5 archive of normalized voxel data.
//!
//! The archive holds three row-aligned streams:
//!
//! * `data`: voxel x measurement `f32` matrix, unlimited rows, fixed width
//! * `index`: the subject id of every row
//! * `masks`: the tissue label of every row
//!
//! Per-subject attributes on `data` record, in insertion order, the intensity scale and
//! least-squares coefficient used for each subject, its id, its name and the offset of its first
//! row. Root attributes record the reference subject and its intensity scale, so that a later run
//! appending to the same archive can check it calibrates against the same reference.
//!
//! Every append opens the file, extends the streams and closes the file again. Rows already
//! written are never modified. There is no locking: only one process may append at a time.

use crate::error::{Error, Result};
use crate::logging::PipelineLog;
use crate::normalize::Calibration;
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, File};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DATA: &str = "data";
pub const INDEX: &str = "index";
pub const MASKS: &str = "masks";

pub const ATTR_SCALE: &str = "scale";
pub const ATTR_COEFFICIENT: &str = "coefficient";
pub const ATTR_SUBJECT_IDS: &str = "subject_ids";
pub const ATTR_OFFSETS: &str = "offsets";
pub const ATTR_SUBJECT_NAMES: &str = "subject_names";

pub const ATTR_REFERENCE_SUBJECT: &str = "reference_subject";
pub const ATTR_REFERENCE_SCALE: &str = "reference_scale";

/// relative tolerance when comparing a recomputed reference scale with the stored one
pub const REFERENCE_SCALE_TOLERANCE: f64 = 1e-9;

pub const DEFAULT_CHUNK_ROWS: usize = 1024;

/// Rows of one subject ready to be appended.
#[derive(Debug, Clone, Copy)]
pub struct SubjectRows<'a> {
    pub subject_id: i64,
    /// stable identity of the subject across runs
    pub subject_name: &'a str,
    pub data: ArrayView2<'a, f32>,
    pub calibration: Calibration,
    /// tissue labels, one per row. When absent the `masks` stream is left behind and must be
    /// completed with [Archive::append_masks].
    pub masks: Option<ArrayView1<'a, i32>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppendReceipt {
    pub subject_id: i64,
    /// position of the subject in the attribute arrays
    pub insertion: usize,
    /// first row of the subject in every stream
    pub offset: usize,
    pub rows: usize,
}

/// Attribute entry of one appended subject.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectEntry {
    pub subject_id: i64,
    pub name: String,
    pub calibration: Calibration,
    pub offset: usize,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveSummary {
    pub data_rows: usize,
    pub width: usize,
    pub index_len: usize,
    pub masks_len: usize,
    pub entries: Vec<SubjectEntry>,
    pub reference: Option<ArchiveReference>,
}

/// The subject every archived subject was calibrated against.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveReference {
    pub name: String,
    pub scale: f64,
}

impl ArchiveSummary {
    pub fn insertion_index(&self, subject_id: i64) -> Option<usize> {
        self.entries.iter().position(|e| e.subject_id == subject_id)
    }

    pub fn entry(&self, subject_id: i64) -> Option<&SubjectEntry> {
        self.entries.iter().find(|e| e.subject_id == subject_id)
    }

    pub fn entry_by_name(&self, name: &str) -> Option<&SubjectEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// the largest archived subject id
    pub fn max_subject_id(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.subject_id).max()
    }

    pub fn offset_of(&self, subject_id: i64) -> Option<usize> {
        self.entry(subject_id).map(|e| e.offset)
    }

    /// true when all three streams have the same number of rows
    pub fn is_consistent(&self) -> bool {
        self.data_rows == self.index_len && self.data_rows == self.masks_len
    }
}

/// The rows of one subject read back from the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectData {
    pub data: Array2<f32>,
    pub index: Array1<i32>,
    pub masks: Array1<i32>,
}

#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    chunk_rows: usize,
}

impl Archive {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }

    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        assert!(chunk_rows > 0, "chunk rows must be positive");
        self.chunk_rows = chunk_rows;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// appends a subject's rows to `data`, `index` and (when labels are given) `masks`, and
    /// records its calibration and offset. The streams are created on the first append.
    pub fn append_subject(&self, rows: &SubjectRows, log: &PipelineLog) -> Result<AppendReceipt> {
        let (n_rows, width) = rows.data.dim();
        if let Some(masks) = rows.masks {
            if masks.len() != n_rows {
                return Err(Error::InconsistentArchive(format!("{} mask labels for {n_rows} data rows", masks.len())));
            }
        }
        let subject_index = i32::try_from(rows.subject_id)
            .map_err(|_| Error::InconsistentArchive(format!("subject id {} does not fit the index stream", rows.subject_id)))?;

        let file = File::append(&self.path)?;
        let streams = if file.link_exists(DATA) {
            Streams::open(&file)?
        } else {
            log.info(format_args!("event=archive_create path={} width={width} chunk_rows={}", self.path.display(), self.chunk_rows));
            Streams::create(&file, width, self.chunk_rows)?
        };

        let offset = streams.data_rows();
        let existing_width = streams.width();
        if existing_width != width {
            return Err(Error::WidthMismatch { expected: existing_width, found: width });
        }
        let index_len = streams.index.size();
        if index_len != offset {
            return Err(Error::InconsistentArchive(format!("index has {index_len} rows, data has {offset}")));
        }
        let masks_len = streams.masks.size();
        if rows.masks.is_some() && masks_len != offset {
            return Err(Error::InconsistentArchive(format!("masks has {masks_len} rows, data has {offset}")));
        }
        let ids = read_attr::<i64>(&streams.data, ATTR_SUBJECT_IDS)?;
        if ids.contains(&rows.subject_id) {
            return Err(Error::DuplicateSubject(rows.subject_id));
        }
        if read_names(&streams.data)?.iter().any(|n| n == rows.subject_name) {
            return Err(Error::DuplicateSubjectName(rows.subject_name.to_string()));
        }
        let name = to_var_len_unicode(rows.subject_name)?;

        let end = offset + n_rows;
        if n_rows > 0 {
            streams.data.resize((end, width))?;
            let block = rows.data.as_standard_layout();
            streams.data.write_slice(block.view(), s![offset..end, ..])?;

            append_rows(&streams.index, offset, &vec![subject_index; n_rows])?;
            if let Some(masks) = rows.masks {
                append_rows(&streams.masks, offset, &masks.to_vec())?;
            }
        }

        push_attr(&streams.data, ATTR_SCALE, rows.calibration.scale)?;
        push_attr(&streams.data, ATTR_COEFFICIENT, rows.calibration.coefficient)?;
        push_attr(&streams.data, ATTR_SUBJECT_IDS, rows.subject_id)?;
        push_attr(&streams.data, ATTR_OFFSETS, offset as u64)?;
        push_attr(&streams.data, ATTR_SUBJECT_NAMES, name)?;

        log.info(format_args!(
            "event=archive_append subject={} subject_id={} rows={n_rows} offset={offset} total_rows={end} scale={} coefficient={}",
            rows.subject_name, rows.subject_id, rows.calibration.scale, rows.calibration.coefficient
        ));
        Ok(AppendReceipt { subject_id: rows.subject_id, insertion: ids.len(), offset, rows: n_rows })
    }

    /// fills in the tissue labels of a subject appended without them. The `masks` stream must
    /// currently end exactly where the subject's rows begin.
    pub fn append_masks(&self, subject_id: i64, labels: ArrayView1<i32>, log: &PipelineLog) -> Result<()> {
        let file = File::append(&self.path)?;
        if !file.link_exists(DATA) {
            return Err(Error::UnknownSubject(subject_id));
        }
        let streams = Streams::open(&file)?;
        let summary = streams.summary()?;
        let entry = summary.entry(subject_id).ok_or(Error::UnknownSubject(subject_id))?;
        if labels.len() != entry.rows {
            return Err(Error::InconsistentArchive(format!(
                "{} mask labels for subject {subject_id} with {} rows", labels.len(), entry.rows
            )));
        }
        if summary.masks_len != entry.offset {
            return Err(Error::InconsistentArchive(format!(
                "masks has {} rows but subject {subject_id} starts at row {}", summary.masks_len, entry.offset
            )));
        }
        append_rows(&streams.masks, entry.offset, &labels.to_vec())?;
        log.info(format_args!("event=archive_masks subject_id={subject_id} rows={} offset={}", entry.rows, entry.offset));
        Ok(())
    }

    /// stream lengths, per-subject attributes and the recorded reference. A missing archive has
    /// an empty summary.
    pub fn summary(&self) -> Result<ArchiveSummary> {
        if !self.exists() {
            return Ok(ArchiveSummary::default());
        }
        let file = File::open(&self.path)?;
        let reference = read_reference(&file)?;
        if !file.link_exists(DATA) {
            return Ok(ArchiveSummary { reference, ..Default::default() });
        }
        let summary = Streams::open(&file)?.summary()?;
        Ok(ArchiveSummary { reference, ..summary })
    }

    /// records the reference subject and its scale, or checks them against the ones already
    /// recorded. A different reference name, or a scale differing by more than
    /// [REFERENCE_SCALE_TOLERANCE] (relative), is an error and leaves the archive untouched.
    pub fn record_reference(&self, name: &str, scale: f64, log: &PipelineLog) -> Result<()> {
        let file = File::append(&self.path)?;
        match read_reference(&file)? {
            Some(stored) => {
                if stored.name != name {
                    return Err(Error::InconsistentArchive(format!(
                        "archive was calibrated against `{}`, this run uses `{name}`", stored.name
                    )));
                }
                if (stored.scale - scale).abs() > REFERENCE_SCALE_TOLERANCE * stored.scale.abs() {
                    return Err(Error::InconsistentArchive(format!(
                        "reference `{name}` scale is {scale}, archive recorded {}", stored.scale
                    )));
                }
                log.debug(format_args!("event=archive_reference_checked subject={name} scale={scale}"));
            }
            None => {
                file.new_attr::<VarLenUnicode>()
                    .create(ATTR_REFERENCE_SUBJECT)?
                    .write_scalar(&to_var_len_unicode(name)?)?;
                file.new_attr::<f64>()
                    .create(ATTR_REFERENCE_SCALE)?
                    .write_scalar(&scale)?;
                log.info(format_args!("event=archive_reference subject={name} scale={scale}"));
            }
        }
        Ok(())
    }

    pub fn read_subject(&self, subject_id: i64) -> Result<SubjectData> {
        let file = File::open(&self.path)?;
        let streams = Streams::open(&file)?;
        let summary = streams.summary()?;
        let entry = summary.entry(subject_id).ok_or(Error::UnknownSubject(subject_id))?;
        let (start, end) = (entry.offset, entry.offset + entry.rows);
        if entry.rows == 0 {
            return Ok(SubjectData {
                data: Array2::zeros((0, summary.width)),
                index: Array1::zeros(0),
                masks: Array1::zeros(0),
            });
        }
        let data = streams.data.read_slice_2d::<f32, _>(s![start..end, ..])?;
        let index = streams.index.read_slice_1d::<i32, _>(s![start..end])?;
        let masks = if summary.masks_len >= end {
            streams.masks.read_slice_1d::<i32, _>(s![start..end])?
        } else {
            Array1::zeros(0)
        };
        Ok(SubjectData { data, index, masks })
    }
}

struct Streams {
    data: Dataset,
    index: Dataset,
    masks: Dataset,
}

impl Streams {
    fn create(file: &File, width: usize, chunk_rows: usize) -> Result<Self> {
        let data = file.new_dataset::<f32>()
            .shape((0.., width))
            .chunk((chunk_rows, width.max(1)))
            .create(DATA)?;
        let index = create_stream::<i32>(file, INDEX, chunk_rows)?;
        let masks = create_stream::<i32>(file, MASKS, chunk_rows)?;
        Ok(Self { data, index, masks })
    }

    fn open(file: &File) -> Result<Self> {
        Ok(Self {
            data: file.dataset(DATA)?,
            index: file.dataset(INDEX)?,
            masks: file.dataset(MASKS)?,
        })
    }

    fn data_rows(&self) -> usize {
        self.data.shape().first().copied().unwrap_or(0)
    }

    fn width(&self) -> usize {
        self.data.shape().get(1).copied().unwrap_or(0)
    }

    fn summary(&self) -> Result<ArchiveSummary> {
        let data_rows = self.data_rows();
        let scale = read_attr::<f64>(&self.data, ATTR_SCALE)?;
        let coefficient = read_attr::<f64>(&self.data, ATTR_COEFFICIENT)?;
        let ids = read_attr::<i64>(&self.data, ATTR_SUBJECT_IDS)?;
        let offsets = read_attr::<u64>(&self.data, ATTR_OFFSETS)?;
        let names = read_names(&self.data)?;
        let n = ids.len();
        if scale.len() != n || coefficient.len() != n || offsets.len() != n || names.len() != n {
            return Err(Error::InconsistentArchive("attribute arrays differ in length".to_string()));
        }
        let entries = (0..n).map(|i| {
            let offset = offsets[i] as usize;
            let next = offsets.get(i + 1).map(|&o| o as usize).unwrap_or(data_rows);
            SubjectEntry {
                subject_id: ids[i],
                name: names[i].clone(),
                calibration: Calibration { scale: scale[i], coefficient: coefficient[i] },
                offset,
                rows: next.saturating_sub(offset),
            }
        }).collect();
        Ok(ArchiveSummary {
            data_rows,
            width: self.width(),
            index_len: self.index.size(),
            masks_len: self.masks.size(),
            entries,
            reference: None,
        })
    }
}

fn create_stream<T: H5Type>(file: &File, name: &str, chunk_rows: usize) -> Result<Dataset> {
    Ok(file.new_dataset::<T>()
        .shape((0..,))
        .chunk((chunk_rows,))
        .create(name)?)
}

fn append_rows<T: H5Type>(dataset: &Dataset, offset: usize, values: &[T]) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    let end = offset + values.len();
    dataset.resize((end,))?;
    dataset.write_slice(ArrayView1::from(values), s![offset..end])?;
    Ok(())
}

fn read_attr<T: H5Type>(dataset: &Dataset, name: &str) -> Result<Vec<T>> {
    if !dataset.attr_names()?.iter().any(|n| n == name) {
        return Ok(vec![]);
    }
    Ok(dataset.attr(name)?.read_raw::<T>()?)
}

fn read_names(dataset: &Dataset) -> Result<Vec<String>> {
    Ok(read_attr::<VarLenUnicode>(dataset, ATTR_SUBJECT_NAMES)?
        .iter()
        .map(|n| n.as_str().to_string())
        .collect())
}

fn read_reference(file: &File) -> Result<Option<ArchiveReference>> {
    let attrs = file.attr_names()?;
    if !attrs.iter().any(|n| n == ATTR_REFERENCE_SUBJECT) || !attrs.iter().any(|n| n == ATTR_REFERENCE_SCALE) {
        return Ok(None);
    }
    let name: VarLenUnicode = file.attr(ATTR_REFERENCE_SUBJECT)?.read_scalar()?;
    let scale: f64 = file.attr(ATTR_REFERENCE_SCALE)?.read_scalar()?;
    Ok(Some(ArchiveReference { name: name.as_str().to_string(), scale }))
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InconsistentArchive(format!("subject name `{value}` cannot be stored: {e}")))
}

/// HDF5 attributes cannot grow, so the array is read, deleted and written back one longer
fn push_attr<T: H5Type + Clone>(dataset: &Dataset, name: &str, value: T) -> Result<()> {
    let mut values = read_attr::<T>(dataset, name)?;
    if !values.is_empty() {
        dataset.delete_attr(name)?;
    }
    values.push(value);
    dataset.new_attr::<T>()
        .shape(values.len())
        .create(name)?
        .write_raw(values.as_slice())?;
    Ok(())
}
