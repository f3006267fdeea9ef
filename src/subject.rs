//! Subject records and their enumeration from a data directory.
//!
//! A [Subject] is filled in stage by stage: enumeration sets the identity and input files,
//! mask generation sets [DerivedMasks], and normalization sets the [Calibration]. Fields a
//! stage has not produced yet are `None`.

use crate::error::{Error, Result};
use crate::logging::PipelineLog;
use crate::normalize::Calibration;
use crate::scheme::Scheme;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// File names expected inside each subject directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubjectLayout {
    pub diffusion: String,
    pub structural: String,
    pub brain_mask: String,
    pub tissue: String,
    pub scheme: String,
    /// FSL gradient files the scheme is generated from when the scheme file is missing
    pub bvals: String,
    pub bvecs: String,
}

impl Default for SubjectLayout {
    fn default() -> Self {
        Self {
            diffusion: "dwi.nii.gz".to_string(),
            structural: "T1w.nii.gz".to_string(),
            brain_mask: "brain_mask.nii.gz".to_string(),
            tissue: "5tt.nii.gz".to_string(),
            scheme: "scheme.txt".to_string(),
            bvals: "bvals".to_string(),
            bvecs: "bvecs".to_string(),
        }
    }
}

/// Inputs resolved at enumeration time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectFiles {
    pub root: PathBuf,
    pub diffusion: PathBuf,
    pub structural: Option<PathBuf>,
    pub scheme: PathBuf,
    /// where the brain mask lives or will be generated
    pub brain_mask_target: PathBuf,
    /// where the tissue probability volume lives or will be generated
    pub tissue_target: PathBuf,
}

/// Masks known to exist on disk, either found at enumeration or generated later.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DerivedMasks {
    pub brain_mask: Option<PathBuf>,
    pub tissue: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subject {
    pub name: String,
    pub id: u32,
    pub dataset: String,
    pub files: SubjectFiles,
    #[serde(default)]
    pub masks: DerivedMasks,
    #[serde(default)]
    pub calibration: Option<Calibration>,
}

impl Subject {
    /// builds a record for a subject directory using the given layout. Masks that already
    /// exist are recorded as derived.
    pub fn from_dir(root: impl AsRef<Path>, id: u32, dataset: &str, layout: &SubjectLayout) -> Self {
        let root = root.as_ref().to_path_buf();
        let name = root.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let structural = root.join(&layout.structural);
        let brain_mask_target = root.join(&layout.brain_mask);
        let tissue_target = root.join(&layout.tissue);
        let masks = DerivedMasks {
            brain_mask: brain_mask_target.is_file().then(|| brain_mask_target.clone()),
            tissue: tissue_target.is_file().then(|| tissue_target.clone()),
        };
        Self {
            name,
            id,
            dataset: dataset.to_string(),
            files: SubjectFiles {
                diffusion: root.join(&layout.diffusion),
                structural: structural.is_file().then_some(structural),
                scheme: root.join(&layout.scheme),
                brain_mask_target,
                tissue_target,
                root,
            },
            masks,
            calibration: None,
        }
    }

    /// the calibration, or the identity calibration when normalization has not run yet
    pub fn calibration_or_default(&self) -> Calibration {
        self.calibration.unwrap_or_default()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn missing(&self, what: &str) -> Error {
        Error::MissingInput { subject: self.name.clone(), what: what.to_string() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubjectRegistry {
    subjects: Vec<Subject>,
}

impl SubjectRegistry {
    pub fn from_subjects(subjects: Vec<Subject>) -> Self {
        Self { subjects }
    }

    /// enumerates subject directories matching `pattern` under `root`. The dataset tag is the
    /// name of the parent directory. Ids follow sorted path order. A missing scheme file is
    /// generated from the FSL `bvals`/`bvecs` pair when present. Directories lacking a diffusion
    /// scan or any gradient information, or named in `exclude`, are skipped.
    pub fn discover(root: impl AsRef<Path>, pattern: &str, layout: &SubjectLayout, exclude: &[String], log: &PipelineLog) -> Result<Self> {
        let full_pattern = root.as_ref().join(pattern);
        let mut dirs = glob::glob(&full_pattern.display().to_string())?
            .collect::<std::result::Result<Vec<PathBuf>, glob::GlobError>>()?
            .into_iter()
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();
        dirs.sort();

        let mut subjects = vec![];
        for dir in dirs {
            let name = dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if exclude.contains(&name) {
                log.info(format_args!("event=subject_excluded subject={name}"));
                continue;
            }
            if !dir.join(&layout.diffusion).is_file() || !ensure_scheme(&dir, layout, log) {
                log.warn(format_args!("event=subject_incomplete dir={}", dir.display()));
                continue;
            }
            let dataset = dir.parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let id = subjects.len() as u32;
            subjects.push(Subject::from_dir(&dir, id, &dataset, layout));
        }
        log.info(format_args!("event=registry_built subjects={} pattern={}", subjects.len(), full_pattern.display()));
        Ok(Self { subjects })
    }

    pub fn load_manifest(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save_manifest(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subject> {
        self.subjects.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Subject> {
        self.subjects.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Subject> {
        self.subjects.get_mut(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.name == name)
    }

    pub fn by_id(&self, id: u32) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == id)
    }

    /// renumbers subjects: those listed in `known` (name, id) take that id, the rest get fresh
    /// ids above every known id in enumeration order
    pub fn reassign_ids(&mut self, known: &[(String, u32)]) {
        let mut next = known.iter().map(|(_, id)| id + 1).max().unwrap_or(0);
        for subject in self.subjects.iter_mut() {
            match known.iter().find(|(name, _)| *name == subject.name) {
                Some((_, id)) => subject.id = *id,
                None => {
                    subject.id = next;
                    next += 1;
                }
            }
        }
    }

    /// position of the reference subject: the named one, or the first enumerated
    pub fn reference_index(&self, name: Option<&str>) -> Result<usize> {
        match name {
            Some(name) => self.subjects.iter().position(|s| s.name == name)
                .ok_or_else(|| Error::MissingInput { subject: name.to_string(), what: "reference subject not found in registry".to_string() }),
            None if self.subjects.is_empty() => Err(Error::MissingInput { subject: String::new(), what: "no subjects enumerated".to_string() }),
            None => Ok(0),
        }
    }
}

/// makes sure a subject directory has a scheme file, writing one from `bvals`/`bvecs` when
/// needed. false when neither exists or the FSL files cannot be read.
fn ensure_scheme(dir: &Path, layout: &SubjectLayout, log: &PipelineLog) -> bool {
    let scheme = dir.join(&layout.scheme);
    if scheme.is_file() {
        return true;
    }
    let (bvals, bvecs) = (dir.join(&layout.bvals), dir.join(&layout.bvecs));
    if !bvals.is_file() || !bvecs.is_file() {
        return false;
    }
    match Scheme::from_fsl(&bvals, &bvecs).and_then(|s| s.write_text(&scheme)) {
        Ok(()) => {
            log.info(format_args!("event=scheme_generated dir={} from=fsl", dir.display()));
            true
        }
        Err(e) => {
            log.warn(format_args!("event=scheme_generation_failed dir={} error={e}", dir.display()));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn make_subject(root: &Path, dataset: &str, name: &str, with_mask: bool) {
        let layout = SubjectLayout::default();
        let dir = root.join(dataset).join(name);
        touch(&dir.join(&layout.diffusion));
        touch(&dir.join(&layout.scheme));
        if with_mask {
            touch(&dir.join(&layout.brain_mask));
        }
    }

    #[test]
    fn discovers_sorted_subjects_with_dataset_tags() {
        let dir = tempfile::tempdir().unwrap();
        make_subject(dir.path(), "hcp", "200", false);
        make_subject(dir.path(), "hcp", "100", true);
        make_subject(dir.path(), "mgh", "007", false);
        std::fs::create_dir_all(dir.path().join("hcp").join("empty")).unwrap();

        let reg = SubjectRegistry::discover(dir.path(), "*/*", &SubjectLayout::default(), &[], &PipelineLog::silent()).unwrap();
        let names = reg.iter().map(|s| (s.dataset.as_str(), s.name.as_str(), s.id)).collect::<Vec<_>>();
        assert_eq!(names, vec![("hcp", "100", 0), ("hcp", "200", 1), ("mgh", "007", 2)]);

        let first = reg.get(0).unwrap();
        assert!(first.masks.brain_mask.is_some());
        assert!(first.masks.tissue.is_none());
        assert!(first.files.structural.is_none());
        assert!(reg.get(1).unwrap().masks.brain_mask.is_none());
        assert!(!first.is_calibrated());
        assert_eq!(first.calibration_or_default(), Calibration::default());
    }

    #[test]
    fn excluded_subjects_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        make_subject(dir.path(), "hcp", "100", false);
        make_subject(dir.path(), "hcp", "200", false);
        let reg = SubjectRegistry::discover(dir.path(), "*/*", &SubjectLayout::default(), &["100".to_string()], &PipelineLog::silent()).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(0).unwrap().name, "200");
        assert_eq!(reg.get(0).unwrap().id, 0);
    }

    #[test]
    fn missing_scheme_is_generated_from_fsl_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SubjectLayout::default();
        let subject_dir = dir.path().join("hcp").join("100");
        touch(&subject_dir.join(&layout.diffusion));
        std::fs::write(subject_dir.join(&layout.bvals), "0 1000 2000\n").unwrap();
        std::fs::write(subject_dir.join(&layout.bvecs), "0 1 0\n0 0 1\n0 0 0\n").unwrap();
        // no gradient information at all
        touch(&dir.path().join("hcp").join("200").join(&layout.diffusion));

        let reg = SubjectRegistry::discover(dir.path(), "*/*", &layout, &[], &PipelineLog::silent()).unwrap();
        assert_eq!(reg.len(), 1);
        let subject = reg.get(0).unwrap();
        assert_eq!(subject.name, "100");
        assert!(subject.files.scheme.is_file());

        let scheme = Scheme::read_text(&subject.files.scheme).unwrap();
        assert_eq!(scheme.strengths().to_vec(), vec![0., 1000., 2000.]);
        assert_eq!(scheme.directions().row(1).to_vec(), vec![1., 0., 0.]);
        assert_eq!(scheme.directions().row(2).to_vec(), vec![0., 1., 0.]);
    }

    #[test]
    fn reassigned_ids_keep_known_subjects_stable() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["s0", "s1", "s2", "s3"] {
            make_subject(dir.path(), "hcp", name, false);
        }
        let mut reg = SubjectRegistry::discover(dir.path(), "*/*", &SubjectLayout::default(), &[], &PipelineLog::silent()).unwrap();
        reg.reassign_ids(&[("s1".to_string(), 0), ("s2".to_string(), 1)]);
        let ids = reg.iter().map(|s| (s.name.as_str(), s.id)).collect::<Vec<_>>();
        assert_eq!(ids, vec![("s0", 2), ("s1", 0), ("s2", 1), ("s3", 3)]);

        reg.reassign_ids(&[]);
        assert_eq!(reg.iter().map(|s| s.id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn reference_defaults_to_first_subject() {
        let dir = tempfile::tempdir().unwrap();
        make_subject(dir.path(), "hcp", "100", false);
        make_subject(dir.path(), "hcp", "200", false);
        let reg = SubjectRegistry::discover(dir.path(), "*/*", &SubjectLayout::default(), &[], &PipelineLog::silent()).unwrap();
        assert_eq!(reg.reference_index(None).unwrap(), 0);
        assert_eq!(reg.reference_index(Some("200")).unwrap(), 1);
        assert!(reg.reference_index(Some("300")).is_err());
        assert!(SubjectRegistry::default().reference_index(None).is_err());
    }

    #[test]
    fn manifest_round_trip_keeps_calibration() {
        let dir = tempfile::tempdir().unwrap();
        make_subject(dir.path(), "hcp", "100", true);
        let mut reg = SubjectRegistry::discover(dir.path(), "*/*", &SubjectLayout::default(), &[], &PipelineLog::silent()).unwrap();
        reg.get_mut(0).unwrap().calibration = Some(Calibration { scale: 812.5, coefficient: 0.97 });

        let manifest = dir.path().join("subjects.json");
        reg.save_manifest(&manifest).unwrap();
        let loaded = SubjectRegistry::load_manifest(&manifest).unwrap();
        assert_eq!(loaded, reg);
        assert_eq!(loaded.by_name("100").unwrap().calibration.unwrap().coefficient, 0.97);
    }
}
