use dmri_prep::archive::{Archive, INDEX};
use dmri_prep::config::PipelineConfig;
use dmri_prep::error::{Error, ToolStatus};
use dmri_prep::external::{BrainExtractor, TissueSegmenter};
use dmri_prep::logging::PipelineLog;
use dmri_prep::normalize::percentile;
use dmri_prep::pipeline::{run, Tools};
use dmri_prep::scheme::Scheme;
use dmri_prep::subject::{SubjectLayout, SubjectRegistry};
use dmri_prep::volume::{write_mask, write_volume, Grid};
use dmri_prep::Result;
use ndarray::{Array3, Array4};
use std::cell::Cell;
use std::path::Path;

const SHAPE: [usize; 3] = [2, 5, 1];
const MEASUREMENTS: usize = 4;

const SCHEME: &str = "\
0 0 0 0
1 0 0 1000
0 1 0 1000
0 0 1 1000
";

/// a grid with the given voxel size whose first voxel sits at `origin`
fn grid(shape: [usize; 3], voxel: [f64; 3], origin: [f64; 3]) -> Grid {
    let mut g = Grid::identity(shape);
    (0..3).for_each(|i| {
        g.affine[i][i] = voxel[i];
        g.affine[i][3] = origin[i];
    });
    g
}

/// writes a brain mask, or fails for subjects whose directory name contains "broken"
struct FullMask {
    calls: Cell<usize>,
    /// when set, the mask is written at half the scan's voxel size and leaves out the last column
    fine_grid: bool,
}

impl FullMask {
    fn new() -> Self {
        Self { calls: Cell::new(0), fine_grid: false }
    }
}

impl BrainExtractor for FullMask {
    fn extract(&self, scan: &Path, _scheme: &Path, mask: &Path, _log: &PipelineLog) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        if scan.display().to_string().contains("broken") {
            return Err(Error::ExternalTool {
                tool: "mock-bet".to_string(),
                status: ToolStatus::Spawn(std::io::Error::new(std::io::ErrorKind::NotFound, "no such tool")),
            });
        }
        if self.fine_grid {
            let shape = [2 * SHAPE[0], 2 * SHAPE[1], SHAPE[2]];
            let m = Array3::from_shape_fn((shape[0], shape[1], shape[2]), |(_, j, _)| j < 2 * (SHAPE[1] - 1));
            return write_mask(mask, m.view(), &grid(shape, [0.5, 0.5, 1.], [0.; 3]));
        }
        write_mask(mask, Array3::from_elem((SHAPE[0], SHAPE[1], SHAPE[2]), true).view(), &Grid::identity(SHAPE))
    }
}

/// writes a five class probability volume cycling through grey, white and csf by scan voxel
struct CyclingTissue {
    /// voxels of padding in front of the scan grid along x and y
    pad: usize,
}

impl CyclingTissue {
    fn hot_class(voxel: usize) -> usize {
        [0, 2, 3][voxel % 3]
    }
}

impl TissueSegmenter for CyclingTissue {
    fn segment(&self, _structural: &Path, _mask: &Path, output: &Path, _log: &PipelineLog) -> Result<()> {
        let shape = [SHAPE[0] + self.pad, SHAPE[1] + self.pad, SHAPE[2]];
        let probs = Array4::from_shape_fn((shape[0], shape[1], shape[2], 5), |(i, j, _, c)| {
            let hot = match (i.checked_sub(self.pad), j.checked_sub(self.pad)) {
                (Some(i), Some(j)) => Self::hot_class(i * SHAPE[1] + j),
                _ => 4,
            };
            if c == hot { 0.9f32 } else { 0.025 }
        });
        let origin = -(self.pad as f64);
        write_volume(output, &probs.into_dyn(), &grid(shape, [1.; 3], [origin, origin, 0.]))
    }
}

const ALIGNED_TISSUE: CyclingTissue = CyclingTissue { pad: 0 };

fn layout() -> SubjectLayout {
    SubjectLayout {
        diffusion: "dwi.nii".to_string(),
        structural: "T1w.nii".to_string(),
        brain_mask: "brain_mask.nii".to_string(),
        tissue: "5tt.nii".to_string(),
        scheme: "scheme.txt".to_string(),
        ..SubjectLayout::default()
    }
}
fn scan(gain: f32) -> Array4<f32> {
    Array4::from_shape_fn((SHAPE[0], SHAPE[1], SHAPE[2], MEASUREMENTS), |(i, j, _, q)| {
        let v = i * SHAPE[1] + j;
        gain * ((v + 1) * 10 + q) as f32
    })
}

fn make_subject(data_root: &Path, name: &str, gain: f32) {
    let dir = data_root.join("study").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let layout = layout();
    write_volume(dir.join(&layout.diffusion), &scan(gain).into_dyn(), &Grid::identity(SHAPE)).unwrap();
    std::fs::write(dir.join(&layout.structural), b"").unwrap();
    std::fs::write(dir.join(&layout.scheme), SCHEME).unwrap();
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        data_root: root.join("data"),
        archive: root.join("normalized.hdf5"),
        scheme_text: root.join("scheme.txt"),
        scheme_archive: root.join("scheme.hdf5"),
        manifest: Some(root.join("subjects.json")),
        chunk_rows: 4,
        layout: layout(),
        ..Default::default()
    }
}

#[test]
fn two_subjects_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    make_subject(&cfg.data_root, "s1", 1.);
    make_subject(&cfg.data_root, "s2", 0.5);

    let extractor = FullMask::new();
    let tools = Tools { brain_extractor: &extractor, tissue_segmenter: &ALIGNED_TISSUE };
    let report = run(&cfg, &tools, &PipelineLog::silent()).unwrap();

    assert_eq!(report.reference, "s1");
    assert_eq!(report.appended.len(), 2);
    assert!(report.skipped.is_empty());
    assert_eq!(extractor.calls.get(), 2);

    let flat = scan(1.).iter().copied().collect::<Vec<f32>>();
    assert_eq!(report.scale, percentile(&flat, 95.).unwrap());

    let archive = Archive::new(&cfg.archive);
    let summary = archive.summary().unwrap();
    assert_eq!(summary.data_rows, 20);
    assert_eq!(summary.width, MEASUREMENTS);
    assert!(summary.is_consistent());
    assert_eq!(summary.entries.len(), 2);
    assert_eq!(summary.offset_of(0), Some(0));
    assert_eq!(summary.offset_of(1), Some(10));
    assert_eq!(summary.entries[0].calibration.coefficient, 1.);
    assert!((summary.entries[1].calibration.coefficient - 2.).abs() < 1e-9);

    let file = hdf5::File::open(&cfg.archive).unwrap();
    let index = file.dataset(INDEX).unwrap().read_raw::<i32>().unwrap();
    assert_eq!(index.iter().filter(|&&i| i == 0).count(), 10);
    assert_eq!(index.iter().filter(|&&i| i == 1).count(), 10);

    // the half intensity subject lands on the reference intensities
    let s1 = archive.read_subject(0).unwrap();
    let s2 = archive.read_subject(1).unwrap();
    s1.data.iter().zip(s2.data.iter()).for_each(|(a, b)| assert!((a - b).abs() < 1e-6));
    let first = (10. / report.scale) as f32;
    assert!((s1.data[[0, 0]] - first).abs() < 1e-6);

    assert_eq!(s1.masks.to_vec(), vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(s2.masks, s1.masks);

    let scheme = Scheme::read_text(&cfg.scheme_text).unwrap();
    assert_eq!(scheme.zero_gradient_mask(), vec![true, false, false, false]);
    assert_eq!(Scheme::read_archive(&cfg.scheme_archive).unwrap(), scheme);

    let manifest = SubjectRegistry::load_manifest(cfg.manifest.as_ref().unwrap()).unwrap();
    assert_eq!(manifest.len(), 2);
    assert!(manifest.iter().all(|s| s.is_calibrated() && s.masks.brain_mask.is_some() && s.masks.tissue.is_some()));
}

#[test]
fn failing_subject_is_skipped_and_rerun_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    make_subject(&cfg.data_root, "s1", 1.);
    make_subject(&cfg.data_root, "s2", 0.5);
    make_subject(&cfg.data_root, "s3_broken", 2.);

    let extractor = FullMask::new();
    let tools = Tools { brain_extractor: &extractor, tissue_segmenter: &ALIGNED_TISSUE };
    let report = run(&cfg, &tools, &PipelineLog::silent()).unwrap();
    assert_eq!(report.enumerated, 3);
    assert_eq!(report.appended.len(), 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].name, "s3_broken");
    assert_eq!(Archive::new(&cfg.archive).summary().unwrap().data_rows, 20);

    let again = run(&cfg, &tools, &PipelineLog::silent()).unwrap();
    assert!(again.appended.is_empty());
    assert_eq!(again.already_archived, vec!["s1".to_string(), "s2".to_string()]);
    assert_eq!(again.skipped.len(), 1);
    assert_eq!(Archive::new(&cfg.archive).summary().unwrap().data_rows, 20);
}

#[test]
fn tissue_masks_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig { build_tissue_masks: false, ..config(dir.path()) };
    make_subject(&cfg.data_root, "s1", 1.);

    let extractor = FullMask::new();
    let tools = Tools { brain_extractor: &extractor, tissue_segmenter: &ALIGNED_TISSUE };
    run(&cfg, &tools, &PipelineLog::silent()).unwrap();

    let summary = Archive::new(&cfg.archive).summary().unwrap();
    assert_eq!(summary.data_rows, 10);
    assert_eq!(summary.masks_len, 0);
}

#[test]
fn misaligned_mask_and_tissue_are_resampled_onto_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    make_subject(&cfg.data_root, "s1", 1.);
    make_subject(&cfg.data_root, "s2", 0.5);

    let extractor = FullMask { calls: Cell::new(0), fine_grid: true };
    let tissue = CyclingTissue { pad: 1 };
    let tools = Tools { brain_extractor: &extractor, tissue_segmenter: &tissue };
    let report = run(&cfg, &tools, &PipelineLog::silent()).unwrap();
    assert_eq!(report.appended.len(), 2);
    assert!(report.skipped.is_empty());

    // the fine mask leaves out the last column, 8 of the 10 scan voxels remain
    let archive = Archive::new(&cfg.archive);
    let summary = archive.summary().unwrap();
    assert_eq!(summary.data_rows, 16);
    assert_eq!(summary.masks_len, summary.data_rows);
    assert!(summary.is_consistent());

    for id in 0..2 {
        let s = archive.read_subject(id).unwrap();
        assert_eq!(s.masks.len(), s.data.nrows());
        assert_eq!(s.masks.to_vec(), vec![0, 1, 2, 0, 2, 0, 1, 2]);
    }

    // every label belongs to the voxel its data row came from
    let s1 = archive.read_subject(0).unwrap();
    for (row, label) in s1.data.rows().into_iter().zip(s1.masks.iter()) {
        let voxel = (row[0] as f64 * report.scale / 10.).round() as usize - 1;
        assert!(voxel % SHAPE[1] < SHAPE[1] - 1);
        assert_eq!(*label as usize, voxel % 3);
    }
}

#[test]
fn subject_added_between_runs_keeps_ids_and_reference() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    make_subject(&cfg.data_root, "s1", 1.);
    make_subject(&cfg.data_root, "s2", 0.5);

    let extractor = FullMask::new();
    let tools = Tools { brain_extractor: &extractor, tissue_segmenter: &ALIGNED_TISSUE };
    let first = run(&cfg, &tools, &PipelineLog::silent()).unwrap();
    assert_eq!(first.reference, "s1");

    // sorts ahead of both archived subjects
    make_subject(&cfg.data_root, "s0", 0.25);
    let again = run(&cfg, &tools, &PipelineLog::silent()).unwrap();
    assert_eq!(again.reference, "s1");
    assert_eq!(again.scale, first.scale);
    assert_eq!(again.already_archived, vec!["s1".to_string(), "s2".to_string()]);
    assert_eq!(again.appended.len(), 1);
    assert_eq!(again.appended[0].subject_id, 2);

    let archive = Archive::new(&cfg.archive);
    let summary = archive.summary().unwrap();
    assert_eq!(summary.data_rows, 30);
    assert!(summary.is_consistent());
    let names = summary.entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["s1", "s2", "s0"]);
    assert_eq!(summary.entry_by_name("s1").unwrap().subject_id, 0);
    assert_eq!(summary.entry_by_name("s2").unwrap().subject_id, 1);
    assert_eq!(summary.entry_by_name("s0").unwrap().subject_id, 2);
    let reference = summary.reference.as_ref().unwrap();
    assert_eq!(reference.name, "s1");
    assert_eq!(reference.scale, first.scale);
    assert!((summary.entry_by_name("s0").unwrap().calibration.coefficient - 4.).abs() < 1e-9);

    let file = hdf5::File::open(&cfg.archive).unwrap();
    let index = file.dataset(INDEX).unwrap().read_raw::<i32>().unwrap();
    (0..3).for_each(|id| assert_eq!(index.iter().filter(|&&i| i == id).count(), 10));

    let manifest = SubjectRegistry::load_manifest(cfg.manifest.as_ref().unwrap()).unwrap();
    let ids = manifest.iter().map(|s| (s.name.as_str(), s.id)).collect::<Vec<_>>();
    assert_eq!(ids, vec![("s0", 2), ("s1", 0), ("s2", 1)]);
}

#[test]
fn reference_different_from_the_archived_one_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    make_subject(&cfg.data_root, "s1", 1.);
    make_subject(&cfg.data_root, "s2", 0.5);

    let extractor = FullMask::new();
    let tools = Tools { brain_extractor: &extractor, tissue_segmenter: &ALIGNED_TISSUE };
    run(&cfg, &tools, &PipelineLog::silent()).unwrap();

    let other = PipelineConfig { reference_subject: Some("s2".to_string()), ..config(dir.path()) };
    assert!(matches!(run(&other, &tools, &PipelineLog::silent()), Err(Error::InconsistentArchive(_))));

    // same reference name, different intensities
    make_subject(&cfg.data_root, "s1", 3.);
    make_subject(&cfg.data_root, "s3", 1.);
    assert!(matches!(run(&cfg, &tools, &PipelineLog::silent()), Err(Error::InconsistentArchive(_))));
    assert_eq!(Archive::new(&cfg.archive).summary().unwrap().data_rows, 20);
}

#[test]
fn unusable_first_subject_hands_the_reference_to_the_next() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    make_subject(&cfg.data_root, "a_broken", 1.);
    make_subject(&cfg.data_root, "s1", 1.);
    make_subject(&cfg.data_root, "s2", 0.5);

    let extractor = FullMask::new();
    let tools = Tools { brain_extractor: &extractor, tissue_segmenter: &ALIGNED_TISSUE };
    let report = run(&cfg, &tools, &PipelineLog::silent()).unwrap();
    assert_eq!(report.reference, "s1");
    assert_eq!(report.appended.len(), 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].name, "a_broken");
    let summary = Archive::new(&cfg.archive).summary().unwrap();
    assert_eq!(summary.reference.unwrap().name, "s1");
    assert_eq!(summary.data_rows, 20);

    // a pinned reference that cannot be loaded stops the run
    let dir = tempfile::tempdir().unwrap();
    let pinned = PipelineConfig { reference_subject: Some("a_broken".to_string()), ..config(dir.path()) };
    make_subject(&pinned.data_root, "a_broken", 1.);
    make_subject(&pinned.data_root, "s1", 1.);
    assert!(matches!(run(&pinned, &tools, &PipelineLog::silent()), Err(Error::ExternalTool { .. })));
}

#[test]
fn invalid_configuration_is_refused_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig { chunk_rows: 0, ..config(dir.path()) };
    make_subject(&cfg.data_root, "s1", 1.);

    let extractor = FullMask::new();
    let tools = Tools { brain_extractor: &extractor, tissue_segmenter: &ALIGNED_TISSUE };
    assert!(matches!(run(&cfg, &tools, &PipelineLog::silent()), Err(Error::InvalidConfig(_))));
    assert_eq!(extractor.calls.get(), 0);
    assert!(!cfg.archive.exists());
}
