//! The preprocessing run as a sequence of named stages.
//!
//! 1. [build_registry]: enumerate subjects
//! 2. [prepare_scheme]: aggregate the per-subject gradient schemes
//! 3. [load_reference]: load the reference subject and compute the calibration targets
//! 4. [process_subject]: load, calibrate, rescale, label and append each subject in turn
//!
//! Subjects are processed one at a time in enumeration order. A subject that fails on its own
//! inputs (tool failure, missing file, unusable data) is logged and skipped. Archive errors abort
//! the run. Before any stage runs, [reconcile_ids] hands archived subjects their archived ids.

use crate::archive::{AppendReceipt, Archive, ArchiveSummary, SubjectRows};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::external::{BrainExtractor, TissueSegmenter};
use crate::loader::{load_scan, MaskedScan};
use crate::logging::PipelineLog;
use crate::normalize::{rescale, Reference};
use crate::scheme::{aggregate, Scheme};
use crate::subject::{Subject, SubjectRegistry};
use crate::tissue::build_tissue_labels;

/// The external tools a run delegates to.
#[derive(Clone, Copy)]
pub struct Tools<'a> {
    pub brain_extractor: &'a dyn BrainExtractor,
    pub tissue_segmenter: &'a dyn TissueSegmenter,
}

impl<'a> Tools<'a> {
    /// the command line tools named in the configuration
    pub fn from_config(config: &'a PipelineConfig) -> Self {
        Self {
            brain_extractor: &config.tools.brain_extraction,
            tissue_segmenter: &config.tools.tissue_segmentation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSubject {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub reference: String,
    pub scale: f64,
    pub enumerated: usize,
    pub appended: Vec<AppendReceipt>,
    /// subjects found in the archive from an earlier run
    pub already_archived: Vec<String>,
    pub skipped: Vec<SkippedSubject>,
}

pub fn build_registry(config: &PipelineConfig, log: &PipelineLog) -> Result<SubjectRegistry> {
    SubjectRegistry::discover(&config.data_root, &config.subject_pattern, &config.layout, &config.exclude, &log.stage("registry"))
}

/// aggregates every subject's scheme and writes the result in text and hdf5 form
pub fn prepare_scheme(registry: &SubjectRegistry, config: &PipelineConfig, log: &PipelineLog) -> Result<Scheme> {
    let log = log.stage("scheme");
    let schemes = registry.iter()
        .map(|s| Scheme::read_text(&s.files.scheme))
        .collect::<Result<Vec<_>>>()?;
    let scheme = aggregate(&schemes)?;
    scheme.write_text(&config.scheme_text)?;
    scheme.write_archive(&config.scheme_archive)?;
    log.info(format_args!(
        "event=scheme_written subjects={} measurements={} zero_gradient={} shells={} text={} archive={}",
        schemes.len(),
        scheme.n_measurements(),
        scheme.zero_gradient_mask_within(config.zero_gradient_tolerance).iter().filter(|&&z| z).count(),
        scheme.shells().len(),
        config.scheme_text.display(),
        config.scheme_archive.display(),
    ));
    Ok(scheme)
}

fn check_measurements(subject: &Subject, scan: &MaskedScan, scheme: &Scheme) -> Result<()> {
    if scan.n_measurements() != scheme.n_measurements() {
        return Err(Error::InvalidScheme {
            path: Some(subject.files.scheme.clone()),
            reason: format!("scan has {} measurements, scheme has {}", scan.n_measurements(), scheme.n_measurements()),
        });
    }
    Ok(())
}

/// loads the reference subject and computes the global scale and the median zero gradient
/// signal every other subject is regressed onto
pub fn load_reference(
    subject: &mut Subject,
    scheme: &Scheme,
    tools: &Tools,
    config: &PipelineConfig,
    log: &PipelineLog,
) -> Result<(Reference, MaskedScan)> {
    let log = log.stage("reference");
    let scan = load_scan(subject, tools.brain_extractor, &log)?;
    check_measurements(subject, &scan, scheme)?;
    let zero_mask = scheme.zero_gradient_mask_within(config.zero_gradient_tolerance);
    let reference = Reference::from_matrix(scan.matrix.view(), &zero_mask, config.percentile)?;
    log.info(format_args!(
        "event=reference_ready subject={} voxels={} scale={}", subject.name, scan.n_voxels(), reference.scale
    ));
    Ok((reference, scan))
}

/// calibrates an already loaded scan, attaches tissue labels and appends it to the archive
#[allow(clippy::too_many_arguments)]
pub fn archive_scan(
    subject: &mut Subject,
    scan: &MaskedScan,
    reference: &Reference,
    is_reference: bool,
    archive: &Archive,
    tools: &Tools,
    config: &PipelineConfig,
    log: &PipelineLog,
) -> Result<AppendReceipt> {
    let calibration = if is_reference {
        reference.calibration()
    } else {
        reference.calibrate(scan.matrix.view())?
    };
    subject.calibration = Some(calibration);
    log.info(format_args!(
        "event=subject_calibrated subject={} scale={} coefficient={}", subject.name, calibration.scale, calibration.coefficient
    ));
    let normalized = rescale(scan.matrix.view(), &calibration)?;
    let labels = if config.build_tissue_masks {
        Some(build_tissue_labels(subject, tools.tissue_segmenter, &scan.mask, &scan.grid, log)?)
    } else {
        None
    };
    archive.append_subject(&SubjectRows {
        subject_id: subject.id as i64,
        subject_name: &subject.name,
        data: normalized.view(),
        calibration,
        masks: labels.as_ref().map(|l| l.view()),
    }, log)
}

/// the full per-subject stage for a non-reference subject
pub fn process_subject(
    subject: &mut Subject,
    scheme: &Scheme,
    reference: &Reference,
    archive: &Archive,
    tools: &Tools,
    config: &PipelineConfig,
    log: &PipelineLog,
) -> Result<AppendReceipt> {
    let log = log.stage("subject");
    let scan = load_scan(subject, tools.brain_extractor, &log)?;
    check_measurements(subject, &scan, scheme)?;
    archive_scan(subject, &scan, reference, false, archive, tools, config, &log)
}

/// gives archived subjects their archived ids and every other subject a fresh id above them, so
/// ids stay stable when subjects are added or excluded between runs
pub fn reconcile_ids(registry: &mut SubjectRegistry, archived: &ArchiveSummary, log: &PipelineLog) -> Result<()> {
    let known = archived.entries.iter()
        .map(|e| {
            u32::try_from(e.subject_id)
                .map(|id| (e.name.clone(), id))
                .map_err(|_| Error::InconsistentArchive(format!("archived subject id {} is out of range", e.subject_id)))
        })
        .collect::<Result<Vec<_>>>()?;
    registry.reassign_ids(&known);
    if !known.is_empty() {
        log.debug(format_args!("event=ids_reconciled archived={} enumerated={}", known.len(), registry.len()));
    }
    Ok(())
}

/// runs every stage over an existing registry. Subjects already present in the archive (matched
/// by name) are left alone, so an interrupted run can be resumed.
///
/// The reference is the configured subject, else the one recorded in the archive, else the first
/// enumerated subject that loads. A configured or recorded reference is mandatory: if it cannot
/// be loaded the run fails. Without either, subjects that fail to load are skipped until one can
/// serve as reference. The archive refuses a reference or scale different from the recorded one.
pub fn run_registry(
    registry: &mut SubjectRegistry,
    config: &PipelineConfig,
    tools: &Tools,
    log: &PipelineLog,
) -> Result<RunReport> {
    config.validate()?;
    let archive = Archive::new(&config.archive).with_chunk_rows(config.chunk_rows);
    let archived = archive.summary()?;
    reconcile_ids(registry, &archived, log)?;

    let pinned = config.reference_subject.clone()
        .or_else(|| archived.reference.as_ref().map(|r| r.name.clone()));
    let candidates = match &pinned {
        Some(name) => vec![registry.reference_index(Some(name))?],
        None => {
            registry.reference_index(None)?;
            (0..registry.len()).collect()
        }
    };
    let scheme = prepare_scheme(registry, config, log)?;

    let mut report = RunReport { enumerated: registry.len(), ..Default::default() };
    let mut failed = vec![];
    let mut loaded = None;
    for index in candidates {
        let subject = registry.get_mut(index)
            .ok_or_else(|| Error::MissingInput { subject: String::new(), what: "reference subject".to_string() })?;
        match load_reference(subject, &scheme, tools, config, log) {
            Ok(reference) => {
                loaded = Some((index, reference));
                break;
            }
            Err(e) if pinned.is_none() && e.is_subject_local() => {
                log.warn(format_args!("event=reference_unusable subject={} error={e} action=try_next", subject.name));
                report.skipped.push(SkippedSubject { name: subject.name.clone(), reason: e.to_string() });
                failed.push(index);
            }
            Err(e) => return Err(e),
        }
    }
    let (reference_index, (reference, reference_scan)) = loaded
        .ok_or_else(|| Error::MissingInput { subject: String::new(), what: "no subject could be loaded as reference".to_string() })?;
    let reference_name = registry.get(reference_index).map(|s| s.name.clone()).unwrap_or_default();
    archive.record_reference(&reference_name, reference.scale, log)?;
    report.reference = reference_name;
    report.scale = reference.scale;

    let subject_log = log.stage("subject");
    for (index, subject) in registry.iter_mut().enumerate() {
        if failed.contains(&index) {
            continue;
        }
        if archived.entry_by_name(&subject.name).is_some() {
            log.info(format_args!("event=subject_already_archived subject={} id={}", subject.name, subject.id));
            report.already_archived.push(subject.name.clone());
            continue;
        }
        let result = if index == reference_index {
            archive_scan(subject, &reference_scan, &reference, true, &archive, tools, config, &subject_log)
        } else {
            process_subject(subject, &scheme, &reference, &archive, tools, config, log)
        };
        match result {
            Ok(receipt) => report.appended.push(receipt),
            Err(e) if e.is_subject_local() => {
                log.error(format_args!("event=subject_skipped subject={} error={e}", subject.name));
                report.skipped.push(SkippedSubject { name: subject.name.clone(), reason: e.to_string() });
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(manifest) = &config.manifest {
        registry.save_manifest(manifest)?;
        log.info(format_args!("event=manifest_written path={}", manifest.display()));
    }
    log.info(format_args!(
        "event=run_complete appended={} already_archived={} skipped={} reference={}",
        report.appended.len(), report.already_archived.len(), report.skipped.len(), report.reference
    ));
    Ok(report)
}

/// enumerates subjects from the configured data root and runs every stage
pub fn run(config: &PipelineConfig, tools: &Tools, log: &PipelineLog) -> Result<RunReport> {
    let mut registry = build_registry(config, log)?;
    run_registry(&mut registry, config, tools, log)
}
