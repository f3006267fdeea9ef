use crate::archive::DEFAULT_CHUNK_ROWS;
use crate::error::{Error, Result};
use crate::external::ToolCommand;
use crate::normalize::DEFAULT_PERCENTILE;
use crate::subject::SubjectLayout;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Everything a pipeline run needs, read from a toml file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// directory holding `<dataset>/<subject>` directories
    pub data_root: PathBuf,
    /// glob matched against `data_root` to enumerate subject directories
    pub subject_pattern: String,
    /// subject directory names to leave out
    pub exclude: Vec<String>,
    /// subject whose intensities everyone else is calibrated against. The first enumerated
    /// subject when unset
    pub reference_subject: Option<String>,
    /// normalized voxel archive (hdf5)
    pub archive: PathBuf,
    /// aggregated gradient scheme, text form
    pub scheme_text: PathBuf,
    /// aggregated gradient scheme, hdf5 form
    pub scheme_archive: PathBuf,
    /// subject registry written after a run
    pub manifest: Option<PathBuf>,
    pub chunk_rows: usize,
    /// percentile of the reference intensities used as the global scale
    pub percentile: f64,
    /// measurements with a strength at or below this are non-diffusion-weighted
    pub zero_gradient_tolerance: f64,
    pub build_tissue_masks: bool,
    pub layout: SubjectLayout,
    pub tools: ToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolConfig {
    pub brain_extraction: ToolCommand,
    pub tissue_segmentation: ToolCommand,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            brain_extraction: ToolCommand::default_brain_extraction(),
            tissue_segmentation: ToolCommand::default_tissue_segmentation(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            subject_pattern: "*/*".to_string(),
            exclude: vec![],
            reference_subject: None,
            archive: PathBuf::from("normalized.hdf5"),
            scheme_text: PathBuf::from("scheme.txt"),
            scheme_archive: PathBuf::from("scheme.hdf5"),
            manifest: None,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            percentile: DEFAULT_PERCENTILE,
            zero_gradient_tolerance: 0.,
            build_tissue_masks: true,
            layout: SubjectLayout::default(),
            tools: ToolConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// parses and validates a configuration
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// rejects values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_rows == 0 {
            return Err(Error::InvalidConfig("chunk_rows must be positive".to_string()));
        }
        if !(0. ..=100.).contains(&self.percentile) {
            return Err(Error::InvalidConfig(format!("percentile {} is outside [0, 100]", self.percentile)));
        }
        if !(self.zero_gradient_tolerance.is_finite() && self.zero_gradient_tolerance >= 0.) {
            return Err(Error::InvalidConfig(format!(
                "zero_gradient_tolerance {} must be finite and non-negative", self.zero_gradient_tolerance
            )));
        }
        if self.subject_pattern.is_empty() {
            return Err(Error::InvalidConfig("subject_pattern is empty".to_string()));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let mut s = toml::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    /// reads a configuration file. The `.toml` extension is implied.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut toml_str = String::new();
        File::open(path.as_ref().with_extension("toml"))?.read_to_string(&mut toml_str)?;
        Self::from_toml_str(&toml_str)
    }

    /// writes the configuration and returns the file name actually used
    pub fn save(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let filename = path.as_ref().with_extension("toml");
        let mut f = File::create(&filename)?;
        f.write_all(self.to_toml_string()?.as_bytes())?;
        Ok(filename)
    }
}

/// Command line shared by the pipeline binaries.
#[derive(Debug, Parser)]
pub struct PipelineArgs {
    /// path to the pipeline configuration (toml)
    pub config: PathBuf,
    /// log verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
    /// also write a log file into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}
