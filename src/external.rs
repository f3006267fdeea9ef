//! Blocking invocation of the external imaging tools (brain extraction, tissue segmentation).

use crate::error::{Error, Result, ToolStatus};
use crate::logging::PipelineLog;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Command, Stdio};

/// Produces a binary brain mask for a diffusion scan.
pub trait BrainExtractor {
    fn extract(&self, scan: &Path, scheme: &Path, mask: &Path, log: &PipelineLog) -> Result<()>;
}

/// Produces a multi-channel tissue probability volume from a structural scan.
pub trait TissueSegmenter {
    fn segment(&self, structural: &Path, mask: &Path, output: &Path, log: &PipelineLog) -> Result<()>;
}

/// A program and its argument template. Arguments may contain the placeholders `{scan}`,
/// `{scheme}`, `{mask}`, `{structural}` and `{output}`, which are replaced with paths at
/// invocation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// MRtrix brain mask estimation from the diffusion scan and its gradient scheme
    pub fn default_brain_extraction() -> Self {
        Self::new("dwi2mask", &["{scan}", "{mask}", "-grad", "{scheme}", "-force"])
    }

    /// MRtrix five tissue type segmentation (FSL backend)
    pub fn default_tissue_segmentation() -> Self {
        Self::new("5ttgen", &["fsl", "{structural}", "{output}", "-mask", "{mask}", "-nocrop", "-force"])
    }

    fn render_args(&self, substitutions: &[(&str, &Path)]) -> Vec<String> {
        self.args.iter().map(|arg| {
            substitutions.iter().fold(arg.clone(), |acc, (key, path)| {
                acc.replace(&format!("{{{key}}}"), &path.display().to_string())
            })
        }).collect()
    }

    /// runs the tool to completion. A nonzero exit status is an error.
    pub fn run(&self, substitutions: &[(&str, &Path)], log: &PipelineLog) -> Result<()> {
        let args = self.render_args(substitutions);
        log.debug(format_args!("event=tool_start program={} args={:?}", self.program, args));
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::ExternalTool { tool: self.program.clone(), status: ToolStatus::Spawn(e) })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log.error(format_args!("event=tool_failed program={} status={} stderr={:?}", self.program, output.status, stderr.trim()));
            return Err(Error::ExternalTool { tool: self.program.clone(), status: ToolStatus::Exit(output.status) });
        }
        log.debug(format_args!("event=tool_done program={}", self.program));
        Ok(())
    }
}

impl BrainExtractor for ToolCommand {
    fn extract(&self, scan: &Path, scheme: &Path, mask: &Path, log: &PipelineLog) -> Result<()> {
        self.run(&[("scan", scan), ("scheme", scheme), ("mask", mask), ("output", mask)], log)
    }
}

impl TissueSegmenter for ToolCommand {
    fn segment(&self, structural: &Path, mask: &Path, output: &Path, log: &PipelineLog) -> Result<()> {
        self.run(&[("structural", structural), ("mask", mask), ("output", output)], log)
    }
}
