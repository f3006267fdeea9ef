use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// an external tool could not be spawned or exited with a nonzero status
    #[error("external tool `{tool}` failed ({status})")]
    ExternalTool { tool: String, status: ToolStatus },

    #[error("missing input for subject `{subject}`: {what}")]
    MissingInput { subject: String, what: String },

    #[error("data width mismatch: archive has {expected} columns, got {found}")]
    WidthMismatch { expected: usize, found: usize },

    #[error("subject id {0} is already present in the archive")]
    DuplicateSubject(i64),

    #[error("subject `{0}` is already present in the archive")]
    DuplicateSubjectName(String),

    #[error("subject id {0} is not present in the archive")]
    UnknownSubject(i64),

    #[error("archive streams are inconsistent: {0}")]
    InconsistentArchive(String),

    #[error("invalid gradient scheme {}: {reason}", path.as_ref().map(|p| p.display().to_string()).unwrap_or_default())]
    InvalidScheme { path: Option<PathBuf>, reason: String },

    #[error("voxel grid mismatch: {0}")]
    Grid(String),

    #[error("numeric error: {0}")]
    Numeric(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("subject manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("failed to start logger: {0}")]
    Logging(#[from] flexi_logger::FlexiLoggerError),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    #[error(transparent)]
    Hdf5(#[from] hdf5::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum ToolStatus {
    Spawn(std::io::Error),
    Exit(ExitStatus),
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolStatus::Spawn(e) => write!(f, "could not start: {e}"),
            ToolStatus::Exit(status) => write!(f, "{status}"),
        }
    }
}

impl Error {
    /// errors the pipeline recovers from by skipping the affected subject
    pub fn is_subject_local(&self) -> bool {
        matches!(
            self,
            Error::ExternalTool { .. }
                | Error::MissingInput { .. }
                | Error::Numeric(_)
                | Error::Grid(_)
                | Error::Nifti(_)
        )
    }

    pub(crate) fn numeric(msg: impl Into<String>) -> Self {
        Error::Numeric(msg.into())
    }
}
