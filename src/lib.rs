//! Cross-subject preprocessing of diffusion MRI scans into one normalized voxel archive.

pub mod archive;
pub mod config;
pub mod error;
pub mod external;
pub mod loader;
pub mod logging;
pub mod normalize;
pub mod pipeline;
pub mod resample;
pub mod scheme;
pub mod subject;
pub mod tissue;
pub mod volume;

pub use error::{Error, Result};
