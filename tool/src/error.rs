use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unsupported logical image size of {0} bytes")]
    UnsupportedSize(usize),

    #[error("missing GCR-1541 magic, not a G64 image")]
    BadMagic,

    #[error("half track {half_track} uses speed zone {speed} instead of standard zone {standard}")]
    NonStandardSpeed {
        half_track: usize,
        speed: u8,
        standard: u8,
    },

    #[error("not overwriting existing file {}", .0.display())]
    OutputExists(PathBuf),

    #[error("{0}")]
    InvariantViolation(String),
}
