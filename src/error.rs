use thiserror::Error;

/// Everything that can go wrong while loading annotations or drawing them.
#[derive(Debug, Error)]
pub enum EvoError {
    #[error(
        "Your neighbor graph seems to be corrupted (row {row} has no positive distance). \
         Consider recomputing the neighbor graph."
    )]
    CorruptedNeighbors { row: usize },

    #[error("{kind} `{key}` not found in the annotations")]
    MissingAnnotation { kind: &'static str, key: String },

    #[error("{0}")]
    MissingArgument(&'static str),

    #[error(
        "reference alignment disagrees with the raw sequence at position {position}: \
         aligned `{aligned}`, raw `{raw}`"
    )]
    AlignmentMismatch {
        position: usize,
        aligned: char,
        raw: char,
    },

    #[error("{what} index {index} is out of range (size {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("no path from {source_idx} to {target_idx} in the transition graph")]
    NoPath { source_idx: usize, target_idx: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("unknown color `{0}`")]
    UnknownColor(String),

    #[error("unknown colormap `{0}`")]
    UnknownColormap(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, EvoError>;

impl EvoError {
    pub fn missing(kind: &'static str, key: impl Into<String>) -> Self {
        EvoError::MissingAnnotation {
            kind,
            key: key.into(),
        }
    }

    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        EvoError::Parse {
            line,
            message: message.into(),
        }
    }
}
