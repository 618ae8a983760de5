use std::fmt;
use std::io;
use std::path::PathBuf;

use remem_core::CellId;

#[derive(Debug)]
pub enum StoreError {
    Io { path: PathBuf, source: io::Error },
    Json { path: PathBuf, source: serde_json::Error },
    Blob { path: PathBuf, source: bincode::Error },
    InvalidData(String),
    CellExists(CellId),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io { path, source } => {
                write!(f, "I/O error at {}: {source}", path.display())
            }
            StoreError::Json { path, source } => {
                write!(f, "invalid JSON in {}: {source}", path.display())
            }
            StoreError::Blob { path, source } => {
                write!(f, "invalid model blob {}: {source}", path.display())
            }
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            StoreError::CellExists(id) => write!(f, "cell {id} already exists"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Json { source, .. } => Some(source),
            StoreError::Blob { source, .. } => Some(source),
            StoreError::InvalidData(_) | StoreError::CellExists(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
