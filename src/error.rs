use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while turning a checkpoint into an artifact.
///
/// None of these are recovered from locally; they bubble straight up to the
/// caller (or to the process exit status in the CLI).
#[derive(Error, Debug)]
pub enum Error {
    #[error("checkpoint not found: {} ({source})", path.display())]
    CheckpointNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {} could not be loaded: {reason}", path.display())]
    CheckpointCorrupt {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("unsupported export format '{format}' (supported: {supported})")]
    UnsupportedFormat { format: String, supported: String },

    #[error("export to {format} failed for {}: {reason}", path.display())]
    ExportFailure {
        path: PathBuf,
        format: String,
        reason: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CheckpointNotFound,
    CheckpointCorrupt,
    UnsupportedFormat,
    ExportFailure,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CheckpointNotFound { .. } => ErrorKind::CheckpointNotFound,
            Error::CheckpointCorrupt { .. } => ErrorKind::CheckpointCorrupt,
            Error::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            Error::ExportFailure { .. } => ErrorKind::ExportFailure,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CheckpointCorrupt {
            path: path.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn corrupt_from(path: impl Into<PathBuf>, err: anyhow::Error) -> Self {
        Error::CheckpointCorrupt {
            path: path.into(),
            reason: format!("{:#}", err),
            source: Some(err),
        }
    }

    pub(crate) fn export_from(path: impl Into<PathBuf>, format: impl fmt::Display, err: anyhow::Error) -> Self {
        Error::ExportFailure {
            path: path.into(),
            format: format.to_string(),
            reason: format!("{:#}", err),
            source: Some(err),
        }
    }
}

impl ErrorKind {
    /// Process exit status used by the CLI. Usage errors keep clap's 2.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::CheckpointNotFound => 3,
            ErrorKind::CheckpointCorrupt => 4,
            ErrorKind::UnsupportedFormat => 5,
            ErrorKind::ExportFailure => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CheckpointNotFound => "CheckpointNotFound",
            ErrorKind::CheckpointCorrupt => "CheckpointCorrupt",
            ErrorKind::UnsupportedFormat => "UnsupportedFormat",
            ErrorKind::ExportFailure => "ExportFailure",
        };
        f.write_str(name)
    }
}
