use std::path::PathBuf;

use thiserror::Error;

use crate::store::ProfileKind;

pub type TunupResult<T> = Result<T, TunupError>;

#[derive(Debug, Error)]
pub enum TunupError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error in {}: {message}", path.display())]
    ParseError { path: PathBuf, message: String },

    #[error("profile `{profile}` is missing required section `{section}`")]
    MalformedProfile { profile: String, section: &'static str },

    #[error("profile `{profile}` was acquired by {kind}")]
    WrongProfileKind { profile: String, kind: ProfileKind },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("profile name is required")]
    NameRequired,

    #[error("invalid profile name `{0}`")]
    InvalidName(String),

    #[error("invalid url `{0}`: only http:// and https:// are accepted")]
    InvalidUrl(String),

    #[error("Invalid file type. Only .yml files are accepted.")]
    InvalidFileType,

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("process supervision: {0}")]
    Supervision(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TunupError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TunupError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        TunupError::ParseError {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
