use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::loader::LoaderError;
use crate::queue::QueueError;
use crate::session::SessionError;
use crate::tunnel::TunnelError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("{0} is not defined")]
    MissingCredentials(String),
    #[error("invalid url loading mode: {0}")]
    InvalidLoadingMode(String),
}

/// Top-level error for a whole test run. Per-browser failures are absorbed
/// into failure reports before they reach this type; what remains aborts the
/// run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),
}

pub type RunResult<T> = std::result::Result<T, RunError>;
