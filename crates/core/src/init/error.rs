//! Errors from `airway init`.

use std::path::PathBuf;
use thiserror::Error;

pub type InitResult<T> = Result<T, InitError>;

#[derive(Debug, Error)]
pub enum InitError {
    /// `.airway/` is already there and `--force` was not given.
    #[error("{0:?} already exists; pass --force to rewrite its templates")]
    AlreadyInitialized(PathBuf),

    /// The binary was built without the named template.
    #[error("No embedded template named '{0}'")]
    MissingTemplate(String),

    #[error("Cannot write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl InitError {
    pub(super) fn write(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| InitError::Write {
            path: path.to_path_buf(),
            source,
        }
    }
}
