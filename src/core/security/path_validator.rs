//! Confinement of script plugin sources.
//!
//! A `script:` locator names a file on disk that the server will execute,
//! so its resolved location has to stay inside `MCP_ROOT_PATH` when one is
//! configured. Without a root, scripts only need to exist and be files,
//! and not go through a symlink when symlinks are disabled.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::core::config::SecurityConfig;

#[derive(Debug, thiserror::Error)]
pub enum PathSecurityError {
    #[error("Script '{path}' does not exist")]
    NotFound { path: PathBuf },

    #[error("Script '{path}' is not a regular file")]
    NotAFile { path: PathBuf },

    #[error("Script '{path}' resolves to '{resolved}', outside plugin root '{root}'")]
    EscapesRoot {
        path: PathBuf,
        resolved: PathBuf,
        root: PathBuf,
    },

    #[error("Script '{path}' goes through a symlink and symlinks are disabled")]
    SymlinkRefused { path: PathBuf },

    #[error("Cannot resolve '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolve a script path and check it against the plugin root.
///
/// Returns the canonical path, which is what gets executed; re-resolving
/// later could observe a different file if a symlink is swapped.
pub fn validate_path(path: &Path, security: &SecurityConfig) -> Result<PathBuf, PathSecurityError> {
    let resolved = resolve(path)?;

    if !resolved.is_file() {
        return Err(PathSecurityError::NotAFile { path: path.to_path_buf() });
    }

    if !security.allow_symlinks && traverses_symlink(path) {
        return Err(PathSecurityError::SymlinkRefused { path: path.to_path_buf() });
    }

    let Some(root) = &security.root_path else {
        return Ok(resolved);
    };
    let root = resolve(root)?;

    if !resolved.starts_with(&root) {
        return Err(PathSecurityError::EscapesRoot {
            path: path.to_path_buf(),
            resolved,
            root,
        });
    }

    Ok(resolved)
}

fn resolve(path: &Path) -> Result<PathBuf, PathSecurityError> {
    path.canonicalize().map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => PathSecurityError::NotFound { path: path.to_path_buf() },
        _ => PathSecurityError::Io {
            path: path.to_path_buf(),
            source,
        },
    })
}

/// True when the path itself or any directory on the way to it is a symlink.
fn traverses_symlink(path: &Path) -> bool {
    let mut current = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                current.push(part);
                if current.is_symlink() {
                    return true;
                }
            }
            other => current.push(other.as_os_str()),
        }
    }
    false
}
