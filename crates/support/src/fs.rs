//! Idempotent projection of resource data onto the local filesystem.

use std::{
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("failed to create directory {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),
    #[error("failed to read existing file {0}: {1}")]
    ReadExisting(PathBuf, #[source] std::io::Error),
    #[error("failed to write file {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to set permissions on {0}: {1}")]
    SetPermissions(PathBuf, #[source] std::io::Error),
    #[error("failed to remove file {0}: {1}")]
    Remove(PathBuf, #[source] std::io::Error),
}

/// Writes `data` to `folder/filename`, creating `folder` as needed.
///
/// Returns whether the file on disk changed: an existing file with the same
/// SHA-256 is left untouched. Insufficient privileges to create the folder
/// are reported as "no change" so a single unwritable destination cannot
/// wedge the reconciliation.
pub async fn write_file(
    folder: &Path,
    filename: &str,
    data: &[u8],
    mode: Option<u32>,
) -> Result<bool, ProjectionError> {
    if let Err(err) = tokio::fs::create_dir_all(folder).await {
        if err.kind() == ErrorKind::PermissionDenied {
            error!(
                "insufficient privileges to create {}, skipping {filename}",
                folder.display()
            );
            return Ok(false);
        }
        return Err(ProjectionError::CreateDir(folder.to_path_buf(), err));
    }

    let path = folder.join(filename);
    match tokio::fs::read(&path).await {
        Ok(existing) => {
            if Sha256::digest(&existing) == Sha256::digest(data) {
                debug!("contents of {filename} haven't changed, not overwriting");
                return Ok(false);
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {},
        Err(err) => return Err(ProjectionError::ReadExisting(path, err)),
    }

    tokio::fs::write(&path, data)
        .await
        .map_err(|err| ProjectionError::Write(path.clone(), err))?;

    if let Some(mode) = mode {
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|err| ProjectionError::SetPermissions(path.clone(), err))?;
    }

    Ok(true)
}

/// Removes `folder/filename` if present, returning whether a file was
/// actually deleted. A missing file is only worth a warning.
pub async fn remove_file(folder: &Path, filename: &str) -> Result<bool, ProjectionError> {
    let path = folder.join(filename);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("{} file not found", path.display());
            Ok(false)
        },
        Err(err) => Err(ProjectionError::Remove(path, err)),
    }
}
