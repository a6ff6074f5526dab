use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

use crate::browser::{FILES_SUBDIR, SCRIPTS_SUBDIR};
use crate::crawler::task::FinalResult;
use crate::storage::{StorageError, RESOURCE_METADATA_FILE, SCRIPT_METADATA_FILE};

/// Store a final result into `outpath`, which must not exist yet
///
/// Everything that can be checked up front (existing directory, missing
/// artifacts, unserializable metadata) is checked before the directory is
/// created, so those errors leave nothing behind. A failure after that point
/// removes the partially written directory again, so a later attempt of the
/// same task can store into it.
pub async fn store_results_local(result: &FinalResult, outpath: &Path) -> Result<(), StorageError> {
    let task = &result.task;
    let flags = task.storage;

    if fs::try_exists(outpath).await.unwrap_or(false) {
        return Err(StorageError::AlreadyExists(outpath.to_path_buf()));
    }

    let files_dir = task.working_dir.join(FILES_SUBDIR);
    let scripts_dir = task.working_dir.join(SCRIPTS_SUBDIR);

    if flags.all_resources && !is_dir(&files_dir).await {
        return Err(StorageError::MissingArtifacts { what: "All resources", path: files_dir });
    }
    if flags.all_scripts && !is_dir(&scripts_dir).await {
        return Err(StorageError::MissingArtifacts { what: "All scripts", path: scripts_dir });
    }

    let resource_metadata = if flags.resource_metadata {
        Some(serde_json::to_vec(&result.resource_metadata)?)
    } else {
        None
    };
    let script_metadata = if flags.script_metadata {
        Some(serde_json::to_vec(&result.script_metadata)?)
    } else {
        None
    };

    if let Some(parent) = outpath.parent() {
        fs::create_dir_all(parent).await
            .map_err(|e| StorageError::io(format!("Failed to create {}", parent.display()), e))?;
    }
    fs::create_dir(outpath).await.map_err(|e| match e.kind() {
        ErrorKind::AlreadyExists => StorageError::AlreadyExists(outpath.to_path_buf()),
        _ => StorageError::io(format!("Failed to create {}", outpath.display()), e),
    })?;

    let populated = async {
        if let Some(data) = &resource_metadata {
            write(&outpath.join(RESOURCE_METADATA_FILE), data).await?;
        }
        if let Some(data) = &script_metadata {
            write(&outpath.join(SCRIPT_METADATA_FILE), data).await?;
        }

        if flags.all_resources {
            rename(&files_dir, &outpath.join(FILES_SUBDIR)).await?;
        }
        if flags.all_scripts {
            rename(&scripts_dir, &outpath.join(SCRIPTS_SUBDIR)).await?;
        }
        Ok::<_, StorageError>(())
    };

    if let Err(e) = populated.await {
        if let Err(cleanup) = fs::remove_dir_all(outpath).await {
            warn!("Failed to remove partially stored {}: {}", outpath.display(), cleanup);
        }
        return Err(e);
    }

    debug!("Stored results for {} in {}", task.url, outpath.display());
    Ok(())
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

async fn write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    fs::write(path, data).await
        .map_err(|e| StorageError::io(format!("Failed to write {}", path.display()), e))
}

async fn rename(from: &Path, to: &Path) -> Result<(), StorageError> {
    fs::rename(from, to).await
        .map_err(|e| StorageError::io(format!("Failed to move {} to {}", from.display(), to.display()), e))
}
