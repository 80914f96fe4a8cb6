//! Final file assembly from segment part files.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Part file of segment `index`: `<destination>.part.<index>`.
pub fn part_path(destination: &Path, index: u32) -> PathBuf {
    with_suffix(destination, &format!(".part.{index}"))
}

/// Scratch file used while concatenating parts.
pub fn assembling_path(destination: &Path) -> PathBuf {
    with_suffix(destination, ".assembling")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Moves the ordered `parts` into `destination`.
///
/// A single part is renamed into place. Several parts are concatenated into
/// a scratch file that is synced and then renamed over the destination.
/// Parts are removed only once the destination is written; on failure they
/// are left untouched. When `expected_len` is given the result must match it.
pub async fn assemble(
    parts: &[PathBuf],
    destination: &Path,
    expected_len: Option<u64>,
) -> Result<(), EngineError> {
    let result = match parts {
        [] => Err(EngineError::Assembly("no parts to assemble".into())),
        [single] => move_single(single, destination, expected_len).await,
        _ => concatenate(parts, destination, expected_len).await,
    };

    if let Err(e) = &result {
        warn!(destination = %destination.display(), error = %e, "assembly failed");
    }
    result
}

async fn move_single(
    part: &Path,
    destination: &Path,
    expected_len: Option<u64>,
) -> Result<(), EngineError> {
    let len = tokio::fs::metadata(part).await.map_err(assembly)?.len();
    check_len(len, expected_len)?;

    if let Err(e) = tokio::fs::rename(part, destination).await {
        debug!(error = %e, "rename failed, copying part into place");
        copy_into_place(part, destination).await?;
        if let Err(e) = tokio::fs::remove_file(part).await {
            warn!(part = %part.display(), error = %e, "failed to remove part file");
        }
    }

    debug!(destination = %destination.display(), bytes = len, "single part moved into place");
    Ok(())
}

/// Copies `part` through the scratch file so `destination` only ever holds
/// a complete file.
async fn copy_into_place(part: &Path, destination: &Path) -> Result<(), EngineError> {
    let scratch = assembling_path(destination);
    let result = async {
        tokio::fs::copy(part, &scratch).await?;
        tokio::fs::File::open(&scratch).await?.sync_all().await?;
        tokio::fs::rename(&scratch, destination).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&scratch).await;
        return Err(assembly(e));
    }
    Ok(())
}

async fn concatenate(
    parts: &[PathBuf],
    destination: &Path,
    expected_len: Option<u64>,
) -> Result<(), EngineError> {
    let scratch = assembling_path(destination);

    match write_scratch(parts, &scratch, expected_len).await {
        Ok(total) => {
            if let Err(e) = tokio::fs::rename(&scratch, destination).await {
                let _ = tokio::fs::remove_file(&scratch).await;
                return Err(assembly(e));
            }
            for part in parts {
                if let Err(e) = tokio::fs::remove_file(part).await {
                    warn!(part = %part.display(), error = %e, "failed to remove part file");
                }
            }
            debug!(
                destination = %destination.display(),
                parts = parts.len(),
                bytes = total,
                "parts concatenated"
            );
            Ok(())
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&scratch).await;
            Err(e)
        }
    }
}

async fn write_scratch(
    parts: &[PathBuf],
    scratch: &Path,
    expected_len: Option<u64>,
) -> Result<u64, EngineError> {
    let mut out = tokio::fs::File::create(scratch).await.map_err(assembly)?;
    let mut total: u64 = 0;
    for part in parts {
        let mut input = tokio::fs::File::open(part).await.map_err(assembly)?;
        total += tokio::io::copy(&mut input, &mut out)
            .await
            .map_err(assembly)?;
    }
    out.flush().await.map_err(assembly)?;
    out.sync_all().await.map_err(assembly)?;
    check_len(total, expected_len)?;
    Ok(total)
}

fn check_len(actual: u64, expected: Option<u64>) -> Result<(), EngineError> {
    match expected {
        Some(expected) if expected != actual => Err(EngineError::Assembly(format!(
            "assembled {actual} bytes, expected {expected}"
        ))),
        _ => Ok(()),
    }
}

fn assembly(e: std::io::Error) -> EngineError {
    EngineError::Assembly(e.to_string())
}
