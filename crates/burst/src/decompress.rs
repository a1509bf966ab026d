//! Decompression of `.fits.Z` inputs via external tools.
//!
//! Each compressed file is decompressed in place by `uncompress`, falling back
//! to `gunzip -d` when `uncompress` cannot be started. Files are processed in
//! batches sized to the worker budget; a batch is fully joined before the next
//! one starts.

use crate::diagnostics::{DiagnosticCode, Diagnostics};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error type for decompression
#[derive(Debug, Error)]
pub enum DecompressError {
    /// Neither tool could be started
    #[error("Failed to start decompression of {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited with non-zero status
    #[error("{tool} failed on {path} with exit code: {code}")]
    Failed {
        path: PathBuf,
        tool: DecompressTool,
        code: i32,
    },

    /// The tool was terminated by a signal
    #[error("{tool} on {path} was terminated by signal")]
    Terminated { path: PathBuf, tool: DecompressTool },

    /// The blocking task panicked or was cancelled
    #[error("Decompression task failed: {0}")]
    Join(String),
}

/// External tool used for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressTool {
    Uncompress,
    Gunzip,
}

impl std::fmt::Display for DecompressTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecompressTool::Uncompress => write!(f, "uncompress"),
            DecompressTool::Gunzip => write!(f, "gunzip"),
        }
    }
}

/// Build the primary decompression command: `uncompress <path>`
pub fn build_uncompress_command(path: &Path) -> Command {
    let mut cmd = Command::new("uncompress");
    cmd.arg(path);
    cmd
}

/// Build the fallback decompression command: `gunzip -d <path>`
pub fn build_gunzip_command(path: &Path) -> Command {
    let mut cmd = Command::new("gunzip");
    cmd.arg("-d").arg(path);
    cmd
}

fn run_tool(mut cmd: Command, path: &Path, tool: DecompressTool) -> Result<(), DecompressError> {
    let status = cmd.status().map_err(|source| DecompressError::Spawn {
        path: path.to_path_buf(),
        source,
    })?;

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(DecompressError::Failed {
                path: path.to_path_buf(),
                tool,
                code,
            }),
            None => Err(DecompressError::Terminated {
                path: path.to_path_buf(),
                tool,
            }),
        }
    }
}

/// Decompress one file in place, returning the tool that succeeded.
///
/// A failure to start `uncompress` triggers the `gunzip` fallback; a non-zero
/// exit of either tool is an error.
pub fn decompress_file(path: &Path) -> Result<DecompressTool, DecompressError> {
    match run_tool(build_uncompress_command(path), path, DecompressTool::Uncompress) {
        Ok(()) => Ok(DecompressTool::Uncompress),
        Err(DecompressError::Spawn { .. }) => {
            run_tool(build_gunzip_command(path), path, DecompressTool::Gunzip)?;
            Ok(DecompressTool::Gunzip)
        }
        Err(e) => Err(e),
    }
}

/// Partition `items` into consecutive batches of at most `workers` entries.
pub fn plan_batches<T>(items: &[T], workers: usize) -> Vec<&[T]> {
    items.chunks(workers.max(1)).collect()
}

/// Decompress `files` in batches of `workers`, returning how many were processed.
///
/// Every task of a batch is awaited before the first error of that batch is
/// returned, so no decompression is left running past this call.
pub async fn decompress_all(
    files: Vec<PathBuf>,
    workers: usize,
    diags: &mut Diagnostics,
) -> Result<usize, DecompressError> {
    if files.is_empty() {
        return Ok(0);
    }

    let batches = plan_batches(&files, workers);
    tracing::info!(
        files = files.len(),
        batches = batches.len(),
        workers = workers.max(1),
        "Uncompressing input files"
    );

    let mut done = 0;
    for (i, batch) in batches.iter().enumerate() {
        tracing::debug!(batch = i + 1, of = batches.len(), "Starting decompression batch");

        let handles: Vec<_> = batch
            .iter()
            .cloned()
            .map(|path| {
                tokio::task::spawn_blocking(move || {
                    let result = decompress_file(&path);
                    (path, result)
                })
            })
            .collect();

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok((path, Ok(tool))) => {
                    done += 1;
                    if tool == DecompressTool::Gunzip {
                        diags.info(
                            DiagnosticCode::DecompressFallback,
                            format!("uncompress unavailable, used gunzip for {}", path.display()),
                        );
                    }
                }
                Ok((_, Err(e))) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(DecompressError::Join(e.to_string()));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
    }

    Ok(done)
}
