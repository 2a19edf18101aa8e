//! Executable lookup helpers.

use std::path::{Path, PathBuf};

/// Resolve an executable by name.
///
/// Explicit paths (absolute or containing a separator) are checked directly;
/// bare names go through a PATH lookup via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    which(executable).await
}

async fn which(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(|result| result.ok())
}
