//! Host-side checks for secret mounts.
//!
//! Only existence and readability are checked; contents are never read
//! beyond opening the file.

use std::path::{Path, PathBuf};

fn canonicalize_existing(path: &Path) -> Result<PathBuf, String> {
    path.canonicalize().map_err(|e| {
        format!(
            "mount path '{}' is invalid or does not exist: {}",
            path.display(),
            e
        )
    })
}

fn check_readable(path: &Path) -> Result<(), String> {
    let readable = if path.is_dir() {
        std::fs::read_dir(path).map(|_| ())
    } else {
        std::fs::File::open(path).map(|_| ())
    };
    readable.map_err(|e| format!("mount path '{}' is not readable: {}", path.display(), e))
}

fn check_writable(path: &Path) -> Result<(), String> {
    let meta = std::fs::metadata(path)
        .map_err(|e| format!("mount path '{}': {}", path.display(), e))?;
    if meta.permissions().readonly() {
        return Err(format!(
            "mount path '{}' is read-only but mounted read-write",
            path.display()
        ));
    }
    Ok(())
}

/// Validate a resolved host path and return its canonical form.
pub fn check_host_path(path: &Path, read_only: bool) -> Result<PathBuf, String> {
    let host_path = canonicalize_existing(path)?;
    check_readable(&host_path)?;
    if !read_only {
        check_writable(&host_path)?;
    }
    Ok(host_path)
}
