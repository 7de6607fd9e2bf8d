//! Whole-file rewrites for the registry and metadata documents.

use std::fs;
use std::io;
use std::path::Path;

/// Replace `path` with `body` by writing a sibling temp file and renaming it
/// over the target, so readers never observe a truncated document.
///
/// Concurrent writers are not coordinated; callers serialize access.
pub fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    fs::write(&tmp, body)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    Ok(())
}
