use anyhow::Result;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a sibling temp file and renames it over `path`, so a
/// reader never observes a half-written output.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Output location when a profile does not name one: next to the nearest
/// `original_data` ancestor, else beside the input, in `processed_data/`.
pub fn derived_output_path(input: &Path, ordinal: usize) -> PathBuf {
    let mut out_parent = None;
    for p in input.ancestors().skip(1) {
        if p.file_name().and_then(|s| s.to_str()) == Some("original_data") {
            out_parent = p.parent().map(Path::to_path_buf);
            break;
        }
    }
    let out_parent = out_parent
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    out_parent
        .join("processed_data")
        .join(format!("exp{}.csv", ordinal + 1))
}

#[cfg(test)]
pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "prep_{}_test_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}
