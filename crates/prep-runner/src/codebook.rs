use crate::fsutil::atomic_write_bytes;
use crate::schema::CanonicalField;
use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodebookConfig {
    #[serde(default = "default_codebook_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub descriptions: BTreeMap<String, String>,
}

fn default_codebook_path() -> PathBuf {
    PathBuf::from("CODEBOOK.csv")
}

/// Writes `column_name,description` rows for `columns` unless a codebook
/// already exists at `path`. Returns whether a file was written.
pub fn write_codebook(
    path: &Path,
    columns: &[String],
    descriptions: &BTreeMap<String, String>,
) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["column_name", "description"])?;
    for column in columns {
        let description = descriptions
            .get(column)
            .map(String::as_str)
            .or_else(|| CanonicalField::from_column(column).map(|f| f.description()))
            .unwrap_or("");
        writer.write_record([column.as_str(), description])?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    atomic_write_bytes(path, &bytes)?;
    Ok(true)
}
