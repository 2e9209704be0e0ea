use crate::fsutil::atomic_write_bytes;
use crate::schema::CanonicalField;
use crate::table::Table;
use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Canonical column order; empty means the declared canonical order.
    #[serde(default)]
    pub columns: Vec<CanonicalField>,
    /// Keep unmapped columns after the canonical ones.
    #[serde(default)]
    pub keep_extra: bool,
}

impl OutputConfig {
    fn ordered_fields(&self) -> Vec<CanonicalField> {
        let mut fields: Vec<CanonicalField> = if self.columns.is_empty() {
            CanonicalField::ALL.to_vec()
        } else {
            self.columns.clone()
        };
        // identifiers always lead
        fields.retain(|f| !matches!(f, CanonicalField::ParticipantId | CanonicalField::TrialId));
        let mut out = vec![CanonicalField::ParticipantId, CanonicalField::TrialId];
        out.extend(fields);
        out
    }
}

/// Selects the output columns and sorts by (participant_id, trial_id).
pub fn project(table: &Table, cfg: &OutputConfig) -> Table {
    let mut names: Vec<String> = cfg
        .ordered_fields()
        .iter()
        .map(|f| f.as_str().to_string())
        .filter(|n| table.column_index(n).is_some())
        .collect();
    if cfg.keep_extra {
        for h in table.headers() {
            if !names.contains(h) && CanonicalField::from_column(h).is_none() {
                names.push(h.clone());
            }
        }
    }
    let mut out = table.select(&names);
    let keys: Vec<usize> = [CanonicalField::ParticipantId, CanonicalField::TrialId]
        .iter()
        .filter_map(|f| out.column_index(f.as_str()))
        .collect();
    out.sort_by_columns(&keys);
    out
}

/// Serializes with a header line, creating parent directories and
/// replacing any file already at `path`.
pub fn write_table(path: &Path, table: &Table) -> Result<()> {
    let bytes = table.to_csv_bytes()?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::scratch_dir;
    use crate::table::{read_table, Cell, Delimiter};
    use std::fs;

    fn indexed() -> Table {
        let mut t = Table::from_records(
            &["stimulus", "trial_id", "extra", "participant_id", "rt"],
            &[
                &["owl", "1", "x", "1", "300"],
                &["cat", "0", "y", "1", "200"],
                &["dog", "0", "z", "0", "100"],
            ],
        );
        for name in ["trial_id", "participant_id", "rt"] {
            let idx = t.column_index(name).expect("col");
            t.map_column(idx, Cell::coerce_numeric);
        }
        t
    }

    #[test]
    fn projection_uses_canonical_order_and_drops_extras() {
        let out = project(&indexed(), &OutputConfig::default());
        assert_eq!(out.headers(), &["participant_id", "trial_id", "rt", "stimulus"]);
        let stimuli: Vec<String> = out.column(3).map(Cell::render).collect();
        assert_eq!(stimuli, vec!["dog", "cat", "owl"]);
    }

    #[test]
    fn keep_extra_appends_unmapped_columns() {
        let cfg = OutputConfig {
            columns: vec![CanonicalField::Stimulus],
            keep_extra: true,
        };
        let out = project(&indexed(), &cfg);
        assert_eq!(out.headers(), &["participant_id", "trial_id", "stimulus", "extra"]);
    }

    #[test]
    fn written_table_reads_back_sorted_without_duplicates() {
        let root = scratch_dir("project");
        let path = root.join("processed_data").join("exp1.csv");
        fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        fs::write(&path, "stale contents\n").expect("stale");

        let out = project(&indexed(), &OutputConfig::default());
        write_table(&path, &out).expect("write");
        let back = read_table(&path, Delimiter::Comma).expect("read");
        assert_eq!(back.headers(), out.headers());
        let pairs: Vec<(String, String)> = back
            .rows()
            .iter()
            .map(|r| (r[0].render(), r[1].render()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("0".to_string(), "0".to_string()),
                ("1".to_string(), "0".to_string()),
                ("1".to_string(), "1".to_string()),
            ]
        );
        let _ = fs::remove_dir_all(root);
    }
}
