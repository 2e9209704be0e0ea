use crate::table::{Cell, Table};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Transform {
    Copy {
        from: String,
        to: String,
    },
    Concat {
        columns: Vec<String>,
        #[serde(default)]
        separator: String,
        to: String,
    },
    Recode {
        from: String,
        to: String,
        map: BTreeMap<String, String>,
        #[serde(default)]
        default: Option<String>,
    },
    Lowercase {
        column: String,
    },
    SuffixWhen {
        column: String,
        flag: String,
        suffix: String,
    },
    /// Keeps rows whose value is in `values` and, when bounds are given,
    /// parses as a number within `min..=max`.
    Filter {
        column: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        values: Vec<String>,
    },
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Copy { .. } => "copy",
            Transform::Concat { .. } => "concat",
            Transform::Recode { .. } => "recode",
            Transform::Lowercase { .. } => "lowercase",
            Transform::SuffixWhen { .. } => "suffix_when",
            Transform::Filter { .. } => "filter",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub skipped: usize,
    pub rows_removed: usize,
}

pub fn apply_transforms(table: &mut Table, transforms: &[Transform]) -> TransformReport {
    let mut report = TransformReport::default();
    for t in transforms {
        match apply_one(table, t) {
            Some(removed) => report.rows_removed += removed,
            None => {
                debug!(transform = t.name(), "transform skipped: source column absent");
                report.skipped += 1;
            }
        }
    }
    report
}

fn filter_rows(
    table: &mut Table,
    column: &str,
    min: Option<f64>,
    max: Option<f64>,
    values: &[String],
) -> Option<usize> {
    let idx = table.column_index(column)?;
    let keep: Vec<bool> = table
        .column(idx)
        .map(|cell| {
            let text = cell.render();
            let in_set = values.is_empty() || values.iter().any(|v| v == text.trim());
            let in_range = if min.is_none() && max.is_none() {
                true
            } else {
                match cell.to_f64() {
                    Some(v) => min.map_or(true, |lo| v >= lo) && max.map_or(true, |hi| v <= hi),
                    None => false,
                }
            };
            in_set && in_range
        })
        .collect();
    Some(table.retain_rows(&keep))
}

fn apply_one(table: &mut Table, transform: &Transform) -> Option<usize> {
    match transform {
        Transform::Copy { from, to } => match table.column_by_name(from) {
            Some(values) => {
                table.set_column(to, values);
                Some(0)
            }
            None => None,
        },
        Transform::Concat {
            columns,
            separator,
            to,
        } => {
            // absent parts render as empty, like missing cells
            if columns.iter().all(|c| table.column_index(c).is_none()) {
                return None;
            }
            let idxs: Vec<Option<usize>> = columns.iter().map(|c| table.column_index(c)).collect();
            let values = table
                .rows()
                .iter()
                .map(|row| {
                    let parts: Vec<String> = idxs
                        .iter()
                        .map(|i| i.map(|i| row[i].render().trim().to_string()).unwrap_or_default())
                        .collect();
                    Cell::Text(parts.join(separator))
                })
                .collect();
            table.set_column(to, values);
            Some(0)
        }
        Transform::Recode {
            from,
            to,
            map,
            default,
        } => {
            let fallback = || default.clone().map(Cell::Text).unwrap_or(Cell::Missing);
            let values: Vec<Cell> = match table.column_index(from) {
                Some(idx) => table
                    .column(idx)
                    .map(|c| {
                        map.get(c.render().trim())
                            .map(|v| Cell::Text(v.clone()))
                            .unwrap_or_else(fallback)
                    })
                    .collect(),
                None if default.is_some() => (0..table.len()).map(|_| fallback()).collect(),
                None => return None,
            };
            table.set_column(to, values);
            Some(0)
        }
        Transform::Lowercase { column } => match table.column_index(column) {
            Some(idx) => {
                table.map_column(idx, |c| match c {
                    Cell::Text(s) => Cell::Text(s.to_lowercase()),
                    other => other.clone(),
                });
                Some(0)
            }
            None => None,
        },
        Transform::SuffixWhen {
            column,
            flag,
            suffix,
        } => {
            let (Some(col), Some(flag_idx)) = (table.column_index(column), table.column_index(flag))
            else {
                return None;
            };
            let flags: Vec<bool> = table.column(flag_idx).map(Cell::is_truthy).collect();
            let mut row = 0usize;
            table.map_column(col, |c| {
                let out = if flags[row] {
                    Cell::Text(format!("{}{}", c.render(), suffix))
                } else {
                    c.clone()
                };
                row += 1;
                out
            });
            Some(0)
        }
        Transform::Filter {
            column,
            min,
            max,
            values,
        } => {
            let removed = filter_rows(table, column, *min, *max, values)?;
            debug!(column = %column, removed, "rows filtered");
            Some(removed)
        }
    }
}
