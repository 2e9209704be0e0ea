use crate::error::{PrepError, PrepResult};
use crate::schema::CanonicalField;
use crate::table::{Cell, Table};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialMode {
    #[default]
    Direct,
    /// Distinct values re-enumerated by first appearance within each participant.
    Factorize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrialConfig {
    /// Raw ordering column; falls back to an existing `trial_id` column.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub mode: TrialMode,
    #[serde(default)]
    pub base: i64,
    #[serde(default)]
    pub default: i64,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            source: None,
            mode: TrialMode::Direct,
            base: 0,
            default: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialSource {
    Column { name: String, mode: TrialMode },
    RunningCount,
}

/// Writes `trial_id` for every row. With an ordering column the values are
/// coerced and used directly or factorized; without one each row gets the
/// running count of its participant's rows seen so far, offset by `base`.
pub fn index_trials(table: &mut Table, cfg: &TrialConfig) -> PrepResult<TrialSource> {
    let pid_idx = table
        .column_index(CanonicalField::ParticipantId.as_str())
        .ok_or_else(|| PrepError::Config("trial indexing needs a participant_id column".into()))?;

    let source_idx = cfg
        .source
        .as_deref()
        .and_then(|name| table.find_column_ci(name))
        .or_else(|| table.column_index(CanonicalField::TrialId.as_str()));

    let participants: Vec<String> = table.column(pid_idx).map(Cell::render).collect();
    let mut values = Vec::with_capacity(table.len());

    let source = match source_idx {
        Some(idx) => {
            let ordering: Vec<i64> = table
                .column(idx)
                .map(|c| c.to_f64().map(|v| v.trunc() as i64).unwrap_or(cfg.default))
                .collect();
            match cfg.mode {
                TrialMode::Direct => values.extend(ordering.into_iter().map(Cell::Int)),
                TrialMode::Factorize => {
                    let mut seen: HashMap<&str, HashMap<i64, i64>> = HashMap::new();
                    for (pid, v) in participants.iter().zip(ordering) {
                        let codes = seen.entry(pid.as_str()).or_default();
                        let next = codes.len() as i64;
                        let code = *codes.entry(v).or_insert(next);
                        values.push(Cell::Int(cfg.base + code));
                    }
                }
            }
            TrialSource::Column {
                name: table.headers()[idx].clone(),
                mode: cfg.mode,
            }
        }
        None => {
            let mut counts: HashMap<&str, i64> = HashMap::new();
            for pid in &participants {
                let n = counts.entry(pid.as_str()).or_insert(0);
                values.push(Cell::Int(cfg.base + *n));
                *n += 1;
            }
            TrialSource::RunningCount
        }
    };

    table.set_column(CanonicalField::TrialId.as_str(), values);
    Ok(source)
}
