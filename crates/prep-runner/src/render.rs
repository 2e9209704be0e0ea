//! Folds each participant's canonical trials into one JSONL record. All
//! wording comes from the profile's `render` block.

use crate::fsutil::atomic_write_bytes;
use crate::schema::{CanonicalField, FieldKind};
use crate::table::{Cell, Table};
use anyhow::Result;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderConfig {
    /// Canonical table to read; defaults to the profile's first output.
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default = "default_render_output")]
    pub output: PathBuf,
    #[serde(default)]
    pub instruction: String,
    pub trial_template: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Trials whose stimulus does not split on single spaces into exactly
    /// this many tokens are left out of the document.
    #[serde(default)]
    pub stimulus_tokens: Option<usize>,
    #[serde(default)]
    pub metadata: Vec<CanonicalField>,
}

fn default_render_output() -> PathBuf {
    PathBuf::from("prompts.jsonl")
}

fn default_separator() -> String {
    "\n".to_string()
}

fn default_suffix() -> String {
    "\n".to_string()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderSummary {
    pub output: PathBuf,
    pub participants: usize,
    pub trials_rendered: usize,
    pub trials_skipped: usize,
    pub skipped_by_participant: BTreeMap<String, usize>,
}

/// Replaces `{key}` with `lookup(key)`; unknown keys stay verbatim.
pub fn fill_template<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match lookup(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn metadata_value(field: CanonicalField, cell: &Cell) -> Value {
    match field.kind() {
        FieldKind::Flag => Value::Bool(cell.is_truthy()),
        FieldKind::Numeric => match cell.coerce_numeric() {
            Cell::Int(v) => Value::from(v),
            Cell::Float(v) => serde_json::Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            _ => Value::String(cell.render()),
        },
        FieldKind::Identifier | FieldKind::Text => Value::String(cell.render()),
    }
}

/// Builds one record per participant, ascending by participant_id, each
/// document listing that participant's trials by trial_id.
pub fn render_records(
    table: &Table,
    experiment: &str,
    cfg: &RenderConfig,
) -> (Vec<Value>, RenderSummary) {
    let mut summary = RenderSummary::default();
    let pid_idx = table.column_index(CanonicalField::ParticipantId.as_str());
    let tid_idx = table.column_index(CanonicalField::TrialId.as_str());
    let stim_idx = table.column_index(CanonicalField::Stimulus.as_str());

    let mut order: Vec<usize> = (0..table.len()).collect();
    order.sort_by(|&a, &b| {
        let by_pid = match pid_idx {
            Some(p) => table.cell(a, p).sort_cmp(table.cell(b, p)),
            None => std::cmp::Ordering::Equal,
        };
        by_pid.then_with(|| match tid_idx {
            Some(t) => table.cell(a, t).sort_cmp(table.cell(b, t)),
            None => std::cmp::Ordering::Equal,
        })
    });

    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for row in order {
        let pid = pid_idx
            .map(|p| table.cell(row, p).render())
            .unwrap_or_default();
        if let Some((last, rows)) = groups.last_mut() {
            if *last == pid {
                rows.push(row);
                continue;
            }
        }
        groups.push((pid, vec![row]));
    }

    let mut records = Vec::with_capacity(groups.len());
    for (pid, rows) in groups {
        let mut trials: Vec<String> = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for &row in &rows {
            let stimulus = stim_idx
                .map(|s| table.cell(row, s).render())
                .unwrap_or_default();
            let tokens: Vec<&str> = stimulus.split(' ').collect();
            if let Some(n) = cfg.stimulus_tokens {
                if tokens.len() != n {
                    debug!(participant = %pid, stimulus = %stimulus, "trial skipped: stimulus shape");
                    skipped += 1;
                    continue;
                }
            }
            let trial_number = trials.len() + 1;
            let text = fill_template(&cfg.trial_template, |key| {
                if key == "trial_number" {
                    return Some(trial_number.to_string());
                }
                if let Some(n) = key.strip_prefix("stimulus.") {
                    let i: usize = n.parse().ok()?;
                    return Some(tokens.get(i).copied().unwrap_or_default().to_string());
                }
                table
                    .column_index(key)
                    .map(|c| table.cell(row, c).render())
            });
            trials.push(text);
        }

        let mut record = Map::new();
        record.insert("participant".to_string(), Value::String(pid.clone()));
        record.insert(
            "experiment".to_string(),
            Value::String(experiment.to_string()),
        );
        record.insert(
            "text".to_string(),
            Value::String(format!(
                "{}{}{}",
                cfg.instruction,
                trials.join(&cfg.separator),
                cfg.suffix
            )),
        );
        if let Some(&first) = rows.first() {
            for field in &cfg.metadata {
                if let Some(c) = table.column_index(field.as_str()) {
                    let cell = table.cell(first, c);
                    if !cell.is_missing() {
                        record.insert(field.as_str().to_string(), metadata_value(*field, cell));
                    }
                }
            }
        }

        summary.trials_rendered += trials.len();
        summary.trials_skipped += skipped;
        if skipped > 0 {
            summary.skipped_by_participant.insert(pid, skipped);
        }
        records.push(Value::Object(record));
    }
    summary.participants = records.len();
    (records, summary)
}

pub fn write_jsonl(path: &Path, records: &[Value]) -> Result<()> {
    let mut bytes = Vec::new();
    for record in records {
        serde_json::to_writer(&mut bytes, record)?;
        bytes.push(b'\n');
    }
    atomic_write_bytes(path, &bytes)
}

/// Reads a canonical table, renders it and writes one JSON object per line.
pub fn render_file(
    canonical: &Path,
    experiment: &str,
    cfg: &RenderConfig,
    output: &Path,
) -> Result<RenderSummary> {
    let table = crate::table::read_table(canonical, crate::table::Delimiter::Comma)?;
    let (records, mut summary) = render_records(&table, experiment, cfg);
    write_jsonl(output, &records)?;
    summary.output = output.to_path_buf();
    info!(
        output = %output.display(),
        participants = summary.participants,
        trials = summary.trials_rendered,
        skipped = summary.trials_skipped,
        "prompts written"
    );
    Ok(summary)
}
