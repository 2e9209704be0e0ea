//! Normalization of raw psycholinguistic trial exports into a canonical
//! trial-level table, plus the prompt rendering that consumes it.

pub mod codebook;
pub mod columns;
pub mod error;
pub mod fsutil;
pub mod identity;
pub mod profile;
pub mod project;
pub mod render;
pub mod schema;
pub mod table;
pub mod transforms;
pub mod trials;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

pub use crate::error::{PrepError, PrepResult};
pub use crate::identity::{AnonymizationMap, IdOrdering, ParticipantIdentityMap};
pub use crate::profile::{
    load_profile, DuplicatePolicy, Profile, PROFILE_FILE_NAME, STARTER_PROFILE,
};
pub use crate::render::RenderSummary;
pub use crate::schema::CanonicalField;
pub use crate::table::{Cell, Delimiter, Table};

use crate::columns::{coerce_types, resolve_columns, synthesize_defaults, AliasTable};
use crate::schema::FieldKind;
use crate::trials::{index_trials, TrialSource};

/// State scoped to one run. Holds the anonymization map so every input of
/// a profile sees the same code for the same participant.
#[derive(Debug)]
pub struct RunContext {
    pub anonymizer: AnonymizationMap,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(seed: u64) -> Self {
        Self {
            anonymizer: AnonymizationMap::new(seed),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeStats {
    pub rows: usize,
    pub participants: usize,
    pub columns: Vec<String>,
    pub synthesized: Vec<String>,
    pub dropped_columns: Vec<String>,
    pub overlong_rows: usize,
    pub duplicates_dropped: usize,
    pub rows_filtered: usize,
    pub unparsed_numeric: usize,
    pub transforms_skipped: usize,
    pub trial_source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeSummary {
    pub input: PathBuf,
    pub output: PathBuf,
    pub stats: NormalizeStats,
}

pub fn normalize_table(
    mut table: Table,
    profile: &Profile,
    ctx: &mut RunContext,
) -> PrepResult<(Table, NormalizeStats)> {
    let mut stats = NormalizeStats {
        overlong_rows: table.overlong_rows(),
        ..NormalizeStats::default()
    };

    stats.dropped_columns = table.drop_columns(|h| {
        h.trim().is_empty() || profile.drop_prefixes.iter().any(|p| h.starts_with(p.as_str()))
    });

    let resolution = resolve_columns(&mut table, &profile.aliases);
    let report = transforms::apply_transforms(&mut table, &profile.transforms);
    stats.transforms_skipped = report.skipped;
    stats.rows_filtered = report.rows_removed;

    // before synthesis: positional ids would make every row distinct
    stats.duplicates_dropped = drop_duplicates(&mut table, &profile.drop_duplicates, &profile.aliases);

    let synthesized = synthesize_defaults(&mut table, &profile.required, profile.participant.fallback)?;
    stats.synthesized = synthesized.iter().map(|f| f.as_str().to_string()).collect();

    stats.unparsed_numeric = coerce_types(&mut table);

    stats.participants = assign_participants(&mut table, profile, ctx)?;

    let source = index_trials(&mut table, &profile.trial)?;
    stats.trial_source = match source {
        TrialSource::Column { name, .. } => name,
        TrialSource::RunningCount => "running_count".to_string(),
    };

    let out = project::project(&table, &profile.output);
    stats.rows = out.len();
    stats.columns = out.headers().to_vec();
    info!(
        renamed = resolution.renamed.len(),
        passthrough = resolution.passthrough.len(),
        rows = stats.rows,
        participants = stats.participants,
        synthesized = ?stats.synthesized,
        trial_source = %stats.trial_source,
        "table normalized"
    );
    if stats.unparsed_numeric > 0 {
        warn!(
            cells = stats.unparsed_numeric,
            "non-numeric values in numeric columns replaced with missing"
        );
    }
    Ok((out, stats))
}

fn drop_duplicates(table: &mut Table, policy: &DuplicatePolicy, aliases: &AliasTable) -> usize {
    match policy {
        DuplicatePolicy::WholeRow(false) => 0,
        DuplicatePolicy::WholeRow(true) => table.drop_duplicate_rows(),
        DuplicatePolicy::Columns(names) => {
            let mut cols = Vec::with_capacity(names.len());
            for name in names {
                // raw names still match after their column was renamed
                let idx = table.find_column_ci(name).or_else(|| {
                    CanonicalField::from_column(name)
                        .or_else(|| aliases.target(name))
                        .and_then(|f| table.column_index(f.as_str()))
                });
                match idx {
                    Some(idx) => cols.push(idx),
                    None => warn!(column = %name, "duplicate key column absent; ignored"),
                }
            }
            if cols.is_empty() {
                0
            } else {
                table.drop_duplicate_rows_by(&cols)
            }
        }
    }
}

fn assign_participants(
    table: &mut Table,
    profile: &Profile,
    ctx: &mut RunContext,
) -> PrepResult<usize> {
    let idx = table
        .column_index(CanonicalField::ParticipantId.as_str())
        .ok_or(PrepError::NoParticipantSource)?;
    let raw: Vec<String> = table
        .column(idx)
        .map(|c| {
            let mut id = c.render();
            for s in &profile.participant.strip {
                id = id.replace(s.as_str(), "");
            }
            id
        })
        .collect();

    let cfg = &profile.participant;
    let map = ParticipantIdentityMap::build(raw.iter(), cfg.ordering);
    let values: Vec<Cell> = match cfg.ordering {
        IdOrdering::Anonymized => raw
            .iter()
            .map(|id| Cell::Text(ctx.anonymizer.code_for(id)))
            .collect(),
        IdOrdering::NumericSuffix | IdOrdering::FirstAppearance => raw
            .iter()
            .map(|id| match map.get(id) {
                Some(dense) => Cell::Int(cfg.base + dense as i64),
                None => Cell::Missing,
            })
            .collect(),
    };
    table.set_column(CanonicalField::ParticipantId.as_str(), values);
    Ok(map.len())
}

/// Reads `input`, normalizes it and writes the canonical table to `output`.
/// A missing input fails before anything is written.
pub fn normalize_file(
    input: &Path,
    output: &Path,
    delimiter: Delimiter,
    profile: &Profile,
    ctx: &mut RunContext,
) -> Result<NormalizeSummary> {
    let (out, stats) = read_and_normalize(input, delimiter, profile, ctx)?;
    write_normalized(input, output, &out, stats)
}

fn read_and_normalize(
    input: &Path,
    delimiter: Delimiter,
    profile: &Profile,
    ctx: &mut RunContext,
) -> Result<(Table, NormalizeStats)> {
    let table = table::read_table(input, delimiter)?;
    let normalized = normalize_table(table, profile, ctx)
        .with_context(|| format!("normalizing {}", input.display()))?;
    Ok(normalized)
}

fn write_normalized(
    input: &Path,
    output: &Path,
    table: &Table,
    stats: NormalizeStats,
) -> Result<NormalizeSummary> {
    project::write_table(output, table)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(input = %input.display(), output = %output.display(), rows = stats.rows, "wrote processed csv");
    Ok(NormalizeSummary {
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        stats,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRunSummary {
    pub experiment: String,
    pub profile: PathBuf,
    pub normalized: Vec<NormalizeSummary>,
    pub codebook: Option<PathBuf>,
    pub render: Option<RenderSummary>,
    pub started_at: DateTime<Utc>,
}

pub fn run_profile(profile_path: &Path) -> Result<ProfileRunSummary> {
    let profile = load_profile(profile_path)?;
    if profile.inputs.is_empty() {
        return Err(PrepError::Config(format!(
            "profile {} lists no inputs",
            profile_path.display()
        ))
        .into());
    }
    let mut ctx = RunContext::new(profile.participant.anonymize_seed);

    // every input is read and normalized before any output is written
    let mut pending = Vec::with_capacity(profile.inputs.len());
    for (i, spec) in profile.inputs.iter().enumerate() {
        let input = profile.resolve(&spec.path);
        let output = match &spec.output {
            Some(p) => profile.resolve(p),
            None => fsutil::derived_output_path(&input, i),
        };
        let (table, stats) = read_and_normalize(&input, spec.delimiter, &profile, &mut ctx)?;
        pending.push((input, output, table, stats));
    }
    let mut normalized = Vec::with_capacity(pending.len());
    for (input, output, table, stats) in pending {
        normalized.push(write_normalized(&input, &output, &table, stats)?);
    }

    let codebook = match &profile.codebook {
        Some(cfg) => {
            let path = profile.resolve(&cfg.path);
            let columns = &normalized[0].stats.columns;
            if codebook::write_codebook(&path, columns, &cfg.descriptions)? {
                info!(path = %path.display(), "codebook written");
            }
            Some(path)
        }
        None => None,
    };

    let render = match &profile.render {
        Some(cfg) => {
            let source = match &cfg.source {
                Some(p) => profile.resolve(p),
                None => normalized[0].output.clone(),
            };
            let output = profile.resolve(&cfg.output);
            Some(render::render_file(&source, &profile.experiment, cfg, &output)?)
        }
        None => None,
    };

    Ok(ProfileRunSummary {
        experiment: profile.experiment.clone(),
        profile: profile_path.to_path_buf(),
        normalized,
        codebook,
        render,
        started_at: ctx.started_at,
    })
}

pub fn render_prompts(
    canonical: &Path,
    profile: &Profile,
    output: Option<&Path>,
) -> Result<RenderSummary> {
    let cfg = profile
        .render
        .as_ref()
        .ok_or_else(|| anyhow!("profile for {} has no render block", profile.experiment))?;
    let output = match output {
        Some(p) => p.to_path_buf(),
        None => profile.resolve(&cfg.output),
    };
    render::render_file(canonical, &profile.experiment, cfg, &output)
}

#[derive(Debug)]
pub struct BatchEntry {
    pub profile: PathBuf,
    pub outcome: Result<ProfileRunSummary>,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub entries: Vec<BatchEntry>,
}

impl BatchSummary {
    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.is_err()).count()
    }
}

pub fn find_profiles(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(PrepError::InputMissing {
            path: root.to_path_buf(),
        }
        .into());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name() == PROFILE_FILE_NAME {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

/// Runs every profile under `root`; one failing experiment does not stop the rest.
pub fn run_batch(root: &Path) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();
    for profile in find_profiles(root)? {
        let outcome = run_profile(&profile);
        if let Err(err) = &outcome {
            warn!(profile = %profile.display(), error = %err, "experiment failed");
        }
        summary.entries.push(BatchEntry { profile, outcome });
    }
    Ok(summary)
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputDescription {
    pub input: PathBuf,
    pub output: PathBuf,
    pub exists: bool,
    pub delimiter: Delimiter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDescription {
    pub experiment: String,
    pub inputs: Vec<InputDescription>,
    pub aliases: Vec<(String, CanonicalField)>,
    pub required: Vec<CanonicalField>,
    pub flags_defaulted: Vec<CanonicalField>,
    pub ordering: IdOrdering,
    pub participant_base: i64,
    pub trial: String,
    pub transforms: Vec<String>,
    pub codebook: Option<PathBuf>,
    pub render_output: Option<PathBuf>,
}

pub fn describe_profile(profile_path: &Path) -> Result<ProfileDescription> {
    let profile = load_profile(profile_path)?;
    let inputs = profile
        .inputs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let input = profile.resolve(&spec.path);
            let output = match &spec.output {
                Some(p) => profile.resolve(p),
                None => fsutil::derived_output_path(&input, i),
            };
            InputDescription {
                exists: input.is_file(),
                input,
                output,
                delimiter: spec.delimiter,
            }
        })
        .collect();
    let trial = match &profile.trial.source {
        Some(source) => format!(
            "{} ({:?}, base {})",
            source, profile.trial.mode, profile.trial.base
        ),
        None => format!("running_count (base {})", profile.trial.base),
    };
    Ok(ProfileDescription {
        experiment: profile.experiment.clone(),
        inputs,
        aliases: profile
            .aliases
            .entries()
            .map(|(a, f)| (a.to_string(), f))
            .collect(),
        required: profile.required.clone(),
        flags_defaulted: profile
            .required
            .iter()
            .copied()
            .filter(|f| f.kind() == FieldKind::Flag)
            .collect(),
        ordering: profile.participant.ordering,
        participant_base: profile.participant.base,
        trial,
        transforms: profile
            .transforms
            .iter()
            .map(|t| t.name().to_string())
            .collect(),
        codebook: profile.codebook.as_ref().map(|c| profile.resolve(&c.path)),
        render_output: profile.render.as_ref().map(|r| profile.resolve(&r.output)),
    })
}

pub fn write_starter_profile(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow!(
            "profile already exists (use --force): {}",
            path.display()
        ));
    }
    fsutil::atomic_write_bytes(path, STARTER_PROFILE.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(table: &Table, name: &str) -> Vec<String> {
        table
            .column_by_name(name)
            .expect("column")
            .iter()
            .map(Cell::render)
            .collect()
    }

    #[test]
    fn end_to_end_example_orders_by_suffix() {
        let raw = Table::from_records(
            &["id", "resp"],
            &[&["s_2", "cat"], &["s_1", "dog"], &["s_2", "mouse"]],
        );
        let mut profile = Profile::default();
        profile.aliases.insert("id", CanonicalField::ParticipantId);
        profile.aliases.insert("resp", CanonicalField::Response);
        let mut ctx = RunContext::new(1);
        let (out, stats) = normalize_table(raw, &profile, &mut ctx).expect("normalize");
        assert_eq!(out.headers(), &["participant_id", "trial_id", "response"]);
        assert_eq!(ids(&out, "participant_id"), vec!["0", "1", "1"]);
        assert_eq!(ids(&out, "trial_id"), vec!["0", "0", "1"]);
        assert_eq!(ids(&out, "response"), vec!["dog", "cat", "mouse"]);
        assert_eq!(stats.participants, 2);
        assert_eq!(stats.trial_source, "running_count");
    }

    #[test]
    fn stripped_prefixes_and_one_based_ids() {
        let raw = Table::from_records(
            &["participant", "word"],
            &[&["association_7.csv", "a"], &["association_3.csv", "b"]],
        );
        let mut profile = Profile::default();
        profile.participant.strip = vec!["association_".into(), ".csv".into()];
        profile.participant.base = 1;
        let mut ctx = RunContext::new(1);
        let (out, _) = normalize_table(raw, &profile, &mut ctx).expect("normalize");
        assert_eq!(ids(&out, "participant_id"), vec!["1", "2"]);
    }

    #[test]
    fn anonymized_codes_are_shared_across_tables_in_one_run() {
        let mut profile = Profile::default();
        profile.participant.ordering = IdOrdering::Anonymized;
        let mut ctx = RunContext::new(7);
        let first = Table::from_records(&["participant"], &[&["PROLIFIC_A"], &["PROLIFIC_B"]]);
        let second = Table::from_records(&["participant"], &[&["PROLIFIC_B"]]);
        let (a, _) = normalize_table(first, &profile, &mut ctx).expect("first");
        let (b, _) = normalize_table(second, &profile, &mut ctx).expect("second");
        let a_ids = ids(&a, "participant_id");
        let b_ids = ids(&b, "participant_id");
        assert!(a_ids.contains(&b_ids[0]));
        assert!(a_ids.iter().all(|c| c.len() == 6));
        assert_eq!(ctx.anonymizer.len(), 2);
    }

    #[test]
    fn duplicates_drop_before_positional_ids_are_synthesized() {
        let raw = Table::from_records(
            &["cue", "response"],
            &[&["dog", "cat"], &["dog", "cat"], &["sun", "moon"]],
        );
        let mut profile = Profile::default();
        profile.drop_duplicates = DuplicatePolicy::WholeRow(true);
        let mut ctx = RunContext::new(1);
        let (out, stats) = normalize_table(raw, &profile, &mut ctx).expect("normalize");
        assert_eq!(stats.duplicates_dropped, 1);
        assert_eq!(stats.synthesized, vec!["participant_id".to_string()]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn subset_duplicates_and_range_filter_follow_profile() {
        let raw = Table::from_records(
            &["participant", "cue", "response", "resp_num"],
            &[
                &["p_1", "dog", "cat", "1"],
                &["p_1", "dog", "bone", "2"],
                &["p_1", "sun", "moon", "11"],
                &["p_2", "dog", "cat", "1"],
            ],
        );
        let mut profile = Profile::default();
        profile.drop_duplicates = DuplicatePolicy::Columns(vec!["participant".into(), "cue".into()]);
        profile.transforms = vec![transforms::Transform::Filter {
            column: "resp_num".into(),
            min: Some(1.0),
            max: Some(10.0),
            values: Vec::new(),
        }];
        profile.output.keep_extra = true;
        let mut ctx = RunContext::new(1);
        let (out, stats) = normalize_table(raw, &profile, &mut ctx).expect("normalize");
        assert_eq!(stats.rows_filtered, 1);
        assert_eq!(stats.duplicates_dropped, 1);
        assert_eq!(ids(&out, "response"), vec!["cat", "cat"]);
        assert_eq!(ids(&out, "participant_id"), vec!["0", "1"]);
    }

    #[test]
    fn unnamed_index_columns_are_dropped() {
        let raw = Table::from_records(&["Unnamed: 0", "", "ppn"], &[&["0", "x", "ppt_1"]]);
        let mut ctx = RunContext::new(1);
        let (_, stats) = normalize_table(raw, &Profile::default(), &mut ctx).expect("normalize");
        assert_eq!(stats.dropped_columns, vec!["Unnamed: 0".to_string(), String::new()]);
    }
}
