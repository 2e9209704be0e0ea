use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use prep_runner::{
    BatchSummary, NormalizeSummary, PrepError, Profile, ProfileDescription, ProfileRunSummary,
    RenderSummary, RunContext,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "prep",
    version = "0.3.0",
    about = "Normalize psycholinguistic trial exports into canonical tables"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DelimiterArg {
    #[value(name = "auto")]
    Auto,
    #[value(name = "comma")]
    Comma,
    #[value(name = "tab")]
    Tab,
    #[value(name = "whitespace")]
    Whitespace,
}

impl From<DelimiterArg> for prep_runner::Delimiter {
    fn from(value: DelimiterArg) -> Self {
        match value {
            DelimiterArg::Auto => prep_runner::Delimiter::Auto,
            DelimiterArg::Comma => prep_runner::Delimiter::Comma,
            DelimiterArg::Tab => prep_runner::Delimiter::Tab,
            DelimiterArg::Whitespace => prep_runner::Delimiter::Whitespace,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Normalize {
        input_path: PathBuf,
        #[arg(long)]
        profile: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "auto")]
        delimiter: DelimiterArg,
        #[arg(long)]
        json: bool,
    },
    Run {
        profile: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Render {
        canonical: PathBuf,
        #[arg(long)]
        profile: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Batch {
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Describe {
        profile: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok") == Some(&Value::Bool(false)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<PrepError>()
                    .map(PrepError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Normalize {
            input_path,
            profile,
            out,
            delimiter,
            json,
        } => {
            let profile = match &profile {
                Some(path) => prep_runner::load_profile(path)?,
                None => Profile::default(),
            };
            let output = out
                .unwrap_or_else(|| prep_runner::fsutil::derived_output_path(&input_path, 0));
            let mut ctx = RunContext::new(profile.participant.anonymize_seed);
            let summary = prep_runner::normalize_file(
                &input_path,
                &output,
                delimiter.into(),
                &profile,
                &mut ctx,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "normalize",
                    "experiment": profile.experiment,
                    "normalized": normalize_summary_to_json(&summary)
                })));
            }
            print_normalize_summary(&summary);
        }
        Commands::Run { profile, json } => {
            let summary = prep_runner::run_profile(&profile)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": run_summary_to_json(&summary)
                })));
            }
            print_run_summary(&summary);
        }
        Commands::Render {
            canonical,
            profile,
            out,
            json,
        } => {
            let profile = prep_runner::load_profile(&profile)?;
            let summary = prep_runner::render_prompts(&canonical, &profile, out.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "render",
                    "experiment": profile.experiment,
                    "render": render_summary_to_json(&summary)
                })));
            }
            println!("experiment: {}", profile.experiment);
            print_render_summary(&summary);
        }
        Commands::Batch { root, json } => {
            let summary = prep_runner::run_batch(&root)?;
            if json {
                return Ok(Some(batch_summary_to_json(&summary)));
            }
            for entry in &summary.entries {
                match &entry.outcome {
                    Ok(run) => {
                        println!("profile: {}", entry.profile.display());
                        print_run_summary(run);
                    }
                    Err(err) => {
                        println!("profile: {}", entry.profile.display());
                        println!("error: {:#}", err);
                    }
                }
            }
            println!("experiments: {}", summary.entries.len());
            println!("failed: {}", summary.failed());
            if summary.failed() > 0 {
                return Err(anyhow::anyhow!(
                    "{} of {} experiments failed",
                    summary.failed(),
                    summary.entries.len()
                ));
            }
        }
        Commands::Describe { profile, json } => {
            let description = prep_runner::describe_profile(&profile)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "profile": description_to_json(&description)
                })));
            }
            print_description(&description);
        }
        Commands::Init { force } => {
            let root = std::env::current_dir()?;
            let path = root.join(prep_runner::PROFILE_FILE_NAME);
            prep_runner::write_starter_profile(&path, force)?;
            info!(path = %path.display(), "starter profile written");
            let shown = path.strip_prefix(&root).unwrap_or(&path).display();
            println!("wrote: {}", shown);
            println!("next: edit {} and fill in all fields marked REQUIRED", shown);
            println!("next: prep describe {}", shown);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Normalize { json, .. }
        | Commands::Run { json, .. }
        | Commands::Render { json, .. }
        | Commands::Batch { json, .. }
        | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn normalize_summary_to_json(summary: &NormalizeSummary) -> Value {
    let stats = &summary.stats;
    json!({
        "input": summary.input.display().to_string(),
        "output": summary.output.display().to_string(),
        "rows": stats.rows,
        "participants": stats.participants,
        "columns": stats.columns,
        "synthesized": stats.synthesized,
        "unparsed_numeric": stats.unparsed_numeric,
        "dropped_columns": stats.dropped_columns,
        "duplicates_dropped": stats.duplicates_dropped,
        "transforms_skipped": stats.transforms_skipped,
        "rows_filtered": stats.rows_filtered,
        "overlong_rows": stats.overlong_rows,
        "trial_source": stats.trial_source
    })
}

fn render_summary_to_json(summary: &RenderSummary) -> Value {
    json!({
        "output": summary.output.display().to_string(),
        "participants": summary.participants,
        "trials_rendered": summary.trials_rendered,
        "trials_skipped": summary.trials_skipped,
        "skipped_by_participant": summary.skipped_by_participant
    })
}

fn run_summary_to_json(summary: &ProfileRunSummary) -> Value {
    json!({
        "experiment": summary.experiment,
        "profile": summary.profile.display().to_string(),
        "started_at": summary.started_at.to_rfc3339(),
        "normalized": summary
            .normalized
            .iter()
            .map(normalize_summary_to_json)
            .collect::<Vec<_>>(),
        "codebook": summary.codebook.as_ref().map(|p| p.display().to_string()),
        "render": summary.render.as_ref().map(render_summary_to_json)
    })
}

fn batch_summary_to_json(summary: &BatchSummary) -> Value {
    let entries: Vec<Value> = summary
        .entries
        .iter()
        .map(|entry| match &entry.outcome {
            Ok(run) => json!({
                "profile": entry.profile.display().to_string(),
                "ok": true,
                "run": run_summary_to_json(run)
            }),
            Err(err) => json!({
                "profile": entry.profile.display().to_string(),
                "ok": false,
                "error": {
                    "code": err.downcast_ref::<PrepError>().map(PrepError::code).unwrap_or("command_failed"),
                    "message": format!("{:#}", err)
                }
            }),
        })
        .collect();
    json!({
        "ok": summary.failed() == 0,
        "command": "batch",
        "experiments": summary.entries.len(),
        "failed": summary.failed(),
        "entries": entries
    })
}

fn description_to_json(description: &ProfileDescription) -> Value {
    json!({
        "experiment": description.experiment,
        "inputs": description
            .inputs
            .iter()
            .map(|i| json!({
                "input": i.input.display().to_string(),
                "output": i.output.display().to_string(),
                "exists": i.exists,
                "delimiter": format!("{:?}", i.delimiter).to_lowercase()
            }))
            .collect::<Vec<_>>(),
        "aliases": description
            .aliases
            .iter()
            .map(|(alias, field)| json!({ "alias": alias, "field": field.as_str() }))
            .collect::<Vec<_>>(),
        "required": description.required.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
        "flags_defaulted": description
            .flags_defaulted
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>(),
        "participant_ordering": format!("{:?}", description.ordering),
        "participant_base": description.participant_base,
        "trial": description.trial,
        "transforms": description.transforms,
        "codebook": description.codebook.as_ref().map(|p| p.display().to_string()),
        "render_output": description.render_output.as_ref().map(|p| p.display().to_string())
    })
}

fn print_normalize_summary(summary: &NormalizeSummary) {
    let stats = &summary.stats;
    println!("input: {}", summary.input.display());
    println!("output: {}", summary.output.display());
    println!("rows: {}", stats.rows);
    println!("participants: {}", stats.participants);
    println!("columns: {}", stats.columns.join(","));
    if !stats.synthesized.is_empty() {
        println!("synthesized: {}", stats.synthesized.join(","));
    }
    if !stats.dropped_columns.is_empty() {
        println!("dropped_columns: {:?}", stats.dropped_columns);
    }
    if stats.duplicates_dropped > 0 {
        println!("duplicates_dropped: {}", stats.duplicates_dropped);
    }
    println!("unparsed_numeric: {}", stats.unparsed_numeric);
    if stats.transforms_skipped > 0 {
        println!("transforms_skipped: {}", stats.transforms_skipped);
    }
    if stats.rows_filtered > 0 {
        println!("rows_filtered: {}", stats.rows_filtered);
    }
    if stats.overlong_rows > 0 {
        println!("overlong_rows: {}", stats.overlong_rows);
    }
    println!("trial_source: {}", stats.trial_source);
}

fn print_render_summary(summary: &RenderSummary) {
    println!("prompts: {}", summary.output.display());
    println!("prompt_participants: {}", summary.participants);
    println!("trials_rendered: {}", summary.trials_rendered);
    println!("trials_skipped: {}", summary.trials_skipped);
    for (participant, skipped) in &summary.skipped_by_participant {
        println!("skipped[{}]: {}", participant, skipped);
    }
}

fn print_run_summary(summary: &ProfileRunSummary) {
    println!("experiment: {}", summary.experiment);
    for normalized in &summary.normalized {
        print_normalize_summary(normalized);
    }
    if let Some(path) = &summary.codebook {
        println!("codebook: {}", path.display());
    }
    if let Some(render) = &summary.render {
        print_render_summary(render);
    }
}

fn print_description(description: &ProfileDescription) {
    println!("experiment: {}", description.experiment);
    for input in &description.inputs {
        println!(
            "input: {} ({:?}{})",
            input.input.display(),
            input.delimiter,
            if input.exists { "" } else { ", missing" }
        );
        println!("output: {}", input.output.display());
    }
    for (alias, field) in &description.aliases {
        println!("alias: {} -> {}", alias, field);
    }
    let required: Vec<&str> = description.required.iter().map(|f| f.as_str()).collect();
    println!("required: {}", required.join(","));
    if !description.flags_defaulted.is_empty() {
        let flags: Vec<&str> = description.flags_defaulted.iter().map(|f| f.as_str()).collect();
        println!("flags_defaulted_false: {}", flags.join(","));
    }
    println!("participant_ordering: {:?}", description.ordering);
    println!("participant_base: {}", description.participant_base);
    println!("trial: {}", description.trial);
    if !description.transforms.is_empty() {
        println!("transforms: {}", description.transforms.join(","));
    }
    if let Some(path) = &description.codebook {
        println!("codebook: {}", path.display());
    }
    if let Some(path) = &description.render_output {
        println!("render_output: {}", path.display());
    }
}
