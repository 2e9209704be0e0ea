use crate::codebook::CodebookConfig;
use crate::columns::{AliasTable, ParticipantFallback};
use crate::error::{PrepError, PrepResult};
use crate::identity::IdOrdering;
use crate::project::OutputConfig;
use crate::render::RenderConfig;
use crate::schema::CanonicalField;
use crate::table::Delimiter;
use crate::transforms::Transform;
use crate::trials::TrialConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const PROFILE_FILE_NAME: &str = "prep.yaml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub delimiter: Delimiter,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParticipantConfig {
    #[serde(default)]
    pub fallback: ParticipantFallback,
    #[serde(default)]
    pub ordering: IdOrdering,
    #[serde(default)]
    pub base: i64,
    #[serde(default)]
    pub strip: Vec<String>,
    #[serde(default = "default_anonymize_seed")]
    pub anonymize_seed: u64,
}

/// `true` drops exact duplicate rows; a list of columns compares only those.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DuplicatePolicy {
    WholeRow(bool),
    Columns(Vec<String>),
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        DuplicatePolicy::WholeRow(false)
    }
}

fn default_anonymize_seed() -> u64 {
    42
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            fallback: ParticipantFallback::Positional,
            ordering: IdOrdering::NumericSuffix,
            base: 0,
            strip: Vec::new(),
            anonymize_seed: default_anonymize_seed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub experiment: String,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default = "AliasTable::builtin")]
    pub aliases: AliasTable,
    #[serde(default = "default_required")]
    pub required: Vec<CanonicalField>,
    #[serde(default)]
    pub participant: ParticipantConfig,
    #[serde(default)]
    pub trial: TrialConfig,
    #[serde(default = "default_drop_prefixes")]
    pub drop_prefixes: Vec<String>,
    #[serde(default)]
    pub drop_duplicates: DuplicatePolicy,
    #[serde(default)]
    pub transforms: Vec<Transform>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub codebook: Option<CodebookConfig>,
    #[serde(default)]
    pub render: Option<RenderConfig>,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_required() -> Vec<CanonicalField> {
    vec![CanonicalField::ParticipantId]
}

fn default_drop_prefixes() -> Vec<String> {
    vec!["Unnamed".to_string()]
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            experiment: "unnamed".to_string(),
            inputs: Vec::new(),
            aliases: AliasTable::builtin(),
            required: default_required(),
            participant: ParticipantConfig::default(),
            trial: TrialConfig::default(),
            drop_prefixes: default_drop_prefixes(),
            drop_duplicates: DuplicatePolicy::default(),
            transforms: Vec::new(),
            output: OutputConfig::default(),
            codebook: None,
            render: None,
            base_dir: PathBuf::new(),
        }
    }
}

impl Profile {
    pub fn from_yaml_str(text: &str, base_dir: &Path) -> PrepResult<Self> {
        let mut profile: Profile = serde_yaml::from_str(text)?;
        profile.base_dir = base_dir.to_path_buf();
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> PrepResult<()> {
        let mut problems = Vec::new();
        if self.experiment.trim().is_empty() {
            problems.push("experiment must not be empty".to_string());
        }
        if !matches!(self.participant.base, 0 | 1) {
            problems.push(format!(
                "participant.base must be 0 or 1, got {}",
                self.participant.base
            ));
        }
        if !matches!(self.trial.base, 0 | 1) {
            problems.push(format!("trial.base must be 0 or 1, got {}", self.trial.base));
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if input.path.as_os_str().is_empty() {
                problems.push(format!("inputs[{}].path must not be empty", i));
            }
        }
        if let DuplicatePolicy::Columns(cols) = &self.drop_duplicates {
            if cols.is_empty() {
                problems.push("drop_duplicates column list must not be empty".to_string());
            }
        }
        for (i, t) in self.transforms.iter().enumerate() {
            if let Transform::Filter {
                min, max, values, ..
            } = t
            {
                if min.is_none() && max.is_none() && values.is_empty() {
                    problems.push(format!("transforms[{}]: filter needs min, max or values", i));
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        problems.push(format!("transforms[{}]: filter min {} exceeds max {}", i, lo, hi));
                    }
                }
            }
        }
        if let Some(render) = &self.render {
            if render.trial_template.trim().is_empty() {
                problems.push("render.trial_template must not be empty".to_string());
            }
            if render.stimulus_tokens == Some(0) {
                problems.push("render.stimulus_tokens must be positive".to_string());
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PrepError::Config(problems.join("; ")))
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

pub fn load_profile(path: &Path) -> PrepResult<Profile> {
    if !path.is_file() {
        return Err(PrepError::InputMissing {
            path: path.to_path_buf(),
        });
    }
    let text = fs::read_to_string(path)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Profile::from_yaml_str(&text, &base_dir)
}

pub const STARTER_PROFILE: &str = "\
experiment: ''                     # REQUIRED: dataset identifier used in prompt records
inputs:
  - path: original_data/data.csv   # REQUIRED: raw export, relative to this file
    delimiter: auto                # auto | comma | tab | whitespace
aliases:                           # raw column (any casing) -> canonical field
  ppn: participant_id
  subject: participant_id
  recognition_rt: rt
  image: image_filename
required: [participant_id]
participant:
  fallback: positional             # positional | none
  ordering: numeric_suffix         # numeric_suffix | first_appearance | anonymized
  base: 0
trial:
  mode: direct                     # direct | factorize
  base: 0
  default: 0
drop_prefixes: [Unnamed]
drop_duplicates: false             # true | [column, ...]
transforms: []
output:
  keep_extra: false
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_profile_takes_defaults() {
        let p = Profile::from_yaml_str("experiment: demo\n", Path::new("/exp")).expect("parse");
        assert_eq!(p.aliases, AliasTable::builtin());
        assert_eq!(p.required, vec![CanonicalField::ParticipantId]);
        assert_eq!(p.participant.ordering, IdOrdering::NumericSuffix);
        assert_eq!(p.drop_prefixes, vec!["Unnamed".to_string()]);
        assert_eq!(p.resolve(Path::new("a.csv")), PathBuf::from("/exp/a.csv"));
    }

    #[test]
    fn full_profile_parses() {
        let yaml = r#"
experiment: guenther2020LDT
inputs:
  - path: original_data/dataset_diligent_LDT.txt
    output: processed_data/LDT_compounds_cleaned.csv
    delimiter: whitespace
aliases:
  subject: participant_id
  comp: stimulus
participant:
  ordering: first_appearance
  base: 1
  strip: [association_, .csv]
trial:
  source: trial_index
  mode: factorize
  base: 1
transforms:
  - recode: { from: key_press, to: response, map: { "67": c }, default: n }
codebook:
  descriptions:
    response: "Response key recoded to 'c' or 'n'"
render:
  trial_template: "{stimulus}: <<{response}>>"
  stimulus_tokens: 1
  metadata: [age]
"#;
        let p = Profile::from_yaml_str(yaml, Path::new("/exp")).expect("parse");
        assert_eq!(p.inputs[0].delimiter, Delimiter::Whitespace);
        assert_eq!(p.participant.strip.len(), 2);
        assert_eq!(p.trial.mode, crate::trials::TrialMode::Factorize);
        assert_eq!(p.transforms.len(), 1);
        let cb = p.codebook.expect("codebook");
        assert_eq!(cb.path, PathBuf::from("CODEBOOK.csv"));
        assert_eq!(p.render.expect("render").metadata, vec![CanonicalField::Age]);
    }

    #[test]
    fn duplicate_policy_accepts_flag_or_columns() {
        let p = Profile::from_yaml_str("experiment: x\n", Path::new(".")).expect("default");
        assert_eq!(p.drop_duplicates, DuplicatePolicy::WholeRow(false));
        let p = Profile::from_yaml_str("experiment: x\ndrop_duplicates: true\n", Path::new("."))
            .expect("flag");
        assert_eq!(p.drop_duplicates, DuplicatePolicy::WholeRow(true));
        let p = Profile::from_yaml_str(
            "experiment: x\ndrop_duplicates: [participant, cue, response]\n",
            Path::new("."),
        )
        .expect("columns");
        assert_eq!(
            p.drop_duplicates,
            DuplicatePolicy::Columns(vec!["participant".into(), "cue".into(), "response".into()])
        );
    }

    #[test]
    fn invalid_profiles_are_rejected() {
        assert!(Profile::from_yaml_str("experiment: ''\n", Path::new(".")).is_err());
        assert!(Profile::from_yaml_str("experiment: x\ntrial: { base: 2 }\n", Path::new(".")).is_err());
        assert!(Profile::from_yaml_str("experiment: x\nbogus: 1\n", Path::new(".")).is_err());
        assert!(
            Profile::from_yaml_str("experiment: x\naliases: { ppn: person }\n", Path::new("."))
                .is_err()
        );
        assert!(Profile::from_yaml_str(
            "experiment: x\ntransforms:\n  - filter: { column: resp_num }\n",
            Path::new(".")
        )
        .is_err());
        assert!(Profile::from_yaml_str(
            "experiment: x\ntransforms:\n  - filter: { column: resp_num, min: 10, max: 1 }\n",
            Path::new(".")
        )
        .is_err());
    }

    #[test]
    fn starter_profile_fails_only_on_required_blanks() {
        let err = Profile::from_yaml_str(STARTER_PROFILE, Path::new(".")).expect_err("blank experiment");
        assert!(err.to_string().contains("experiment must not be empty"), "{}", err);
        let filled = STARTER_PROFILE.replacen("experiment: ''", "experiment: demo", 1);
        Profile::from_yaml_str(&filled, Path::new(".")).expect("filled starter parses");
    }
}
