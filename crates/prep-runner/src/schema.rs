//! The closed set of canonical trial-level columns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Identifier,
    Numeric,
    Flag,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    ParticipantId,
    TrialId,
    Rt,
    Age,
    TrialOrder,
    List,
    IsInvalid,
    IsRtOutlier,
    Stimulus,
    TargetWord,
    Response,
    ResponseCorrected,
    ImageFilename,
    Object,
    Gender,
    Education,
    FirstLanguage,
    Nationality,
    Best,
    Worst,
}

impl CanonicalField {
    /// Declared projection order.
    pub const ALL: [CanonicalField; 20] = [
        CanonicalField::ParticipantId,
        CanonicalField::TrialId,
        CanonicalField::Rt,
        CanonicalField::Age,
        CanonicalField::TrialOrder,
        CanonicalField::List,
        CanonicalField::IsInvalid,
        CanonicalField::IsRtOutlier,
        CanonicalField::Stimulus,
        CanonicalField::TargetWord,
        CanonicalField::Response,
        CanonicalField::ResponseCorrected,
        CanonicalField::ImageFilename,
        CanonicalField::Object,
        CanonicalField::Gender,
        CanonicalField::Education,
        CanonicalField::FirstLanguage,
        CanonicalField::Nationality,
        CanonicalField::Best,
        CanonicalField::Worst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::ParticipantId => "participant_id",
            CanonicalField::TrialId => "trial_id",
            CanonicalField::Rt => "rt",
            CanonicalField::Age => "age",
            CanonicalField::TrialOrder => "trial_order",
            CanonicalField::List => "list",
            CanonicalField::IsInvalid => "is_invalid",
            CanonicalField::IsRtOutlier => "is_rt_outlier",
            CanonicalField::Stimulus => "stimulus",
            CanonicalField::TargetWord => "target_word",
            CanonicalField::Response => "response",
            CanonicalField::ResponseCorrected => "response_corrected",
            CanonicalField::ImageFilename => "image_filename",
            CanonicalField::Object => "object",
            CanonicalField::Gender => "gender",
            CanonicalField::Education => "education",
            CanonicalField::FirstLanguage => "first_language",
            CanonicalField::Nationality => "nationality",
            CanonicalField::Best => "best",
            CanonicalField::Worst => "worst",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            CanonicalField::ParticipantId | CanonicalField::TrialId => FieldKind::Identifier,
            CanonicalField::Rt
            | CanonicalField::Age
            | CanonicalField::TrialOrder
            | CanonicalField::List => FieldKind::Numeric,
            CanonicalField::IsInvalid | CanonicalField::IsRtOutlier => FieldKind::Flag,
            _ => FieldKind::Text,
        }
    }

    /// Default codebook description.
    pub fn description(&self) -> &'static str {
        match self {
            CanonicalField::ParticipantId => "Anonymized participant ID (dense integer)",
            CanonicalField::TrialId => "Trial order index within participant",
            CanonicalField::Rt => "Response time in ms",
            CanonicalField::Age => "Participant age in years",
            CanonicalField::TrialOrder => "Presentation order of the item",
            CanonicalField::List => "Stimulus list the participant was assigned to",
            CanonicalField::IsInvalid => "Response flagged as invalid",
            CanonicalField::IsRtOutlier => "Response time flagged as outlier",
            CanonicalField::Stimulus => "Stimulus shown on the trial",
            CanonicalField::TargetWord => "Expected target word for the item",
            CanonicalField::Response => "Participant response",
            CanonicalField::ResponseCorrected => "Participant response after spelling correction",
            CanonicalField::ImageFilename => "File name of the image shown",
            CanonicalField::Object => "Object depicted on the image",
            CanonicalField::Gender => "Participant gender",
            CanonicalField::Education => "Highest education level completed",
            CanonicalField::FirstLanguage => "Participant first language",
            CanonicalField::Nationality => "Participant nationality",
            CanonicalField::Best => "Option chosen as best",
            CanonicalField::Worst => "Option chosen as worst",
        }
    }

    pub fn position(&self) -> usize {
        Self::ALL
            .iter()
            .position(|f| f == self)
            .unwrap_or(Self::ALL.len())
    }

    /// Case-insensitive lookup of a column name.
    pub fn from_column(name: &str) -> Option<CanonicalField> {
        let lower = name.trim().to_lowercase();
        Self::ALL.iter().copied().find(|f| f.as_str() == lower)
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalField::from_column(s).ok_or_else(|| format!("unknown canonical field: {}", s))
    }
}
