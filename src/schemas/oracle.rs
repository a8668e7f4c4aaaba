use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::session::errors::RubricParseError;
use crate::session::model::{Justification, RubricCriterion, ScoreLevel, ScoreRange};

const PLACEHOLDER_DESCRIPTION: &str = "no information provided in the grading rubric";

/// What criteria extraction produced: either a criteria array to validate or
/// the model's explicit signal that the text is not a rubric.
#[derive(Debug, Clone)]
pub(crate) enum ExtractionPayload {
    Criteria(Vec<CriterionPayload>),
    NotARubric,
}

// Models sometimes number criteria themselves; unknown keys like "id" are
// ignored and fresh ids assigned in validate_criteria.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CriterionPayload {
    #[serde(default, alias = "title")]
    pub(crate) name: Option<String>,
    #[serde(default, rename = "scoreRange")]
    pub(crate) score_range: Option<ScoreRangePayload>,
    #[serde(default)]
    pub(crate) levels: Option<Vec<LevelPayload>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct ScoreRangePayload {
    pub(crate) min: i32,
    pub(crate) max: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LevelPayload {
    #[serde(default)]
    pub(crate) score: Option<i32>,
    #[serde(default)]
    pub(crate) description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AssessmentPayload {
    pub(crate) justification: JustificationPayload,
    #[serde(default)]
    pub(crate) evidence: Vec<EvidencePayload>,
    #[serde(default)]
    pub(crate) score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum JustificationPayload {
    Prose(String),
    Bullets(Vec<String>),
}

impl JustificationPayload {
    pub(crate) fn into_justification(self) -> Justification {
        match self {
            Self::Prose(text) => Justification::Prose(text),
            Self::Bullets(items) => Justification::Bullets(items),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EvidencePayload {
    pub(crate) quote: String,
    #[serde(default)]
    pub(crate) paragraph: Option<Value>,
    #[serde(default, rename = "relatedAssessmentIndexes")]
    pub(crate) related_assessment_indexes: Vec<i64>,
}

impl EvidencePayload {
    pub(crate) fn location(&self) -> String {
        match &self.paragraph {
            Some(Value::String(text)) => text.trim().to_string(),
            Some(Value::Number(number)) => format!("paragraph {number}"),
            _ => String::new(),
        }
    }
}

// Both fields default so a partial reply still parses; the session decides
// whether a missing score or blank rationale voids the revision.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RevisionPayload {
    #[serde(default, rename = "revisedScore")]
    pub(crate) revised_score: Option<f64>,
    #[serde(default)]
    pub(crate) rationale: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OverallPayload {
    #[serde(default)]
    pub(crate) strengths: String,
    #[serde(default)]
    pub(crate) improvements: String,
    #[serde(default, rename = "overallGrade")]
    pub(crate) overall_grade: Option<Value>,
    #[serde(default)]
    pub(crate) advice: String,
}

impl OverallPayload {
    pub(crate) fn suggested_grade(&self) -> Option<f64> {
        self.overall_grade.as_ref().and_then(Value::as_f64)
    }
}

/// Turns a raw criteria payload into validated domain criteria. Criterion ids
/// are assigned here, so duplicate names in a rubric never collide.
pub(crate) fn validate_criteria(
    entries: Vec<CriterionPayload>,
) -> Result<Vec<RubricCriterion>, RubricParseError> {
    if entries.is_empty() {
        return Err(RubricParseError::NoCriteria);
    }
    if is_placeholder_payload(&entries) {
        return Err(RubricParseError::NotARubric);
    }

    let mut criteria = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let name = entry.name.as_deref().map(str::trim).unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(invalid(index, "missing a name"));
        }

        let mut levels = Vec::new();
        for level in entry.levels.unwrap_or_default() {
            let score = match level.score {
                Some(score) => score,
                None => return Err(invalid(index, "a level is missing its score")),
            };
            let description = level.description.as_deref().map(str::trim).unwrap_or_default();
            if description.is_empty() {
                return Err(invalid(index, "a level is missing its description"));
            }
            levels.push(ScoreLevel { score, description: description.to_string() });
        }

        let score_range = match entry.score_range {
            Some(range) => ScoreRange { min: range.min, max: range.max },
            // The extraction prompt asks for an explicit range, but models
            // sometimes omit it; level scores still pin it down.
            None => {
                let min = levels.iter().map(|level| level.score).min();
                let max = levels.iter().map(|level| level.score).max();
                match (min, max) {
                    (Some(min), Some(max)) => ScoreRange { min, max },
                    _ => return Err(invalid(index, "missing both levels and score range")),
                }
            }
        };

        if score_range.min >= score_range.max {
            return Err(invalid(
                index,
                format!("score range {}..{} is not ascending", score_range.min, score_range.max),
            ));
        }

        for level in &levels {
            if !score_range.contains(level.score) {
                return Err(invalid(
                    index,
                    format!(
                        "level score {} is outside the declared range {}..{}",
                        level.score, score_range.min, score_range.max
                    ),
                ));
            }
        }

        levels.sort_by_key(|level| level.score);

        criteria.push(RubricCriterion {
            id: Uuid::new_v4().to_string(),
            name,
            score_range,
            levels,
        });
    }

    Ok(criteria)
}

// The extraction model answers malformed rubrics with a single "Overall"
// criterion whose only level says no information was provided. That is a
// refusal, not a one-criterion rubric.
fn is_placeholder_payload(entries: &[CriterionPayload]) -> bool {
    let [entry] = entries else {
        return false;
    };
    if entry.name.as_deref().map(str::trim) != Some("Overall") {
        return false;
    }
    let Some([level]) = entry.levels.as_deref() else {
        return false;
    };
    level
        .description
        .as_deref()
        .is_some_and(|description| description.to_ascii_lowercase().contains(PLACEHOLDER_DESCRIPTION))
}

fn invalid(index: usize, reason: impl Into<String>) -> RubricParseError {
    RubricParseError::InvalidCriterion { index, reason: reason.into() }
}
