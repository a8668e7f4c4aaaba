use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use validator::Validate;

use crate::core::time::format_offset;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssessmentType {
    Flow,
    Bullets,
}

impl AssessmentType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Flow => "flow",
            Self::Bullets => "bullets",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssessmentLength {
    Short,
    Medium,
    Long,
}

impl AssessmentLength {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ScoreRange {
    pub(crate) min: i32,
    pub(crate) max: i32,
}

impl ScoreRange {
    pub(crate) fn contains(&self, score: i32) -> bool {
        score >= self.min && score <= self.max
    }

    pub(crate) fn contains_f64(&self, score: f64) -> bool {
        score.is_finite() && score >= f64::from(self.min) && score <= f64::from(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ScoreLevel {
    pub(crate) score: i32,
    pub(crate) description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RubricCriterion {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) score_range: ScoreRange,
    pub(crate) levels: Vec<ScoreLevel>,
}

#[derive(Debug, Clone, Validate)]
pub(crate) struct ContextNote {
    #[validate(length(min = 1, message = "context note title must not be empty"))]
    pub(crate) title: String,
    #[validate(length(min = 1, message = "context note content must not be empty"))]
    pub(crate) content: String,
}

/// A justification is either one paragraph of prose or a list of bullet
/// points. The variant is fixed per criterion by the session's assessment
/// type and preserved across revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Justification {
    Prose(String),
    Bullets(Vec<String>),
}

impl Justification {
    pub(crate) fn normalized(self) -> Self {
        match self {
            Self::Prose(text) => Self::Prose(text.trim().to_string()),
            Self::Bullets(items) => Self::Bullets(
                items
                    .into_iter()
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect(),
            ),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Self::Prose(text) => text.trim().is_empty(),
            Self::Bullets(items) => items.iter().all(|item| item.trim().is_empty()),
        }
    }

    pub(crate) fn matches_type(&self, assessment_type: AssessmentType) -> bool {
        matches!(
            (self, assessment_type),
            (Self::Prose(_), AssessmentType::Flow) | (Self::Bullets(_), AssessmentType::Bullets)
        )
    }

    // Evidence indexes count sentences for prose and bullets for lists,
    // splitting prose on the same terminators the oracle is instructed to use.
    pub(crate) fn units(&self) -> Vec<String> {
        match self {
            Self::Prose(text) => text
                .split(['.', '!', '?'])
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect(),
            Self::Bullets(items) => items.clone(),
        }
    }

    pub(crate) fn unit_count(&self) -> usize {
        self.units().len()
    }

    pub(crate) fn as_text(&self) -> String {
        match self {
            Self::Prose(text) => text.clone(),
            Self::Bullets(items) => items.join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Evidence {
    pub(crate) quote: String,
    pub(crate) location: String,
    pub(crate) related_unit_indexes: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct Revision {
    pub(crate) justification: Justification,
    pub(crate) ai_score: Option<f64>,
    pub(crate) rationale: Option<String>,
    pub(crate) preceding_ai_score: Option<f64>,
    pub(crate) created_at: OffsetDateTime,
}

impl Revision {
    fn snapshot(&self) -> serde_json::Value {
        json!({
            "justification": self.justification,
            "ai_score": self.ai_score,
            "rationale": self.rationale,
            "preceding_ai_score": self.preceding_ai_score,
            "created_at": format_offset(self.created_at),
        })
    }
}

/// Per-criterion grading state. The revision chain is non-empty by
/// construction: seeding stores the original oracle output as revision zero
/// and edits only ever append.
#[derive(Debug, Clone)]
pub(crate) struct CriterionAssessment {
    pub(crate) criterion_id: String,
    pub(crate) evidence: Vec<Evidence>,
    pub(crate) teacher_score: Option<i32>,
    pub(crate) score_revealed: bool,
    pub(crate) is_revising: bool,
    first_revision: Revision,
    later_revisions: Vec<Revision>,
}

impl CriterionAssessment {
    pub(crate) fn seed(
        criterion_id: String,
        justification: Justification,
        ai_score: Option<f64>,
        evidence: Vec<Evidence>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            criterion_id,
            evidence,
            teacher_score: None,
            score_revealed: false,
            is_revising: false,
            first_revision: Revision {
                justification,
                ai_score,
                rationale: None,
                preceding_ai_score: None,
                created_at,
            },
            later_revisions: Vec::new(),
        }
    }

    pub(crate) fn first(&self) -> &Revision {
        &self.first_revision
    }

    pub(crate) fn current(&self) -> &Revision {
        self.later_revisions.last().unwrap_or(&self.first_revision)
    }

    pub(crate) fn current_mut(&mut self) -> &mut Revision {
        self.later_revisions.last_mut().unwrap_or(&mut self.first_revision)
    }

    pub(crate) fn revisions(&self) -> impl Iterator<Item = &Revision> + '_ {
        std::iter::once(&self.first_revision).chain(self.later_revisions.iter())
    }

    pub(crate) fn revision_count(&self) -> usize {
        1 + self.later_revisions.len()
    }

    pub(crate) fn was_revised(&self) -> bool {
        !self.later_revisions.is_empty()
    }

    pub(crate) fn push_revision(&mut self, revision: Revision) {
        self.later_revisions.push(revision);
    }

    /// Score that counts toward the final grade: the human's when present,
    /// otherwise the current AI score.
    pub(crate) fn effective_score(&self) -> Option<f64> {
        self.teacher_score.map(f64::from).or(self.current().ai_score)
    }

    // Initial AI grade precedence: first revision's score, then the current
    // one, then nothing.
    pub(crate) fn initial_ai_score(&self) -> Option<f64> {
        self.first_revision.ai_score.or(self.current().ai_score)
    }

    pub(crate) fn snapshot(&self) -> serde_json::Value {
        json!({
            "criterion_id": self.criterion_id,
            "evidence": self.evidence,
            "teacher_score": self.teacher_score,
            "score_revealed": self.score_revealed,
            "revisions": self.revisions().map(Revision::snapshot).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum OverallGrade {
    Score(f64),
    NotAvailable,
}

impl Serialize for OverallGrade {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Score(value) => serializer.serialize_f64(*value),
            Self::NotAvailable => serializer.serialize_str("N/A"),
        }
    }
}

impl std::fmt::Display for OverallGrade {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Score(value) => write!(formatter, "{value:.1}"),
            Self::NotAvailable => write!(formatter, "N/A"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OverallAssessment {
    pub(crate) strengths: String,
    pub(crate) improvements: String,
    pub(crate) overall_grade: OverallGrade,
    pub(crate) advice: String,
}
