use async_trait::async_trait;
use thiserror::Error;

use crate::schemas::oracle::{
    AssessmentPayload, ExtractionPayload, OverallPayload, RevisionPayload,
};
use crate::session::document::EssayDocument;
use crate::session::model::{
    AssessmentLength, AssessmentType, ContextNote, Justification, RubricCriterion,
};

#[derive(Debug, Error)]
pub(crate) enum OracleError {
    /// Terminal overload: implementations only surface this after their
    /// fallback-model retry also failed.
    #[error("grading model overloaded")]
    Overloaded,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unusable model response: {0}")]
    BadPayload(String),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AssessmentOptions {
    pub(crate) assessment_type: AssessmentType,
    pub(crate) assessment_length: AssessmentLength,
}

/// One criterion's effective score, as fed into the overall synthesis prompt.
#[derive(Debug, Clone)]
pub(crate) struct CriterionScoreSummary {
    pub(crate) name: String,
    pub(crate) score: f64,
    pub(crate) max: i32,
}

#[async_trait]
pub(crate) trait GradingOracle: Send + Sync {
    async fn extract_criteria(&self, rubric_text: &str)
        -> Result<ExtractionPayload, OracleError>;

    async fn assess_criterion(
        &self,
        document: &EssayDocument,
        criterion: &RubricCriterion,
        options: &AssessmentOptions,
        context_notes: &[ContextNote],
    ) -> Result<AssessmentPayload, OracleError>;

    async fn revise_score(
        &self,
        document: &EssayDocument,
        criterion: &RubricCriterion,
        original: &Justification,
        edited: &Justification,
        preceding_score: Option<f64>,
    ) -> Result<RevisionPayload, OracleError>;

    async fn synthesize_overall(
        &self,
        document: &EssayDocument,
        summaries: &[CriterionScoreSummary],
        context_notes: &[ContextNote],
    ) -> Result<OverallPayload, OracleError>;
}
