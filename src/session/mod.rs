use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use time::OffsetDateTime;

pub(crate) mod document;
pub(crate) mod errors;
pub(crate) mod model;
pub(crate) mod revision;


use crate::core::time::format_offset;
use crate::schemas::oracle::{
    validate_criteria, AssessmentPayload, ExtractionPayload, RevisionPayload,
};
use crate::services::grade_log::{GradeRecord, GradeSink};
use crate::services::oracle::{
    AssessmentOptions, CriterionScoreSummary, GradingOracle, OracleError,
};
use crate::session::document::EssayDocument;
use crate::session::errors::{RubricParseError, SessionError};
use crate::session::model::{
    AssessmentType, ContextNote, CriterionAssessment, Evidence, Justification, OverallAssessment,
    OverallGrade, RubricCriterion,
};
use crate::session::revision::{
    begin_revision, resolve_revision, EditOutcome, RevisionOutcome, RevisionTicket,
};

const REVISION_OVERLOADED_RATIONALE: &str =
    "The grading model is overloaded. The original score is retained.";
const REVISION_FAILED_RATIONALE: &str =
    "There was an error revising the score. The original score is retained.";
const SYNTHESIS_UNAVAILABLE_STRENGTHS: &str =
    "There was an error generating the overall assessment.";
const SYNTHESIS_UNAVAILABLE_IMPROVEMENTS: &str =
    "Please review the individual criteria scores.";
const SYNTHESIS_UNAVAILABLE_ADVICE: &str = "Consider reviewing each criterion individually.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    ExtractingCriteria,
    Grading,
    Synthesizing,
    Complete,
}

impl Phase {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ExtractingCriteria => "extracting_criteria",
            Self::Grading => "grading",
            Self::Synthesizing => "synthesizing",
            Self::Complete => "complete",
        }
    }
}

/// One grading pass over one essay: walks the rubric criteria in order,
/// pairs the human's score with the oracle's, and synthesizes an overall
/// assessment at the end. All oracle failures are non-fatal; collected
/// assessments survive and the failed step can be retried.
pub(crate) struct GradingSession {
    oracle: Arc<dyn GradingOracle>,
    sink: Arc<dyn GradeSink>,
    options: AssessmentOptions,
    document: Option<EssayDocument>,
    rubric_text: Option<String>,
    context_notes: Vec<ContextNote>,
    criteria: Vec<RubricCriterion>,
    assessments: HashMap<String, CriterionAssessment>,
    cursor: usize,
    phase: Phase,
    overall: Option<OverallAssessment>,
    // Bumped on every restart; oracle results stamped with an older
    // generation are discarded instead of applied.
    generation: u64,
    entered_at: Option<Instant>,
    leave_recorded: bool,
}

impl GradingSession {
    pub(crate) fn new(
        oracle: Arc<dyn GradingOracle>,
        sink: Arc<dyn GradeSink>,
        options: AssessmentOptions,
    ) -> Self {
        Self {
            oracle,
            sink,
            options,
            document: None,
            rubric_text: None,
            context_notes: Vec::new(),
            criteria: Vec::new(),
            assessments: HashMap::new(),
            cursor: 0,
            phase: Phase::Idle,
            overall: None,
            generation: 0,
            entered_at: None,
            leave_recorded: false,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn options(&self) -> AssessmentOptions {
        self.options
    }

    pub(crate) fn criteria(&self) -> &[RubricCriterion] {
        &self.criteria
    }

    pub(crate) fn context_notes(&self) -> &[ContextNote] {
        &self.context_notes
    }

    pub(crate) fn document(&self) -> Option<&EssayDocument> {
        self.document.as_ref()
    }

    pub(crate) fn overall(&self) -> Option<&OverallAssessment> {
        self.overall.as_ref()
    }

    pub(crate) fn current_criterion(&self) -> Option<&RubricCriterion> {
        self.criteria.get(self.cursor)
    }

    pub(crate) fn current_assessment(&self) -> Option<&CriterionAssessment> {
        let criterion = self.current_criterion()?;
        self.assessments.get(&criterion.id)
    }

    pub(crate) fn assessment_for(&self, criterion_id: &str) -> Option<&CriterionAssessment> {
        self.assessments.get(criterion_id)
    }

    pub(crate) fn set_document_text(&mut self, text: &str) -> Result<(), SessionError> {
        self.require_idle("the essay can only be changed before grading starts")?;
        let document = EssayDocument::from_text(text)?;
        tracing::info!(
            essay_id = %document.essay_id(),
            pages = document.page_count(),
            "Essay loaded"
        );
        self.document = Some(document);
        Ok(())
    }

    pub(crate) fn set_rubric_text(&mut self, text: &str) -> Result<(), SessionError> {
        self.require_idle("the rubric can only be changed before grading starts")?;
        if text.trim().is_empty() {
            return Err(SessionError::Validation("rubric text must not be empty".to_string()));
        }
        self.rubric_text = Some(text.to_string());
        Ok(())
    }

    pub(crate) fn add_context_note(&mut self, note: ContextNote) -> Result<(), SessionError> {
        self.require_idle("context notes can only be added before grading starts")?;
        validator::Validate::validate(&note)
            .map_err(|error| SessionError::Validation(error.to_string()))?;
        self.context_notes.push(note);
        Ok(())
    }

    /// Extracts criteria from the loaded rubric and enters Grading. Any
    /// failure on the way drops back to Idle with the rubric text kept, so
    /// a corrected rubric can be retried immediately.
    pub(crate) async fn start_grading(&mut self) -> Result<(), SessionError> {
        self.require_idle("grading is already in progress")?;
        if self.document.is_none() {
            return Err(SessionError::Precondition("load an essay before starting"));
        }
        let rubric = self
            .rubric_text
            .clone()
            .ok_or(SessionError::Precondition("load a rubric before starting"))?;

        self.phase = Phase::ExtractingCriteria;
        let criteria = match self.extract_and_validate(&rubric).await {
            Ok(criteria) => criteria,
            Err(error) => {
                self.phase = Phase::Idle;
                let outcome = if matches!(error, SessionError::RubricParse(_)) {
                    "rubric_rejected"
                } else {
                    "start_failed"
                };
                metrics::counter!("grading_sessions_total", "outcome" => outcome).increment(1);
                return Err(error);
            }
        };

        tracing::info!(criteria = criteria.len(), "Rubric criteria extracted");
        self.criteria = criteria;
        self.assessments.clear();
        self.cursor = 0;
        self.overall = None;
        self.phase = Phase::Grading;
        self.entered_at = Some(Instant::now());
        self.leave_recorded = false;
        metrics::counter!("grading_sessions_total", "outcome" => "started").increment(1);

        // The first criterion is assessed eagerly so the grader lands on a
        // filled screen; a failure here keeps the session in Grading and is
        // retried by assess_current.
        self.ensure_current_assessed().await
    }

    /// Idempotent: a criterion that already has an assessment never triggers
    /// a second oracle call.
    pub(crate) async fn assess_current(&mut self) -> Result<(), SessionError> {
        self.require_grading()?;
        self.ensure_current_assessed().await
    }

    pub(crate) fn set_teacher_score(&mut self, score: i32) -> Result<(), SessionError> {
        self.require_grading()?;
        let criterion = self
            .criteria
            .get(self.cursor)
            .ok_or(SessionError::Precondition("no criterion is selected"))?;
        if !criterion.score_range.contains(score) {
            return Err(SessionError::Validation(format!(
                "score {score} is outside the range {}..{}",
                criterion.score_range.min, criterion.score_range.max
            )));
        }
        let assessment = self
            .assessments
            .get_mut(&criterion.id)
            .ok_or(SessionError::Precondition("the criterion has not been assessed yet"))?;
        assessment.teacher_score = Some(score);
        Ok(())
    }

    /// The model's score stays hidden until the human has committed their
    /// own, so the comparison is blind.
    pub(crate) fn reveal_ai_score(&mut self) -> Result<Option<f64>, SessionError> {
        self.require_grading()?;
        let criterion = self
            .criteria
            .get(self.cursor)
            .ok_or(SessionError::Precondition("no criterion is selected"))?;
        let assessment = self
            .assessments
            .get_mut(&criterion.id)
            .ok_or(SessionError::Precondition("the criterion has not been assessed yet"))?;
        if assessment.teacher_score.is_none() {
            return Err(SessionError::Precondition("enter your own score before revealing"));
        }
        assessment.score_revealed = true;
        Ok(assessment.current().ai_score)
    }

    pub(crate) async fn advance(&mut self) -> Result<(), SessionError> {
        self.require_grading()?;
        if self.cursor + 1 >= self.criteria.len() {
            return Err(SessionError::Precondition(
                "already at the last criterion; finish the session instead",
            ));
        }

        self.record_current_leave();
        self.cursor += 1;
        self.entered_at = Some(Instant::now());
        self.leave_recorded = false;

        // Navigation has already happened; an assessment failure here is
        // surfaced but retried by assess_current.
        self.ensure_current_assessed().await
    }

    /// Moving back never re-runs the oracle and never emits telemetry.
    pub(crate) fn retreat(&mut self) -> Result<(), SessionError> {
        self.require_grading()?;
        if self.cursor > 0 {
            self.cursor -= 1;
            self.entered_at = Some(Instant::now());
            self.leave_recorded = false;
        }
        Ok(())
    }

    /// Explicit end of the walk: guarantees the last criterion is assessed,
    /// records its telemetry, synthesizes the overall assessment, and
    /// computes the final grade locally from the effective scores.
    pub(crate) async fn finish(&mut self) -> Result<(), SessionError> {
        self.require_grading()?;
        self.ensure_current_assessed().await?;
        self.record_current_leave();

        self.phase = Phase::Synthesizing;
        let document = match self.document.clone() {
            Some(document) => document,
            None => {
                self.phase = Phase::Grading;
                return Err(SessionError::Precondition("no essay loaded"));
            }
        };
        let summaries = self.score_summaries();
        let grade = self.compute_overall_grade();

        match self.oracle.synthesize_overall(&document, &summaries, &self.context_notes).await {
            Ok(payload) => {
                self.overall = Some(OverallAssessment {
                    strengths: payload.strengths.trim().to_string(),
                    improvements: payload.improvements.trim().to_string(),
                    overall_grade: grade,
                    advice: payload.advice.trim().to_string(),
                });
                self.phase = Phase::Complete;
                metrics::counter!("grading_sessions_total", "outcome" => "completed")
                    .increment(1);
                tracing::info!(
                    grade = %grade,
                    model_grade = ?payload.suggested_grade(),
                    "Grading session complete"
                );
                Ok(())
            }
            Err(OracleError::Overloaded) => {
                // Retryable: back to Grading with every assessment intact.
                self.phase = Phase::Grading;
                Err(SessionError::OracleOverloaded)
            }
            Err(error) => {
                tracing::warn!(error = %error, "Overall synthesis failed; completing with computed grade only");
                self.overall = Some(OverallAssessment {
                    strengths: SYNTHESIS_UNAVAILABLE_STRENGTHS.to_string(),
                    improvements: SYNTHESIS_UNAVAILABLE_IMPROVEMENTS.to_string(),
                    overall_grade: grade,
                    advice: SYNTHESIS_UNAVAILABLE_ADVICE.to_string(),
                });
                self.phase = Phase::Complete;
                metrics::counter!("grading_sessions_total", "outcome" => "completed_degraded")
                    .increment(1);
                Ok(())
            }
        }
    }

    /// Two-phase edit of the current justification: the revision is appended
    /// optimistically, then resolved in place with the oracle's verdict. A
    /// failed oracle call degrades the revision instead of removing it.
    pub(crate) async fn submit_justification_edit(
        &mut self,
        edited: Justification,
    ) -> Result<(), SessionError> {
        self.require_grading()?;
        let criterion = self
            .criteria
            .get(self.cursor)
            .cloned()
            .ok_or(SessionError::Precondition("no criterion is selected"))?;
        let document = self
            .document
            .clone()
            .ok_or(SessionError::Precondition("no essay loaded"))?;
        let assessment = self
            .assessments
            .get_mut(&criterion.id)
            .ok_or(SessionError::Precondition("the criterion has not been assessed yet"))?;

        let ticket = match begin_revision(
            assessment,
            edited,
            self.options.assessment_type,
            self.generation,
            OffsetDateTime::now_utc(),
        )? {
            EditOutcome::NoOp => return Ok(()),
            EditOutcome::Pending(ticket) => ticket,
        };

        let result = self
            .oracle
            .revise_score(
                &document,
                &criterion,
                &ticket.old_justification,
                &ticket.edited,
                ticket.preceding_score,
            )
            .await;
        self.apply_revision_result(&criterion, ticket, result)
    }

    /// Local-only edits of the completed overall assessment. The grade
    /// override is validated against the 0-10 scale, never clamped.
    pub(crate) fn edit_overall(
        &mut self,
        strengths: Option<String>,
        improvements: Option<String>,
        advice: Option<String>,
        grade: Option<f64>,
    ) -> Result<(), SessionError> {
        if self.phase != Phase::Complete {
            return Err(SessionError::Precondition("there is no completed assessment to edit"));
        }
        let overall = self
            .overall
            .as_mut()
            .ok_or(SessionError::Precondition("there is no completed assessment to edit"))?;

        if let Some(grade) = grade {
            if !grade.is_finite() || !(0.0..=10.0).contains(&grade) {
                return Err(SessionError::Validation(format!(
                    "overall grade {grade} must be between 0 and 10"
                )));
            }
            overall.overall_grade = OverallGrade::Score(grade);
        }
        if let Some(strengths) = strengths {
            overall.strengths = strengths;
        }
        if let Some(improvements) = improvements {
            overall.improvements = improvements;
        }
        if let Some(advice) = advice {
            overall.advice = advice;
        }
        Ok(())
    }

    /// Back to Idle for another pass over the same essay and rubric.
    pub(crate) fn grade_again(&mut self) -> Result<(), SessionError> {
        if self.phase != Phase::Complete {
            return Err(SessionError::Precondition("grading is not finished yet"));
        }
        self.generation += 1;
        self.criteria.clear();
        self.assessments.clear();
        self.cursor = 0;
        self.overall = None;
        self.phase = Phase::Idle;
        self.entered_at = None;
        self.leave_recorded = false;
        tracing::info!("Session restarted; essay and rubric kept");
        Ok(())
    }

    /// Back to a blank Idle: also drops the essay, rubric and context notes.
    pub(crate) fn reset_all(&mut self) -> Result<(), SessionError> {
        self.grade_again()?;
        self.document = None;
        self.rubric_text = None;
        self.context_notes.clear();
        tracing::info!("Session fully reset");
        Ok(())
    }

    fn require_idle(&self, message: &'static str) -> Result<(), SessionError> {
        if self.phase != Phase::Idle {
            tracing::debug!(phase = self.phase.as_str(), "Rejected: session is not idle");
            return Err(SessionError::Precondition(message));
        }
        Ok(())
    }

    fn require_grading(&self) -> Result<(), SessionError> {
        if self.phase != Phase::Grading {
            tracing::debug!(phase = self.phase.as_str(), "Rejected: no grading walk in progress");
            return Err(SessionError::Precondition("no grading is in progress"));
        }
        Ok(())
    }

    async fn extract_and_validate(
        &self,
        rubric: &str,
    ) -> Result<Vec<RubricCriterion>, SessionError> {
        let payload = self.oracle.extract_criteria(rubric).await.map_err(|error| match error {
            OracleError::Overloaded => SessionError::OracleOverloaded,
            // For extraction, an unparseable reply is a rubric problem from
            // the grader's point of view, not a transport one.
            OracleError::BadPayload(detail) => RubricParseError::Syntax(detail).into(),
            OracleError::Transport(detail) => SessionError::OracleContract(detail),
        })?;

        let entries = match payload {
            ExtractionPayload::NotARubric => return Err(RubricParseError::NotARubric.into()),
            ExtractionPayload::Criteria(entries) => entries,
        };
        Ok(validate_criteria(entries)?)
    }

    async fn ensure_current_assessed(&mut self) -> Result<(), SessionError> {
        let criterion = self
            .criteria
            .get(self.cursor)
            .cloned()
            .ok_or(SessionError::Precondition("no criterion is selected"))?;
        if self.assessments.contains_key(&criterion.id) {
            return Ok(());
        }
        let document = self
            .document
            .clone()
            .ok_or(SessionError::Precondition("no essay loaded"))?;

        let payload = self
            .oracle
            .assess_criterion(&document, &criterion, &self.options, &self.context_notes)
            .await
            .map_err(map_oracle_err)?;
        let assessment =
            build_assessment(&criterion, payload, self.options.assessment_type)?;

        tracing::debug!(
            criterion = %criterion.name,
            score = assessment.current().ai_score,
            "Criterion assessed"
        );
        self.assessments.insert(criterion.id.clone(), assessment);
        Ok(())
    }

    fn apply_revision_result(
        &mut self,
        criterion: &RubricCriterion,
        ticket: RevisionTicket,
        result: Result<RevisionPayload, OracleError>,
    ) -> Result<(), SessionError> {
        if ticket.generation != self.generation {
            tracing::debug!(
                criterion_id = %ticket.criterion_id,
                "Discarding revision result from a previous session generation"
            );
            return Ok(());
        }
        let Some(assessment) = self.assessments.get_mut(&ticket.criterion_id) else {
            tracing::debug!(
                criterion_id = %ticket.criterion_id,
                "Discarding revision result for a criterion that no longer exists"
            );
            return Ok(());
        };

        match result {
            Ok(payload) => {
                let rationale = payload.rationale.trim().to_string();
                let violation = match payload.revised_score {
                    None => Some("revision did not include a score".to_string()),
                    Some(score) if !criterion.score_range.contains_f64(score) => Some(format!(
                        "revised score {score} is outside the range {}..{}",
                        criterion.score_range.min, criterion.score_range.max
                    )),
                    Some(_) if rationale.is_empty() => {
                        Some("revision rationale was empty".to_string())
                    }
                    Some(_) => None,
                };

                match violation {
                    None => {
                        let score = payload.revised_score.unwrap_or_default();
                        let changed = ticket.preceding_score != Some(score);
                        resolve_revision(
                            assessment,
                            RevisionOutcome::Rescored { score, rationale },
                        );
                        tracing::info!(
                            criterion = %criterion.name,
                            score,
                            changed,
                            revisions = assessment.revision_count(),
                            "Justification edit resolved"
                        );
                        Ok(())
                    }
                    Some(detail) => {
                        resolve_revision(
                            assessment,
                            RevisionOutcome::Degraded {
                                rationale: REVISION_FAILED_RATIONALE.to_string(),
                            },
                        );
                        Err(SessionError::OracleContract(detail))
                    }
                }
            }
            Err(OracleError::Overloaded) => {
                resolve_revision(
                    assessment,
                    RevisionOutcome::Degraded {
                        rationale: REVISION_OVERLOADED_RATIONALE.to_string(),
                    },
                );
                Err(SessionError::OracleOverloaded)
            }
            Err(error) => {
                resolve_revision(
                    assessment,
                    RevisionOutcome::Degraded {
                        rationale: REVISION_FAILED_RATIONALE.to_string(),
                    },
                );
                Err(SessionError::OracleContract(error.to_string()))
            }
        }
    }

    // Telemetry for the criterion being left. Fire-and-forget: a sink
    // failure is logged and never blocks the transition.
    fn record_current_leave(&mut self) {
        if self.leave_recorded {
            return;
        }
        let Some(criterion) = self.criteria.get(self.cursor) else {
            return;
        };
        let Some(document) = &self.document else {
            return;
        };
        let Some(assessment) = self.assessments.get(&criterion.id) else {
            return;
        };

        let elapsed = self.entered_at.map_or(0.0, |entered| entered.elapsed().as_secs_f64());
        metrics::histogram!("criterion_time_spent_seconds").record(elapsed);

        let record = build_grade_record(document, criterion, assessment, elapsed);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(error) = sink.record(record).await {
                tracing::warn!(error = %error, "Failed to store grade record");
            }
        });
        self.leave_recorded = true;
    }

    fn score_summaries(&self) -> Vec<CriterionScoreSummary> {
        self.criteria
            .iter()
            .filter_map(|criterion| {
                let assessment = self.assessments.get(&criterion.id)?;
                let score = assessment.effective_score()?;
                Some(CriterionScoreSummary {
                    name: criterion.name.clone(),
                    score,
                    max: criterion.score_range.max,
                })
            })
            .collect()
    }

    /// Final grade on the 0-10 scale: the mean of score/max over criteria
    /// that have any numeric score, with the human's score preferred over
    /// the model's. No scores at all means "N/A".
    fn compute_overall_grade(&self) -> OverallGrade {
        let ratios: Vec<f64> = self
            .criteria
            .iter()
            .filter_map(|criterion| {
                let assessment = self.assessments.get(&criterion.id)?;
                let score = assessment.effective_score()?;
                let max = f64::from(criterion.score_range.max);
                if max <= 0.0 {
                    return None;
                }
                Some(score / max)
            })
            .collect();

        if ratios.is_empty() {
            return OverallGrade::NotAvailable;
        }
        let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
        OverallGrade::Score((mean * 10.0).clamp(0.0, 10.0))
    }
}

fn map_oracle_err(error: OracleError) -> SessionError {
    match error {
        OracleError::Overloaded => SessionError::OracleOverloaded,
        OracleError::Transport(detail) | OracleError::BadPayload(detail) => {
            SessionError::OracleContract(detail)
        }
    }
}

/// Turns a raw assessment payload into the seeded revision chain, enforcing
/// the oracle contract: justification in the session's configured form, any
/// reported score finite and inside the criterion's range.
fn build_assessment(
    criterion: &RubricCriterion,
    payload: AssessmentPayload,
    assessment_type: AssessmentType,
) -> Result<CriterionAssessment, SessionError> {
    let justification = payload.justification.into_justification().normalized();
    if justification.is_empty() {
        return Err(SessionError::OracleContract(
            "assessment justification was empty".to_string(),
        ));
    }
    if !justification.matches_type(assessment_type) {
        return Err(SessionError::OracleContract(format!(
            "assessment justification is not in {} form",
            assessment_type.as_str()
        )));
    }

    // A null score is the oracle reporting it could not score this
    // criterion; the assessment is still kept.
    if let Some(score) = payload.score {
        if !criterion.score_range.contains_f64(score) {
            return Err(SessionError::OracleContract(format!(
                "score {score} is outside the range {}..{}",
                criterion.score_range.min, criterion.score_range.max
            )));
        }
    }

    let unit_count = justification.unit_count();
    let evidence: Vec<Evidence> = payload
        .evidence
        .into_iter()
        .filter_map(|item| {
            let quote = item.quote.trim().to_string();
            if quote.is_empty() {
                return None;
            }
            let location = item.location();
            // Indexes the oracle points at units that do not exist are
            // dropped rather than failing the whole assessment.
            let related_unit_indexes: BTreeSet<usize> = item
                .related_assessment_indexes
                .iter()
                .filter_map(|&index| usize::try_from(index).ok())
                .filter(|&index| index < unit_count)
                .collect();
            Some(Evidence { quote, location, related_unit_indexes })
        })
        .collect();

    Ok(CriterionAssessment::seed(
        criterion.id.clone(),
        justification,
        payload.score,
        evidence,
        OffsetDateTime::now_utc(),
    ))
}

fn build_grade_record(
    document: &EssayDocument,
    criterion: &RubricCriterion,
    assessment: &CriterionAssessment,
    time_spent_seconds: f64,
) -> GradeRecord {
    let revised_assessment_text =
        assessment.was_revised().then(|| assessment.current().justification.as_text());
    let new_ai_grade =
        if assessment.was_revised() { assessment.current().ai_score } else { None };

    GradeRecord {
        essay_id: document.essay_id().to_string(),
        criterion_id: assessment.criterion_id.clone(),
        assessment_text: assessment.first().justification.as_text(),
        revised_assessment_text,
        old_ai_grade: assessment.initial_ai_score(),
        new_ai_grade,
        user_grade: assessment.teacher_score.map(f64::from),
        time_spent_seconds,
        extra: json!({
            "fullAssessmentSnapshot": assessment.snapshot(),
            "fullCriterionSnapshot": criterion,
            "timestamp": format_offset(OffsetDateTime::now_utc()),
        }),
    }
}
