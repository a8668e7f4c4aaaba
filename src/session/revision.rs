use time::OffsetDateTime;

use crate::session::errors::SessionError;
use crate::session::model::{AssessmentType, CriterionAssessment, Justification, Revision};

/// Everything the oracle call needs to resolve a pending edit, captured
/// before the optimistic revision is appended. The generation stamp lets the
/// session discard resolutions that arrive after a restart.
#[derive(Debug, Clone)]
pub(crate) struct RevisionTicket {
    pub(crate) criterion_id: String,
    pub(crate) generation: u64,
    pub(crate) preceding_score: Option<f64>,
    pub(crate) old_justification: Justification,
    pub(crate) edited: Justification,
}

#[derive(Debug)]
pub(crate) enum EditOutcome {
    /// The edit matched the current justification; a copied revision was
    /// appended and no oracle call is needed.
    NoOp,
    /// An optimistic revision was appended and awaits resolution.
    Pending(RevisionTicket),
}

#[derive(Debug)]
pub(crate) enum RevisionOutcome {
    Rescored { score: f64, rationale: String },
    /// The oracle could not produce a usable re-score. The carried score
    /// stands and the rationale explains why.
    Degraded { rationale: String },
}

/// First phase of an edit. Validates the edited justification, then appends
/// a revision immediately so the UI reflects the edit before the oracle
/// answers. The appended revision carries the preceding score and an empty
/// rationale until `resolve_revision` fills them in.
pub(crate) fn begin_revision(
    assessment: &mut CriterionAssessment,
    edited: Justification,
    assessment_type: AssessmentType,
    generation: u64,
    now: OffsetDateTime,
) -> Result<EditOutcome, SessionError> {
    if assessment.is_revising {
        return Err(SessionError::ConcurrentRevision(assessment.criterion_id.clone()));
    }

    let edited = edited.normalized();
    if edited.is_empty() {
        return Err(SessionError::Validation(
            "edited justification must not be empty".to_string(),
        ));
    }
    if !edited.matches_type(assessment_type) {
        return Err(SessionError::Validation(format!(
            "edited justification must be {} form",
            assessment_type.as_str()
        )));
    }

    let current = assessment.current();
    let preceding_score = current.ai_score;

    if edited == current.justification {
        let copied = Revision {
            justification: edited,
            ai_score: preceding_score,
            rationale: current.rationale.clone(),
            preceding_ai_score: preceding_score,
            created_at: now,
        };
        assessment.push_revision(copied);
        return Ok(EditOutcome::NoOp);
    }

    let ticket = RevisionTicket {
        criterion_id: assessment.criterion_id.clone(),
        generation,
        preceding_score,
        old_justification: current.justification.clone(),
        edited: edited.clone(),
    };

    assessment.push_revision(Revision {
        justification: edited,
        ai_score: preceding_score,
        rationale: Some(String::new()),
        preceding_ai_score: preceding_score,
        created_at: now,
    });
    assessment.is_revising = true;

    Ok(EditOutcome::Pending(ticket))
}

/// Second phase of an edit. Fills in the pending revision in place and
/// clears the in-flight flag. Degraded outcomes keep the carried score.
pub(crate) fn resolve_revision(assessment: &mut CriterionAssessment, outcome: RevisionOutcome) {
    let revision = assessment.current_mut();
    match outcome {
        RevisionOutcome::Rescored { score, rationale } => {
            revision.ai_score = Some(score);
            revision.rationale = Some(rationale);
        }
        RevisionOutcome::Degraded { rationale } => {
            revision.rationale = Some(rationale);
        }
    }
    assessment.is_revising = false;
}
