use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::schemas::oracle::{
    AssessmentPayload, CriterionPayload, EvidencePayload, ExtractionPayload,
    JustificationPayload, OverallPayload, RevisionPayload, ScoreRangePayload,
};
use crate::services::grade_log::{GradeRecord, GradeSink};
use crate::services::oracle::{
    AssessmentOptions, CriterionScoreSummary, GradingOracle, OracleError,
};
use crate::session::document::EssayDocument;
use crate::session::model::{
    AssessmentLength, AssessmentType, ContextNote, Justification, RubricCriterion,
};
use crate::session::GradingSession;

pub(crate) const SAMPLE_ESSAY: &str = "[PAGE 1]\nThe argument opens with a clear thesis. \
Evidence is drawn from two case studies.\n[PAGE 2]\nThe conclusion restates the thesis without \
extending it.";

pub(crate) const SAMPLE_RUBRIC: &str = "Criterion: Argument quality. 1 = no discernible \
argument, 5 = compelling argument throughout.";

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<AsyncMutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(AsyncMutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    for key in [
        "ENVIRONMENT",
        "ORACLE_API_KEY",
        "ORACLE_BASE_URL",
        "ORACLE_MODEL",
        "ORACLE_FALLBACK_MODEL",
        "ORACLE_MAX_TOKENS",
        "ORACLE_REQUEST_TIMEOUT",
        "ASSESSMENT_TYPE",
        "ASSESSMENT_LENGTH",
        "ESSAY_PATH",
        "RUBRIC_PATH",
        "GRADE_LOG_ENABLED",
        "GRADE_LOG_DB",
        "GRADEBENCH_LOG_LEVEL",
        "GRADEBENCH_LOG_JSON",
    ] {
        std::env::remove_var(key);
    }

    std::env::set_var("GRADEBENCH_ENV", "test");
    std::env::set_var("GRADEBENCH_STRICT_CONFIG", "0");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
}

/// Oracle double that answers from pre-queued results and panics on any call
/// it was not scripted for. Call counters let tests assert idempotence.
#[derive(Default)]
pub(crate) struct ScriptedOracle {
    extractions: Mutex<VecDeque<Result<ExtractionPayload, OracleError>>>,
    assessments: Mutex<VecDeque<Result<AssessmentPayload, OracleError>>>,
    revisions: Mutex<VecDeque<Result<RevisionPayload, OracleError>>>,
    syntheses: Mutex<VecDeque<Result<OverallPayload, OracleError>>>,
    pub(crate) extract_calls: AtomicUsize,
    pub(crate) assess_calls: AtomicUsize,
    pub(crate) revise_calls: AtomicUsize,
    pub(crate) synthesize_calls: AtomicUsize,
}

impl ScriptedOracle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_extraction(self, result: Result<ExtractionPayload, OracleError>) -> Self {
        self.extractions.lock().expect("extractions lock").push_back(result);
        self
    }

    pub(crate) fn with_assessment(self, result: Result<AssessmentPayload, OracleError>) -> Self {
        self.assessments.lock().expect("assessments lock").push_back(result);
        self
    }

    pub(crate) fn with_revision(self, result: Result<RevisionPayload, OracleError>) -> Self {
        self.revisions.lock().expect("revisions lock").push_back(result);
        self
    }

    pub(crate) fn with_synthesis(self, result: Result<OverallPayload, OracleError>) -> Self {
        self.syntheses.lock().expect("syntheses lock").push_back(result);
        self
    }
}

#[async_trait]
impl GradingOracle for ScriptedOracle {
    async fn extract_criteria(
        &self,
        _rubric_text: &str,
    ) -> Result<ExtractionPayload, OracleError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        self.extractions
            .lock()
            .expect("extractions lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected extract_criteria call"))
    }

    async fn assess_criterion(
        &self,
        _document: &EssayDocument,
        _criterion: &RubricCriterion,
        _options: &AssessmentOptions,
        _context_notes: &[ContextNote],
    ) -> Result<AssessmentPayload, OracleError> {
        self.assess_calls.fetch_add(1, Ordering::SeqCst);
        self.assessments
            .lock()
            .expect("assessments lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected assess_criterion call"))
    }

    async fn revise_score(
        &self,
        _document: &EssayDocument,
        _criterion: &RubricCriterion,
        _original: &Justification,
        _edited: &Justification,
        _preceding_score: Option<f64>,
    ) -> Result<RevisionPayload, OracleError> {
        self.revise_calls.fetch_add(1, Ordering::SeqCst);
        self.revisions
            .lock()
            .expect("revisions lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected revise_score call"))
    }

    async fn synthesize_overall(
        &self,
        _document: &EssayDocument,
        _summaries: &[CriterionScoreSummary],
        _context_notes: &[ContextNote],
    ) -> Result<OverallPayload, OracleError> {
        self.synthesize_calls.fetch_add(1, Ordering::SeqCst);
        self.syntheses
            .lock()
            .expect("syntheses lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected synthesize_overall call"))
    }
}

/// Sink that keeps every record in memory for assertions.
#[derive(Default)]
pub(crate) struct CollectingSink {
    records: Mutex<Vec<GradeRecord>>,
}

impl CollectingSink {
    pub(crate) fn records(&self) -> Vec<GradeRecord> {
        self.records.lock().expect("records lock").clone()
    }
}

#[async_trait]
impl GradeSink for CollectingSink {
    async fn record(&self, record: GradeRecord) -> anyhow::Result<()> {
        self.records.lock().expect("records lock").push(record);
        Ok(())
    }
}

/// Records are spawned off the session's transitions, so tests yield until
/// they land in the sink.
pub(crate) async fn wait_for_records(sink: &CollectingSink, count: usize) {
    for _ in 0..200 {
        if sink.records().len() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("expected {count} grade records, found {}", sink.records().len());
}

pub(crate) fn scripted_session(
    oracle: Arc<ScriptedOracle>,
) -> (GradingSession, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let options = AssessmentOptions {
        assessment_type: AssessmentType::Flow,
        assessment_length: AssessmentLength::Long,
    };
    let session = GradingSession::new(oracle, Arc::clone(&sink) as Arc<dyn GradeSink>, options);
    (session, sink)
}

/// Session already in Grading with essay, rubric and the first criterion
/// assessed, using whatever the oracle was scripted with.
pub(crate) async fn grading_session(
    oracle: Arc<ScriptedOracle>,
) -> (GradingSession, Arc<CollectingSink>) {
    let (mut session, sink) = scripted_session(oracle);
    session.set_document_text(SAMPLE_ESSAY).expect("essay");
    session.set_rubric_text(SAMPLE_RUBRIC).expect("rubric");
    session.start_grading().await.expect("start grading");
    (session, sink)
}

pub(crate) fn extraction_of(criteria: &[(&str, i32, i32)]) -> ExtractionPayload {
    let entries = criteria
        .iter()
        .map(|&(name, min, max)| CriterionPayload {
            name: Some(name.to_string()),
            score_range: Some(ScoreRangePayload { min, max }),
            levels: None,
        })
        .collect();
    ExtractionPayload::Criteria(entries)
}

pub(crate) fn prose_assessment(text: &str, score: f64) -> AssessmentPayload {
    AssessmentPayload {
        justification: JustificationPayload::Prose(text.to_string()),
        evidence: Vec::new(),
        score: Some(score),
    }
}

pub(crate) fn bullets_assessment(items: &[&str], score: f64) -> AssessmentPayload {
    AssessmentPayload {
        justification: JustificationPayload::Bullets(
            items.iter().map(|item| item.to_string()).collect(),
        ),
        evidence: Vec::new(),
        score: Some(score),
    }
}

pub(crate) fn evidence_item(
    quote: &str,
    paragraph: Option<i64>,
    related: &[i64],
) -> EvidencePayload {
    EvidencePayload {
        quote: quote.to_string(),
        paragraph: paragraph.map(Value::from),
        related_assessment_indexes: related.to_vec(),
    }
}

pub(crate) fn revision_of(score: f64, rationale: &str) -> RevisionPayload {
    RevisionPayload { revised_score: Some(score), rationale: rationale.to_string() }
}

pub(crate) fn overall_of(strengths: &str, improvements: &str, advice: &str) -> OverallPayload {
    OverallPayload {
        strengths: strengths.to_string(),
        improvements: improvements.to_string(),
        overall_grade: None,
        advice: advice.to_string(),
    }
}
