use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// One flat telemetry row, emitted when the grader leaves a criterion and
/// when the session finishes.
#[derive(Debug, Clone)]
pub(crate) struct GradeRecord {
    pub(crate) essay_id: String,
    pub(crate) criterion_id: String,
    pub(crate) assessment_text: String,
    pub(crate) revised_assessment_text: Option<String>,
    pub(crate) old_ai_grade: Option<f64>,
    pub(crate) new_ai_grade: Option<f64>,
    pub(crate) user_grade: Option<f64>,
    pub(crate) time_spent_seconds: f64,
    pub(crate) extra: serde_json::Value,
}

#[async_trait]
pub(crate) trait GradeSink: Send + Sync {
    async fn record(&self, record: GradeRecord) -> Result<()>;
}

const GRADES_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS grades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT DEFAULT CURRENT_TIMESTAMP,
    essay_id TEXT,
    criterion_id TEXT,
    user_grade REAL,
    assessment_text TEXT,
    revised_assessment_text TEXT,
    old_ai_grade REAL,
    new_ai_grade REAL,
    time_spent_seconds REAL,
    extra_data TEXT
)";

pub(crate) struct SqliteGradeLog {
    pool: SqlitePool,
}

impl SqliteGradeLog {
    pub(crate) async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open grade log database")?;

        sqlx::query(GRADES_SCHEMA)
            .execute(&pool)
            .await
            .context("Failed to create grades table")?;

        tracing::info!(path, "Grade log database ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl GradeSink for SqliteGradeLog {
    async fn record(&self, record: GradeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO grades (essay_id, criterion_id, user_grade, assessment_text, \
             revised_assessment_text, old_ai_grade, new_ai_grade, time_spent_seconds, extra_data) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.essay_id)
        .bind(&record.criterion_id)
        .bind(record.user_grade)
        .bind(&record.assessment_text)
        .bind(&record.revised_assessment_text)
        .bind(record.old_ai_grade)
        .bind(record.new_ai_grade)
        .bind(record.time_spent_seconds)
        .bind(record.extra.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to insert grade record")?;

        metrics::counter!("grade_records_total", "sink" => "sqlite").increment(1);
        tracing::debug!(
            essay_id = %record.essay_id,
            criterion_id = %record.criterion_id,
            "Grade record stored"
        );
        Ok(())
    }
}

/// Sink used when grade logging is disabled: records are logged at debug
/// and dropped.
pub(crate) struct NullGradeLog;

#[async_trait]
impl GradeSink for NullGradeLog {
    async fn record(&self, record: GradeRecord) -> Result<()> {
        metrics::counter!("grade_records_total", "sink" => "null").increment(1);
        tracing::debug!(
            essay_id = %record.essay_id,
            criterion_id = %record.criterion_id,
            "Grade logging disabled, dropping record"
        );
        Ok(())
    }
}
