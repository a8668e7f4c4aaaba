pub(crate) mod core;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod session;
pub(crate) mod workbench;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::services::ai_oracle::AiOracleService;
use crate::services::grade_log::{GradeSink, NullGradeLog, SqliteGradeLog};

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let oracle = Arc::new(AiOracleService::from_settings(&settings)?);

    let sink: Arc<dyn GradeSink> = if settings.grading().grade_log_enabled {
        Arc::new(SqliteGradeLog::open(&settings.grading().grade_log_db).await?)
    } else {
        Arc::new(NullGradeLog)
    };

    tracing::info!(
        model = %settings.oracle().model,
        environment = %settings.runtime().environment.as_str(),
        assessment_type = settings.grading().assessment_type.as_str(),
        assessment_length = settings.grading().assessment_length.as_str(),
        "Gradebench starting"
    );

    let state = AppState::new(settings, oracle, sink);
    workbench::run(state).await
}
