use std::sync::Arc;

use crate::core::config::Settings;
use crate::services::grade_log::GradeSink;
use crate::services::oracle::GradingOracle;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    oracle: Arc<dyn GradingOracle>,
    sink: Arc<dyn GradeSink>,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        oracle: Arc<dyn GradingOracle>,
        sink: Arc<dyn GradeSink>,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, oracle, sink }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn oracle(&self) -> Arc<dyn GradingOracle> {
        Arc::clone(&self.inner.oracle)
    }

    pub(crate) fn sink(&self) -> Arc<dyn GradeSink> {
        Arc::clone(&self.inner.sink)
    }
}
