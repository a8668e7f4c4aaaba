use super::parsing::{
    env_optional, env_or_default, parse_assessment_length, parse_assessment_type, parse_bool,
    parse_environment, parse_u32, parse_u64,
};
use super::types::{
    ConfigError, GradingSettings, OracleSettings, RuntimeSettings, Settings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let environment = parse_environment(
            env_optional("GRADEBENCH_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("GRADEBENCH_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let api_key = env_or_default("ORACLE_API_KEY", "");
        let base_url = env_or_default(
            "ORACLE_BASE_URL",
            "https://generativelanguage.googleapis.com/v1beta/openai",
        );
        let model = env_or_default("ORACLE_MODEL", "gemini-2.0-flash");
        let fallback_model = env_or_default("ORACLE_FALLBACK_MODEL", "gemini-1.5-flash");
        let max_tokens =
            parse_u32("ORACLE_MAX_TOKENS", env_or_default("ORACLE_MAX_TOKENS", "2048"))?;
        let request_timeout =
            parse_u64("ORACLE_REQUEST_TIMEOUT", env_or_default("ORACLE_REQUEST_TIMEOUT", "120"))?;

        let assessment_type =
            parse_assessment_type("ASSESSMENT_TYPE", env_or_default("ASSESSMENT_TYPE", "flow"))?;
        let assessment_length = parse_assessment_length(
            "ASSESSMENT_LENGTH",
            env_or_default("ASSESSMENT_LENGTH", "long"),
        )?;
        let essay_path = env_or_default("ESSAY_PATH", "essay.txt");
        let rubric_path = env_or_default("RUBRIC_PATH", "rubric.txt");
        let grade_log_enabled =
            env_optional("GRADE_LOG_ENABLED").map(|value| parse_bool(&value)).unwrap_or(true);
        let grade_log_db = env_or_default("GRADE_LOG_DB", "grades.db");

        let log_level = env_or_default("GRADEBENCH_LOG_LEVEL", "info");
        let json = env_optional("GRADEBENCH_LOG_JSON")
            .map(|value| parse_bool(&value))
            .unwrap_or(false);
        let prometheus_enabled = env_optional("PROMETHEUS_ENABLED")
            .map(|value| parse_bool(&value))
            .unwrap_or(false);

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            oracle: OracleSettings {
                api_key,
                base_url,
                model,
                fallback_model,
                max_tokens,
                request_timeout,
            },
            grading: GradingSettings {
                assessment_type,
                assessment_length,
                essay_path,
                rubric_path,
                grade_log_enabled,
                grade_log_db,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub(crate) fn oracle(&self) -> &OracleSettings {
        &self.oracle
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.oracle.max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ORACLE_MAX_TOKENS",
                value: "0".to_string(),
            });
        }

        if self.oracle.request_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ORACLE_REQUEST_TIMEOUT",
                value: "0".to_string(),
            });
        }

        if self.grading.grade_log_enabled && self.grading.grade_log_db.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "GRADE_LOG_DB",
                value: String::from("<empty>"),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.oracle.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("ORACLE_API_KEY"));
        }
        if self.oracle.base_url.is_empty() {
            return Err(ConfigError::MissingSecret("ORACLE_BASE_URL"));
        }

        let essay_path = std::path::Path::new(&self.grading.essay_path);
        if !essay_path.exists() || !essay_path.is_file() {
            return Err(ConfigError::InvalidValue {
                field: "ESSAY_PATH",
                value: self.grading.essay_path.clone(),
            });
        }

        let rubric_path = std::path::Path::new(&self.grading.rubric_path);
        if !rubric_path.exists() || !rubric_path.is_file() {
            return Err(ConfigError::InvalidValue {
                field: "RUBRIC_PATH",
                value: self.grading.rubric_path.clone(),
            });
        }

        Ok(())
    }
}
