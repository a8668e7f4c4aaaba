use std::env;

use super::types::{ConfigError, Environment};
use crate::session::model::{AssessmentLength, AssessmentType};

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|item| item.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

pub(super) fn parse_assessment_type(
    field: &'static str,
    value: String,
) -> Result<AssessmentType, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "flow" => Ok(AssessmentType::Flow),
        "bullets" => Ok(AssessmentType::Bullets),
        _ => Err(ConfigError::InvalidValue { field, value }),
    }
}

pub(super) fn parse_assessment_length(
    field: &'static str,
    value: String,
) -> Result<AssessmentLength, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "short" => Ok(AssessmentLength::Short),
        "medium" => Ok(AssessmentLength::Medium),
        "long" => Ok(AssessmentLength::Long),
        _ => Err(ConfigError::InvalidValue { field, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }

    #[test]
    fn parse_environment_variants() {
        assert_eq!(parse_environment(Some("prod".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("production".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("staging".to_string())), Environment::Staging);
        assert_eq!(parse_environment(Some("testing".to_string())), Environment::Test);
        assert_eq!(parse_environment(None), Environment::Development);
    }

    #[test]
    fn parse_assessment_type_accepts_known_values() {
        let flow = parse_assessment_type("ASSESSMENT_TYPE", "Flow".to_string()).expect("flow");
        assert_eq!(flow, AssessmentType::Flow);
        let bullets =
            parse_assessment_type("ASSESSMENT_TYPE", "bullets".to_string()).expect("bullets");
        assert_eq!(bullets, AssessmentType::Bullets);
        assert!(parse_assessment_type("ASSESSMENT_TYPE", "prose".to_string()).is_err());
    }

    #[test]
    fn parse_assessment_length_accepts_known_values() {
        let short = parse_assessment_length("ASSESSMENT_LENGTH", "short".to_string()).expect("short");
        assert_eq!(short, AssessmentLength::Short);
        assert!(parse_assessment_length("ASSESSMENT_LENGTH", "huge".to_string()).is_err());
    }
}
