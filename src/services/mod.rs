pub(crate) mod ai_oracle;
pub(crate) mod grade_log;
pub(crate) mod oracle;
