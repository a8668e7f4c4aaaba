use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error(transparent)]
    RubricParse(#[from] RubricParseError),
    #[error("the grading model is overloaded; try again in a few minutes")]
    OracleOverloaded,
    #[error("the grading model returned an unusable response: {0}")]
    OracleContract(String),
    #[error("operation not allowed: {0}")]
    Precondition(&'static str),
    #[error("a revision is already in flight for criterion {0}")]
    ConcurrentRevision(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RubricParseError {
    #[error("criteria payload is not valid JSON: {0}")]
    Syntax(String),
    #[error("no criteria could be extracted from the rubric")]
    NoCriteria,
    #[error("the provided text was not recognized as a grading rubric")]
    NotARubric,
    #[error("criterion {index}: {reason}")]
    InvalidCriterion { index: usize, reason: String },
}
