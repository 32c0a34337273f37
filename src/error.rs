use serde::Serialize;
use thiserror::Error;

/// One field-level problem found while validating the script JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

fn format_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.path, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures surfaced by the generation pipeline.
///
/// Script errors (`MalformedJson`, `InvalidSchema`) are recorded to the audit
/// log before they reach the caller. Per-scene image errors either abort the
/// batch or degrade to a prior result depending on the fan-out policy.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("script output is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("script output failed validation: {}", format_issues(.0))]
    InvalidSchema(Vec<SchemaIssue>),

    #[error("failed to decode scene image: {0}")]
    Decode(String),

    #[error("image backend authentication failed: {0}")]
    Auth(String),

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned an error response: {0}")]
    Provider(String),
}
