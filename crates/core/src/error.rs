#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unrecognised progress value in '{field}': {value}")]
    Progress { field: String, value: String },
}
