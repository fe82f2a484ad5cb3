#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Storage error for '{name}': {source}")]
    Storage {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
