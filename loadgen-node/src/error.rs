use thiserror::Error;

/// Errors that can occur while preparing or finalizing a load run
#[derive(Error, Debug)]
pub enum LoadgenError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested profile key is not in the catalog
    #[error("Unknown profile '{0}'")]
    UnknownProfile(String),

    /// Auth token environment variable missing or blank
    #[error("No token for profile '{profile}': set {env_key}")]
    MissingToken { profile: String, env_key: String },

    /// Dataset location could not be opened or parsed
    #[error("Data source error at {location}: {reason}")]
    DataSource { location: String, reason: String },

    /// Zero rows survived the row filter
    #[error("No rows loaded. Check dataset at: {location}")]
    EmptyDataset { location: String },

    /// Threshold expression could not be parsed
    #[error("Invalid threshold '{expression}': {reason}")]
    Threshold { expression: String, reason: String },

    /// HTTP transport construction error
    #[error("Transport error: {0}")]
    Transport(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl LoadgenError {
    /// Errors that stop a run before any VU is scheduled
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LoadgenError::Config(_)
                | LoadgenError::UnknownProfile(_)
                | LoadgenError::MissingToken { .. }
                | LoadgenError::DataSource { .. }
                | LoadgenError::EmptyDataset { .. }
                | LoadgenError::Threshold { .. }
        )
    }
}

/// Result type alias using LoadgenError
pub type Result<T> = std::result::Result<T, LoadgenError>;

impl From<String> for LoadgenError {
    fn from(s: String) -> Self {
        LoadgenError::Other(s)
    }
}

impl From<&str> for LoadgenError {
    fn from(s: &str) -> Self {
        LoadgenError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for LoadgenError {
    fn from(err: serde_json::Error) -> Self {
        LoadgenError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LoadgenError {
    fn from(err: toml::de::Error) -> Self {
        LoadgenError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for LoadgenError {
    fn from(err: config::ConfigError) -> Self {
        LoadgenError::Config(err.to_string())
    }
}
