use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("environment variable ${{{0}}} referenced by the config file is not set")]
    UnresolvedVar(String),

    #[error("{location}: {message}")]
    Validation { location: String, message: String },

    #[error("environment: {0}")]
    Environment(String),
}

impl Error {
    pub(crate) fn validation(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// The crate result type.
pub type Result<T> = std::result::Result<T, Error>;
