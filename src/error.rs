//! Error handling for the image embedding pipeline
//!
//! A single `EmbeddingError` covers every failure the runner and the
//! generators can surface. Provenance failures keep their own type so the
//! runner can attach the name of the collaborator call that failed.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Main error type for the embedding pipeline
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// A required parameter was not supplied
    #[error("{0}")]
    Configuration(String),

    /// The output directory already exists
    #[error("{} already exists", .0.display())]
    Collision(PathBuf),

    #[error("Unable to access {}: {source}", path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed side table {}: {message}", path.display())]
    SideTable { path: PathBuf, message: String },

    /// Model fetch failed, returned a non-success status or was cut short
    #[error("Transfer of {locator} failed: {message}")]
    Transfer { locator: String, message: String },

    /// An operation was invoked in the wrong lifecycle state
    #[error("{0}")]
    State(String),

    #[error("Provenance call {operation} failed: {source}")]
    Provenance {
        operation: &'static str,
        #[source]
        source: ProvenanceError,
    },

    #[error("Unable to load image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl EmbeddingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EmbeddingError::Configuration(message.into())
    }

    pub fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EmbeddingError::FileAccess {
            path: path.into(),
            source,
        }
    }

    pub fn transfer(locator: impl Into<String>, message: impl ToString) -> Self {
        EmbeddingError::Transfer {
            locator: locator.into(),
            message: message.to_string(),
        }
    }
}

/// Errors raised by a provenance collaborator
#[derive(Error, Debug)]
pub enum ProvenanceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid crate metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("No RO-Crate found in {}", .0.display())]
    MissingCrate(PathBuf),

    #[error("{0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_message_is_verbatim() {
        let err = EmbeddingError::configuration("inputdir must be set");
        assert_eq!("inputdir must be set", err.to_string());
    }

    #[test]
    fn test_provenance_error_names_operation() {
        let err = EmbeddingError::Provenance {
            operation: "register_software",
            source: ProvenanceError::Rejected("no space left".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("register_software"));
        assert!(text.contains("no space left"));
    }
}
