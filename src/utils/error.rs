//! Error Handling Module
//!
//! Defines the error types used across the fine-tuning library.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for fine-tuning operations
#[derive(Error, Debug)]
pub enum FinetuneError {
    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with the image-folder layout or its contents
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Invalid transform specification or a transform that cannot be applied
    #[error("Transform error: {0}")]
    Transform(String),

    /// Error building or restoring a model
    #[error("Model error: {0}")]
    Model(String),

    /// Error during training or evaluation
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while fetching pretrained weights
    #[error("Download error: {0}")]
    Download(String),

    /// Failure while saving or loading a burn record
    #[error("Record error: {0}")]
    Record(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
}

impl From<serde_json::Error> for FinetuneError {
    fn from(err: serde_json::Error) -> Self {
        FinetuneError::Serialization(err.to_string())
    }
}

/// Convenience Result type
pub type Result<T> = std::result::Result<T, FinetuneError>;

/// Why a previously saved model could not be restored.
///
/// Returned by the explicit load attempt so the caller decides whether to
/// fall back to a freshly constructed model.
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("no saved model at '{0}'")]
    NotFound(PathBuf),

    #[error("could not restore '{path}': {reason}")]
    Record { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FinetuneError::Dataset("missing split 'valid'".to_string());
        assert_eq!(format!("{}", err), "Dataset error: missing split 'valid'");
    }

    #[test]
    fn test_image_load_error() {
        let path = PathBuf::from("/data/train/cat/001.jpg");
        let err = FinetuneError::ImageLoad(path, "unsupported format".to_string());
        assert!(format!("{}", err).contains("001.jpg"));
    }

    #[test]
    fn test_json_error_converts() {
        let parsed: std::result::Result<serde_json::Value, _> = serde_json::from_str("{lr:");
        let err: FinetuneError = parsed.unwrap_err().into();
        assert!(matches!(err, FinetuneError::Serialization(_)));
    }

    #[test]
    fn test_model_load_error_mentions_path() {
        let err = ModelLoadError::NotFound(PathBuf::from("/tmp/missing.mpk"));
        assert!(err.to_string().contains("missing.mpk"));
    }
}
