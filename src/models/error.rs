//! Model lifecycle error types

use thiserror::Error;

/// Errors surfaced by the model lifecycle manager.
///
/// Background download failures never show up here: they are recorded as the
/// `error` phase of the identifier and only become visible through a status query.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Identifier is neither in the registry nor a fully-qualified `owner/name`
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Delete requested while the model is being downloaded or loaded
    #[error("Model {model} is {phase}, refusing to delete it")]
    Busy { model: String, phase: &'static str },

    /// Removing the on-disk model directory failed
    #[error("Failed to delete files of model {model}: {source}")]
    DeleteFailed {
        model: String,
        #[source]
        source: std::io::Error,
    },
}
