//! # Model Lifecycle
//!
//! Everything about getting a speech model from "never heard of it" to a
//! loaded handle and back:
//! - **registry**: known identifiers, descriptors and the name mapping
//! - **manager**: the lifecycle state machine shared by all requests
//! - **loader**: hub fetch and on-disk load behind a trait
//! - **error**: lifecycle errors

pub mod error;
pub mod loader;
pub mod manager;
pub mod registry;

pub use error::ModelError;
pub use loader::{ModelLoader, WhisperLoader};
pub use manager::{DeleteOutcome, DownloadOutcome, ModelLookup, ModelManager};
