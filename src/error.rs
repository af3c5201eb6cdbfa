//! Error handling for stagepipe
//!
//! This module defines the crate-wide error type and a Result alias for use
//! throughout the pipeline engine.

use crate::pipeline::id::SegmentId;
use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage or origin failed to prepare; nothing has been started
    #[error("Setup failed in stage '{stage}': {message}")]
    Setup { stage: String, message: String },

    /// A stage failed while processing an item
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    /// A segment thread panicked
    #[error("Segment {segment} ('{name}') panicked: {message}")]
    SegmentPanicked {
        segment: SegmentId,
        name: String,
        message: String,
    },

    /// A segment thread could not be spawned
    #[error("Failed to spawn segment thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The builder was asked for an impossible topology
    #[error("Invalid topology: {0}")]
    Topology(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipelineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for a runtime stage failure
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a preparation failure
    pub fn setup(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Setup {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Whether this error happened before any segment was started
    pub fn is_setup(&self) -> bool {
        match self {
            PipelineError::Setup { .. } | PipelineError::Topology(_) => true,
            PipelineError::WithContext { source, .. } => source.is_setup(),
            _ => false,
        }
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> PipelineResult<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> PipelineResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for PipelineResult<T> {
    fn context(self, context: impl Into<String>) -> PipelineResult<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> PipelineResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
