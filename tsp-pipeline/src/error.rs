//! Error types for the pipeline crate.

use thiserror::Error;
use tsp_core::CoreError;
use tsp_plugin::PluginError;

/// Errors raised while building or running a processing chain.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Inconsistent or invalid options.
    #[error("configuration error: {0}")]
    Config(String),

    /// Buffer allocation or another core failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A plugin could not be resolved or instantiated.
    #[error(transparent)]
    Load(#[from] PluginError),

    /// A plugin failed while the chain was running.
    #[error("stage {stage} ({name}): {source}")]
    Plugin {
        stage: usize,
        name: String,
        #[source]
        source: PluginError,
    },

    /// A stage aborted and the chain terminated with an error.
    #[error("stage {stage} ({name}) aborted")]
    Aborted { stage: usize, name: String },

    /// The control channel could not be started.
    #[error("control channel: {0}")]
    Control(std::io::Error),

    /// An executor thread failed to start or panicked.
    #[error("executor thread failure: {0}")]
    Thread(String),
}

/// Result alias using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;
