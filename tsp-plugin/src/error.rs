//! Error types for plugin handling.

use thiserror::Error;

/// Errors raised while resolving, loading or running plugins.
#[derive(Error, Debug)]
pub enum PluginError {
    /// No plugin with that name is registered or loadable.
    #[error("plugin '{name}' not found")]
    NotFound { name: String },

    /// A shared library could not be loaded.
    #[error("cannot load plugin library '{path}': {message}")]
    Load { path: String, message: String },

    /// The library does not carry a valid registration record.
    #[error("'{path}' is not a TSP plugin library")]
    BadDeclaration { path: String },

    /// The library was built against another plugin API version.
    #[error("plugin API version mismatch: library has {found}, expected {expected}")]
    ApiVersionMismatch { found: u32, expected: u32 },

    /// Two plugins registered under the same name and kind.
    #[error("plugin '{name}' already registered")]
    AlreadyRegistered { name: String },

    /// Bad plugin command-line arguments.
    #[error("{plugin}: {message}")]
    Options { plugin: String, message: String },

    /// A plugin start/stop/send operation failed.
    #[error("{plugin}: {message}")]
    Runtime { plugin: String, message: String },

    /// I/O errors from plugin operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using [`PluginError`].
pub type Result<T> = std::result::Result<T, PluginError>;
