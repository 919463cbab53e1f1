//! Built-in plugins.
//!
//! Two plugins ship inside the binary so that a chain works without any
//! shared library: `file` (input and output, path or `-` for the standard
//! streams) and `filter` (PID-based drop/null/label processor). They are
//! also the default input and output when the command line names none.

mod file;
mod filter;

pub use file::{FileInput, FileOutput};
pub use filter::Filter;

use crate::declaration::PluginRegistrar;

/// Register every built-in plugin.
pub fn register(registrar: &mut dyn PluginRegistrar) {
    registrar.register_input("file", file::new_input);
    registrar.register_output("file", file::new_output);
    registrar.register_processor("filter", filter::new);
}
