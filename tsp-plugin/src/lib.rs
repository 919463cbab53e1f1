//! Plugin contract and loading for the TSP transport stream processor.
//!
//! A TSP chain is made of one input plugin, any number of packet processor
//! plugins, and one output plugin. This crate defines:
//!
//! - the capability traits each kind implements ([`InputPlugin`],
//!   [`ProcessorPlugin`], [`OutputPlugin`]) and the processor verdict
//!   [`PacketStatus`];
//! - the [`PluginContext`] handed to every plugin at construction: the
//!   thread-safe report sink, the declared bitrate, the aborting flag and
//!   the joint-termination hooks;
//! - dynamic loading of shared-library plugins through a `#[repr(C)]`
//!   registration record, plus the name resolution rules
//!   (`TSPLUGINS_PATH`, executable directory, system loader);
//! - the [`PluginRegistry`] mapping names to factories, pre-seeded with
//!   the built-in `file` and `filter` plugins.

mod api;
pub mod builtin;
mod context;
mod declaration;
mod error;
mod loader;
mod registry;

pub use api::{
    InputFactory, InputPlugin, OutputFactory, OutputPlugin, PacketStatus, Plugin, PluginKind,
    ProcessorFactory, ProcessorPlugin,
};
pub use context::{PluginContext, Report, SessionState, Severity};
pub use declaration::{PluginDeclaration, PluginRegistrar, API_VERSION, PLUGIN_MAGIC};
pub use error::{PluginError, Result};
pub use loader::resolve_plugin_path;
pub use registry::PluginRegistry;
