//! Registration record exported by shared-library plugins.
//!
//! A plugin library exports one static [`PluginDeclaration`] under the
//! symbol `TSP_PLUGIN_DECLARATION`. The loader validates the magic number
//! and the API version, then calls the registration function with a
//! registrar that records the library's factories.

use crate::api::{InputFactory, OutputFactory, ProcessorFactory};

/// Symbol name of the registration record.
pub const PLUGIN_DECLARATION_SYMBOL: &[u8] = b"TSP_PLUGIN_DECLARATION";

/// Magic number guarding against loading arbitrary libraries.
pub const PLUGIN_MAGIC: u64 = 0x5453_5f50_4c55_4731; // "TS_PLUG1"

/// Plugin API version. Incremented whenever the capability traits or this
/// record change incompatibly.
pub const API_VERSION: u32 = 3;

/// The record a plugin library exports.
#[repr(C)]
pub struct PluginDeclaration {
    /// Must equal [`PLUGIN_MAGIC`].
    pub magic: u64,
    /// Must equal the host's [`API_VERSION`].
    pub api_version: u32,
    /// Called once after loading to register the library's factories.
    pub register: unsafe extern "C" fn(registrar: &mut dyn PluginRegistrar),
}

/// Callback interface handed to a plugin library's registration function.
pub trait PluginRegistrar {
    /// Register an input plugin factory under `name`.
    fn register_input(&mut self, name: &str, factory: InputFactory);

    /// Register a processor plugin factory under `name`.
    fn register_processor(&mut self, name: &str, factory: ProcessorFactory);

    /// Register an output plugin factory under `name`.
    fn register_output(&mut self, name: &str, factory: OutputFactory);
}

/// Declare a plugin library's registration record.
///
/// ```ignore
/// fn register(registrar: &mut dyn tsp_plugin::PluginRegistrar) {
///     registrar.register_processor("mangle", mangle_factory);
/// }
/// tsp_plugin::declare_plugin!(register);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($register:path) => {
        #[no_mangle]
        pub static TSP_PLUGIN_DECLARATION: $crate::PluginDeclaration = {
            unsafe extern "C" fn __tsp_register(registrar: &mut dyn $crate::PluginRegistrar) {
                $register(registrar)
            }
            $crate::PluginDeclaration {
                magic: $crate::PLUGIN_MAGIC,
                api_version: $crate::API_VERSION,
                register: __tsp_register,
            }
        };
    };
}
