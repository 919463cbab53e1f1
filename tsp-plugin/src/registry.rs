//! Registry mapping plugin names to factories.

use std::collections::HashMap;

use tracing::info;

use crate::api::{InputFactory, OutputFactory, PluginKind, ProcessorFactory};
use crate::builtin;
use crate::context::PluginContext;
use crate::error::{PluginError, Result};
use crate::loader::{resolve_plugin_path, LoadedLibrary};
use crate::{InputPlugin, OutputPlugin, PluginRegistrar, ProcessorPlugin};

/// Central registry of plugin factories.
///
/// Built-ins are registered up front; unknown names fall back to the
/// dynamic loader at first use. Loaded libraries stay pinned for the
/// registry's lifetime.
#[derive(Default)]
pub struct PluginRegistry {
    inputs: HashMap<String, InputFactory>,
    processors: HashMap<String, ProcessorFactory>,
    outputs: HashMap<String, OutputFactory>,
    libraries: Vec<LoadedLibrary>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-seeded with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        registry
    }

    /// Resolve the factory of an input plugin, loading its library if
    /// needed.
    pub fn input_factory(&mut self, name: &str) -> Result<InputFactory> {
        if !self.inputs.contains_key(name) {
            self.load_by_name(name)?;
        }
        self.inputs
            .get(name)
            .copied()
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
            })
    }

    /// Resolve the factory of a processor plugin, loading its library if
    /// needed.
    pub fn processor_factory(&mut self, name: &str) -> Result<ProcessorFactory> {
        if !self.processors.contains_key(name) {
            self.load_by_name(name)?;
        }
        self.processors
            .get(name)
            .copied()
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
            })
    }

    /// Resolve the factory of an output plugin, loading its library if
    /// needed.
    pub fn output_factory(&mut self, name: &str) -> Result<OutputFactory> {
        if !self.outputs.contains_key(name) {
            self.load_by_name(name)?;
        }
        self.outputs
            .get(name)
            .copied()
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
            })
    }

    /// Create an input plugin instance, loading its library if needed.
    pub fn create_input(
        &mut self,
        name: &str,
        context: PluginContext,
        args: &[String],
    ) -> Result<Box<dyn InputPlugin>> {
        self.input_factory(name)?(context, args)
    }

    /// Create a processor plugin instance, loading its library if needed.
    pub fn create_processor(
        &mut self,
        name: &str,
        context: PluginContext,
        args: &[String],
    ) -> Result<Box<dyn ProcessorPlugin>> {
        self.processor_factory(name)?(context, args)
    }

    /// Create an output plugin instance, loading its library if needed.
    pub fn create_output(
        &mut self,
        name: &str,
        context: PluginContext,
        args: &[String],
    ) -> Result<Box<dyn OutputPlugin>> {
        self.output_factory(name)?(context, args)
    }

    /// All registered names with their kinds, sorted by name.
    pub fn list(&self) -> Vec<(String, PluginKind)> {
        let mut all: Vec<(String, PluginKind)> = self
            .inputs
            .keys()
            .map(|n| (n.clone(), PluginKind::Input))
            .chain(self.processors.keys().map(|n| (n.clone(), PluginKind::Processor)))
            .chain(self.outputs.keys().map(|n| (n.clone(), PluginKind::Output)))
            .collect();
        all.sort();
        all
    }

    /// Resolve and load a plugin library by name, registering whatever
    /// capabilities it declares.
    fn load_by_name(&mut self, name: &str) -> Result<()> {
        let path = resolve_plugin_path(name);
        let (library, declaration) = LoadedLibrary::open(&path).map_err(|e| match e {
            // A plain missing library reads better as "plugin not found".
            PluginError::Load { .. } if !path.exists() => PluginError::NotFound {
                name: name.to_string(),
            },
            other => other,
        })?;
        info!(name, path = %library.path().display(), "loading plugin library");
        // SAFETY: the declaration passed magic and version validation.
        unsafe { (declaration.register)(self) };
        self.libraries.push(library);
        Ok(())
    }
}

impl PluginRegistrar for PluginRegistry {
    fn register_input(&mut self, name: &str, factory: InputFactory) {
        self.inputs.insert(name.to_string(), factory);
    }

    fn register_processor(&mut self, name: &str, factory: ProcessorFactory) {
        self.processors.insert(name.to_string(), factory);
    }

    fn register_output(&mut self, name: &str, factory: OutputFactory) {
        self.outputs.insert(name.to_string(), factory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = PluginRegistry::with_builtins();
        let names = registry.list();
        assert!(names.contains(&("file".to_string(), PluginKind::Input)));
        assert!(names.contains(&("file".to_string(), PluginKind::Output)));
        assert!(names.contains(&("filter".to_string(), PluginKind::Processor)));
    }

    #[test]
    fn test_unknown_plugin_not_found() {
        let mut registry = PluginRegistry::with_builtins();
        let ctx = PluginContext::standalone("test");
        let result = registry.create_processor("no_such_plugin", ctx, &[]);
        assert!(matches!(result, Err(PluginError::NotFound { .. })));
    }

    #[test]
    fn test_filter_instantiation() {
        let mut registry = PluginRegistry::with_builtins();
        let ctx = PluginContext::standalone("filter");
        let args = vec!["--pid".to_string(), "0x100".to_string(), "--drop".to_string()];
        assert!(registry.create_processor("filter", ctx, &args).is_ok());
    }
}
