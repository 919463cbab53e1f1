//! Locating and loading shared-library plugins.
//!
//! Plugin name `X` resolves in this order:
//!
//! 1. a name containing a path separator loads as a path;
//! 2. for each directory of `TSPLUGINS_PATH` (platform path-list
//!    separator), then the directory of the running executable:
//!    `tsplugin_X.<dylib-ext>`, `X.<dylib-ext>`, `X`;
//! 3. the bare name, left to the host dynamic loader's default search.

use std::env;
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::debug;

use crate::declaration::{PluginDeclaration, API_VERSION, PLUGIN_DECLARATION_SYMBOL, PLUGIN_MAGIC};
use crate::error::{PluginError, Result};

/// Environment variable listing extra plugin directories.
pub const PLUGIN_PATH_VAR: &str = "TSPLUGINS_PATH";

/// Resolve a plugin name to the path that will be loaded.
///
/// Returns the first existing candidate, or the bare name for the system
/// loader when nothing matched.
pub fn resolve_plugin_path(name: &str) -> PathBuf {
    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        return PathBuf::from(name);
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Ok(var) = env::var(PLUGIN_PATH_VAR) {
        dirs.extend(env::split_paths(&var));
    }
    if let Some(exe_dir) = env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        dirs.push(exe_dir);
    }

    let ext = env::consts::DLL_EXTENSION;
    for dir in &dirs {
        for candidate in [
            dir.join(format!("tsplugin_{name}.{ext}")),
            dir.join(format!("{name}.{ext}")),
            dir.join(name),
        ] {
            if candidate.is_file() {
                return candidate;
            }
        }
    }

    PathBuf::from(name)
}

/// A loaded plugin library, kept alive for as long as its factories may
/// be called.
pub(crate) struct LoadedLibrary {
    path: PathBuf,
    // Dropping the Library unmaps the code the factories point into; the
    // field only exists to pin the mapping.
    _library: Library,
}

impl LoadedLibrary {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Load a library, validate its declaration, and hand the declaration
    /// back together with the pinned library.
    pub(crate) fn open(path: &Path) -> Result<(Self, &'static PluginDeclaration)> {
        // SAFETY: loading a library runs its initializers; this is the
        // inherent contract of dynamic plugins.
        let library = unsafe { Library::new(path) }.map_err(|e| PluginError::Load {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        // SAFETY: the symbol is declared as a static PluginDeclaration by
        // the declare_plugin! macro; magic and version are checked before
        // anything in it is trusted.
        let declaration: &'static PluginDeclaration = unsafe {
            let symbol = library
                .get::<*const PluginDeclaration>(PLUGIN_DECLARATION_SYMBOL)
                .map_err(|_| PluginError::BadDeclaration {
                    path: path.display().to_string(),
                })?;
            &**symbol
        };

        if declaration.magic != PLUGIN_MAGIC {
            return Err(PluginError::BadDeclaration {
                path: path.display().to_string(),
            });
        }
        if declaration.api_version != API_VERSION {
            return Err(PluginError::ApiVersionMismatch {
                found: declaration.api_version,
                expected: API_VERSION,
            });
        }

        debug!(path = %path.display(), "plugin library loaded");
        Ok((
            Self {
                path: path.to_path_buf(),
                _library: library,
            },
            declaration,
        ))
    }
}
