//! Kernel-side helper sources.
//!
//! Two Python sources ship with the crate: a sanity check that replies
//! `"pass"` under the reserved key, and the installer that registers the
//! helper object on the IPython shell. Both are embedded into an `exec` of a
//! raw triple-quoted string, so neither may contain the triple-quote
//! delimiter. That is checked once at load time.

use std::path::{Path, PathBuf};

use log::info;

/// Delimiter around embedded sources in the `exec` wrapper.
pub const EXEC_DELIMITER: &str = "\"\"\"";

pub const SANITY_CHECK_FILE: &str = "sanity_check.py";
pub const INSTALL_FILE: &str = "install_kernel_plugin.py";

/// Reply value of a healthy sanity check.
pub const PROBE_SUCCESS: &str = "pass";

/// Runs the variable explorer hook of an installed helper.
pub const VARIABLE_EXPLORER_CALL: &str =
    "get_ipython()._hydrogen_python.run('variable_explorer_hook')";

const BUNDLED_SANITY_CHECK: &str = include_str!("../py/sanity_check.py");
const BUNDLED_INSTALL: &str = include_str!("../py/install_kernel_plugin.py");

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Failed to read {name} from {path}: {source}")]
    Io {
        name: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} contains the reserved delimiter {delimiter}")]
    DelimiterCollision {
        name: &'static str,
        delimiter: &'static str,
    },
}

/// The two helper sources, validated and ready to embed.
#[derive(Debug, Clone)]
pub struct KernelResources {
    sanity_check: String,
    install: String,
}

impl KernelResources {
    /// Sources compiled into the crate.
    pub fn bundled() -> Result<Self, ResourceError> {
        Self::from_sources(BUNDLED_SANITY_CHECK, BUNDLED_INSTALL)
    }

    /// Read both sources from `dir`.
    pub fn load(dir: &Path) -> Result<Self, ResourceError> {
        let sanity_check = read_resource(dir, SANITY_CHECK_FILE)?;
        let install = read_resource(dir, INSTALL_FILE)?;
        let resources = Self::from_sources(sanity_check, install)?;
        info!("[resources] Loaded kernel helper sources from {}", dir.display());
        Ok(resources)
    }

    pub fn from_sources(
        sanity_check: impl Into<String>,
        install: impl Into<String>,
    ) -> Result<Self, ResourceError> {
        let sanity_check = sanity_check.into();
        let install = install.into();
        check_delimiter(SANITY_CHECK_FILE, &sanity_check)?;
        check_delimiter(INSTALL_FILE, &install)?;
        Ok(Self {
            sanity_check,
            install,
        })
    }

    /// Code that probes whether helpers can run in this kernel.
    pub fn probe_code(&self) -> String {
        wrap_for_exec(&self.sanity_check)
    }

    /// Code that installs the helper.
    pub fn install_code(&self) -> String {
        wrap_for_exec(&self.install)
    }
}

fn read_resource(dir: &Path, name: &'static str) -> Result<String, ResourceError> {
    let path = dir.join(name);
    std::fs::read_to_string(&path).map_err(|source| ResourceError::Io { name, path, source })
}

fn check_delimiter(name: &'static str, source: &str) -> Result<(), ResourceError> {
    if source.contains(EXEC_DELIMITER) {
        return Err(ResourceError::DelimiterCollision {
            name,
            delimiter: EXEC_DELIMITER,
        });
    }
    Ok(())
}

/// Embed `source` in a statement that runs it in a fresh global namespace,
/// keeping helper names out of the user's variables.
fn wrap_for_exec(source: &str) -> String {
    format!(
        "exec(r{delim}{source}{delim}, {{}})",
        delim = EXEC_DELIMITER,
        source = source.trim_end()
    )
}
