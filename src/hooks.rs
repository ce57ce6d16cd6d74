use crate::pkgmap::PackageMap;
use anyhow::Result;
use std::path::Path;

/// Lifecycle-script execution is owned by an external runner; the
/// installer only fires the hooks.
pub trait ScriptRunner: Send + Sync {
    fn run_lifecycle(&self, prefix: &Path, event: &str) -> Result<()>;
}

/// Places executables from installed packages on the project's bin path.
pub trait BinLinker: Send + Sync {
    fn link_bins(&self, prefix: &Path, map: &PackageMap) -> Result<()>;
}

pub struct NoopScriptRunner;

impl ScriptRunner for NoopScriptRunner {
    fn run_lifecycle(&self, _prefix: &Path, _event: &str) -> Result<()> {
        Ok(())
    }
}

pub struct NoopBinLinker;

impl BinLinker for NoopBinLinker {
    fn link_bins(&self, _prefix: &Path, _map: &PackageMap) -> Result<()> {
        Ok(())
    }
}
