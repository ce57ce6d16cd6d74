use crate::tree::DepNode;
use anyhow::Result;
use dirs::data_local_dir;
use std::path::PathBuf;

pub const DEFAULT_CONCURRENCY: usize = 50;

pub fn default_cache_root() -> PathBuf {
    let mut root = data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    root.push("packmap");
    root.push("store");
    root.push("v1");
    root
}

fn default_global_prefix() -> PathBuf {
    let mut root = data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    root.push("packmap");
    root.push("global");
    root
}

/// Everything the installer can be told. `restore` defaults to true;
/// setting it to false allows cached package metadata to short-circuit
/// fetches.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub cache: PathBuf,
    pub prefix: Option<PathBuf>,
    pub global: bool,
    pub restore: bool,
    pub dev: bool,
    pub development: bool,
    pub production: bool,
    pub only: Option<String>,
    pub also: Option<String>,
    pub force: bool,
    pub ignore_scripts: bool,
    pub concurrency: usize,
}

impl Default for InstallOptions {
    fn default() -> Self {
        InstallOptions {
            cache: default_cache_root(),
            prefix: None,
            global: false,
            restore: true,
            dev: false,
            development: false,
            production: false,
            only: None,
            also: None,
            force: false,
            ignore_scripts: false,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

fn dev_match(value: &str) -> bool {
    matches!(value, "dev" | "development")
}

fn prod_match(value: &str) -> bool {
    matches!(value, "prod" | "production")
}

impl InstallOptions {
    pub fn resolve_prefix(&self) -> Result<PathBuf> {
        if let Some(prefix) = &self.prefix {
            return Ok(prefix.clone());
        }
        if self.global {
            return Ok(default_global_prefix());
        }
        Ok(std::env::current_dir()?)
    }

    pub fn include_dev(&self) -> bool {
        let only = self.only.as_deref();
        self.dev
            || self.development
            || (!only.map(prod_match).unwrap_or(false) && !self.production)
            || only.map(dev_match).unwrap_or(false)
            || self.also.as_deref().map(dev_match).unwrap_or(false)
    }

    pub fn include_prod(&self) -> bool {
        !self.only.as_deref().map(dev_match).unwrap_or(false)
    }

    pub fn includes(&self, node: &DepNode) -> bool {
        if node.dev {
            self.include_dev()
        } else {
            self.include_prod()
        }
    }
}
