use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("packmap/0.1.0 (+https://github.com/packmap/packmap)")
        .build()
        .expect("http client")
});

static MANIFEST_CACHE: Lazy<Mutex<HashMap<String, ResolvedManifest>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registry document for one exact version, reduced to what the installer
/// needs to fill in a dep's missing identity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolvedManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "_resolved", default)]
    pub resolved: String,
    #[serde(rename = "_integrity", default)]
    pub integrity: String,
    #[serde(default)]
    pub dist: Dist,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dist {
    #[serde(default)]
    pub tarball: String,
    #[serde(default)]
    pub integrity: String,
}

impl ResolvedManifest {
    pub fn resolved_url(&self) -> &str {
        if !self.resolved.is_empty() {
            &self.resolved
        } else {
            &self.dist.tarball
        }
    }

    pub fn integrity_string(&self) -> &str {
        if !self.integrity.is_empty() {
            &self.integrity
        } else {
            &self.dist.integrity
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub integrity: Option<String>,
    pub resolved: Option<String>,
}

/// Source of package bytes and identity. The installer only ever sees this
/// trait; the registry client below is the production implementation.
pub trait PackageFetcher: Send + Sync {
    fn manifest(&self, spec: &str) -> Result<ResolvedManifest>;
    fn tarball_stream(&self, spec: &str, opts: &FetchOptions) -> Result<Box<dyn Read + Send>>;
}

#[derive(Debug, Clone)]
pub struct RegistryFetcher {
    registry: String,
}

impl RegistryFetcher {
    pub fn new(registry: Option<String>) -> Self {
        Self { registry: registry.unwrap_or_else(|| "https://registry.npmjs.org".into()) }
    }
}

impl PackageFetcher for RegistryFetcher {
    fn manifest(&self, spec: &str) -> Result<ResolvedManifest> {
        if let Some(hit) = MANIFEST_CACHE.lock().unwrap().get(spec).cloned() {
            return Ok(hit);
        }
        let (name, version) = spec
            .rsplit_once('@')
            .filter(|(name, _)| !name.is_empty())
            .with_context(|| format!("spec '{spec}' is not name@version"))?;
        let url = format!("{}/{}/{}", self.registry, name, version);
        let resp = CLIENT.get(&url).send().with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("registry returned {} for {}", resp.status(), spec);
        }
        let meta: ResolvedManifest = resp.json()?;
        MANIFEST_CACHE
            .lock()
            .unwrap()
            .insert(spec.to_string(), meta.clone());
        Ok(meta)
    }

    fn tarball_stream(&self, spec: &str, opts: &FetchOptions) -> Result<Box<dyn Read + Send>> {
        let url = match &opts.resolved {
            Some(url) if !url.is_empty() => url.clone(),
            _ => self.manifest(spec)?.resolved_url().to_string(),
        };
        anyhow::ensure!(!url.is_empty(), "no tarball url known for {spec}");
        let resp = CLIENT.get(&url).send().with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("tarball fetch {} status {}", url, resp.status());
        }
        Ok(Box::new(resp))
    }
}
