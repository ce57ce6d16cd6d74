use crate::digest::{Algorithm, Digest};
use crate::fetch::{FetchOptions, PackageFetcher, ResolvedManifest};
use crate::lockfile::LockGenerator;
use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tar::{Builder, Header};
use tempfile::TempDir;

/// Temp project plus store root for one scenario.
pub struct Sandbox {
    temp: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Sandbox { temp: tempfile::tempdir().expect("create sandbox tempdir") }
    }

    pub fn project(&self) -> PathBuf {
        let dir = self.temp.path().join("project");
        fs::create_dir_all(&dir).expect("create project dir");
        dir
    }

    pub fn cache(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    pub fn write_json(&self, rel: &str, value: &Value) {
        let path = self.project().join(rel);
        let data = serde_json::to_string_pretty(value).expect("serialize fixture json");
        fs::write(path, data).expect("write fixture json");
    }
}

/// Build an npm-shaped tarball: every file sits under a leading `package/`
/// directory, gzip-compressed.
pub fn package_tgz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let gz = GzEncoder::new(&mut buf, Compression::default());
        let mut tar = Builder::new(gz);
        for (rel, contents) in files {
            let mut header = Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, format!("package/{rel}"), contents.as_bytes())
                .expect("append fixture entry");
        }
        tar.finish().expect("finish fixture tarball");
    }
    buf
}

pub fn tarball_integrity(bytes: &[u8]) -> String {
    Digest::compute(Algorithm::Sha256, bytes).to_string()
}

/// In-memory fetcher: tarballs keyed by `name@version`. Failures and fetch
/// counts are observable from outside the installer through shared handles.
pub struct StubFetcher {
    tarballs: HashMap<String, Vec<u8>>,
    manifests: HashMap<String, ResolvedManifest>,
    fail: HashSet<String>,
    fetches: Arc<AtomicUsize>,
}

impl StubFetcher {
    pub fn new() -> Self {
        StubFetcher {
            tarballs: HashMap::new(),
            manifests: HashMap::new(),
            fail: HashSet::new(),
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn tarball(mut self, spec: &str, bytes: Vec<u8>) -> Self {
        self.tarballs.insert(spec.to_string(), bytes);
        self
    }

    pub fn manifest_doc(mut self, spec: &str, resolved: &str, integrity: &str) -> Self {
        self.manifests.insert(
            spec.to_string(),
            ResolvedManifest {
                resolved: resolved.to_string(),
                integrity: integrity.to_string(),
                ..Default::default()
            },
        );
        self
    }

    pub fn failing(mut self, spec: &str) -> Self {
        self.fail.insert(spec.to_string());
        self
    }

    pub fn fetch_counter(&self) -> Arc<AtomicUsize> {
        self.fetches.clone()
    }
}

impl PackageFetcher for StubFetcher {
    fn manifest(&self, spec: &str) -> Result<ResolvedManifest> {
        Ok(self.manifests.get(spec).cloned().unwrap_or_default())
    }

    fn tarball_stream(&self, spec: &str, _opts: &FetchOptions) -> Result<Box<dyn Read + Send>> {
        if self.fail.contains(spec) {
            anyhow::bail!("fetch refused for {spec}");
        }
        let bytes = self
            .tarballs
            .get(spec)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no tarball registered for {spec}"))?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Writes a canned lockfile instead of shelling out to npm.
pub struct StubGenerator {
    pub lock: Value,
    pub calls: Arc<AtomicUsize>,
}

impl StubGenerator {
    pub fn new(lock: Value) -> Self {
        StubGenerator { lock, calls: Arc::new(AtomicUsize::new(0)) }
    }
}

impl LockGenerator for StubGenerator {
    fn generate(&self, prefix: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let data = serde_json::to_string_pretty(&self.lock)?;
        fs::write(prefix.join("package-lock.json"), data)?;
        Ok(())
    }
}
