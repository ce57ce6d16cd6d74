use crate::colors::*;
use crate::config::InstallOptions;
use crate::digest::{Algorithm, Digest};
use crate::fetch::{FetchOptions, PackageFetcher};
use crate::hooks::{BinLinker, NoopBinLinker, NoopScriptRunner, ScriptRunner};
use crate::integrity::IntegrityGate;
use crate::lockfile::{
    lockfile_digest, read_json, BasicVerifier, LockGenerator, LockfileVerifier, NpmLockGenerator,
    PACKAGE_JSON, PACKAGE_LOCK, SHRINKWRAP,
};
use crate::pkgmap::{PackageDocument, PackageMap};
use crate::reclaim::reclaim;
use crate::store::{KeyedOptions, Store};
use crate::tree::{self, visit_concurrent, DepNode};
use crate::unpack::{Unpacker, UnpackOptions};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

type Sink = Box<dyn Fn(&str) + Send + Sync>;

/// Injected info/warn sinks. There is no process-wide logger; everything
/// the installer says goes through these.
pub struct Logger {
    info_fn: Sink,
    warn_fn: Sink,
}

impl Logger {
    pub fn new(info: Sink, warn: Sink) -> Self {
        Logger { info_fn: info, warn_fn: warn }
    }

    pub fn quiet() -> Self {
        Logger::new(Box::new(|_| {}), Box::new(|_| {}))
    }

    pub fn info(&self, msg: &str) {
        (self.info_fn)(msg);
    }

    pub fn warn(&self, msg: &str) {
        (self.warn_fn)(msg);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new(
            Box::new(|msg| {
                println!("{C_GRAY}[packmap]{C_RESET} {C_DIM}{msg}{C_RESET}");
            }),
            Box::new(|msg| {
                eprintln!("{C_GRAY}[packmap]{C_RESET} {C_YELLOW}warning{C_RESET} {msg}");
            }),
        )
    }
}

#[derive(Debug)]
pub struct InstallReport {
    pub pkg_count: usize,
    pub failed: Vec<String>,
    pub purged: usize,
    pub timings: Vec<(String, Duration)>,
}

/// Stable cache key for one dep identity. Re-runs must land on the same
/// key, so it is derived from name plus resolved url (or integrity when no
/// url is known).
pub fn dep_key(name: &str, resolved: &str, integrity: &str) -> String {
    if !resolved.is_empty() {
        format!("pkg:{name}:{resolved}")
    } else {
        format!("pkg:{name}:{integrity}")
    }
}

/// Drives the install pipeline: prepare, checkLock, fetchTree,
/// buildPackageMap, writePackageMap, buildTree hooks, teardown. Owns the
/// timings, counters and failure bookkeeping.
pub struct Installer {
    opts: InstallOptions,
    store: Store,
    fetcher: Box<dyn PackageFetcher>,
    verifier: Box<dyn LockfileVerifier>,
    generator: Box<dyn LockGenerator>,
    scripts: Box<dyn ScriptRunner>,
    bins: Box<dyn BinLinker>,
    log: Logger,

    prefix: PathBuf,
    manifest: Value,
    lock: Option<Value>,
    lock_integrity: String,
    tree_root: Option<DepNode>,
    existing_map: Option<PackageMap>,
    map: Option<PackageMap>,
    metadata: Mutex<BTreeMap<String, PackageDocument>>,
    pkg_count: AtomicUsize,
    failed_deps: Vec<String>,
    purged: usize,
    timings: Vec<(String, Duration)>,
}

impl Installer {
    pub fn new(opts: InstallOptions, fetcher: Box<dyn PackageFetcher>) -> Result<Self> {
        let store = Store::open(&opts.cache)?;
        Ok(Installer {
            opts,
            store,
            fetcher,
            verifier: Box::new(BasicVerifier),
            generator: Box::new(NpmLockGenerator),
            scripts: Box::new(NoopScriptRunner),
            bins: Box::new(NoopBinLinker),
            log: Logger::default(),
            prefix: PathBuf::new(),
            manifest: Value::Object(Default::default()),
            lock: None,
            lock_integrity: String::new(),
            tree_root: None,
            existing_map: None,
            map: None,
            metadata: Mutex::new(BTreeMap::new()),
            pkg_count: AtomicUsize::new(0),
            failed_deps: Vec::new(),
            purged: 0,
            timings: Vec::new(),
        })
    }

    pub fn with_verifier(mut self, verifier: Box<dyn LockfileVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_generator(mut self, generator: Box<dyn LockGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_scripts(mut self, scripts: Box<dyn ScriptRunner>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_bins(mut self, bins: Box<dyn BinLinker>) -> Self {
        self.bins = bins;
        self
    }

    pub fn with_logger(mut self, log: Logger) -> Self {
        self.log = log;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn run(&mut self) -> Result<InstallReport> {
        let result = self.run_pipeline();
        self.teardown(&result);
        result
    }

    fn run_pipeline(&mut self) -> Result<InstallReport> {
        self.timed("prepare", Self::prepare)?;
        self.timed("checkLock", Self::check_lock)?;
        self.timed("fetchTree", Self::fetch_tree)?;
        self.timed("buildPackageMap", Self::build_package_map)?;
        self.timed("writePackageMap", Self::write_package_map)?;
        self.timed("buildTree", Self::build_tree)?;
        Ok(self.report())
    }

    fn timed(&mut self, name: &str, stage: fn(&mut Self) -> Result<()>) -> Result<()> {
        let start = Instant::now();
        let result = stage(self);
        let elapsed = start.elapsed();
        self.timings.push((name.to_string(), elapsed));
        self.log.info(&format!("{name} in {elapsed:.2?}"));
        result
    }

    fn prepare(&mut self) -> Result<()> {
        self.prefix = self.opts.resolve_prefix()?;
        fs::create_dir_all(&self.prefix)
            .with_context(|| format!("create install prefix {}", self.prefix.display()))?;
        self.manifest = read_json(&self.prefix.join(PACKAGE_JSON), true)?
            .unwrap_or_else(|| Value::Object(Default::default()));
        let shrinkwrap = read_json(&self.prefix.join(SHRINKWRAP), true)?;
        let lock = read_json(&self.prefix.join(PACKAGE_LOCK), true)?;
        // shrinkwrap wins when both exist
        self.lock = shrinkwrap.or(lock);
        self.existing_map = match PackageMap::read(&self.prefix) {
            Ok(map) => map,
            Err(e) => {
                self.log.warn(&format!("discarding unreadable package map: {e:#}"));
                None
            }
        };
        if let Some(lock) = &self.lock {
            self.tree_root = Some(tree::build_tree(&self.manifest, lock)?);
        }
        Ok(())
    }

    fn check_lock(&mut self) -> Result<()> {
        if self.lock.is_none() {
            self.log.info("no lockfile found; generating one");
            self.generator.generate(&self.prefix)?;
            self.lock = read_json(&self.prefix.join(PACKAGE_LOCK), true)?;
        }
        {
            let lock = self
                .lock
                .as_ref()
                .context("lockfile generation produced no package-lock.json")?;
            let report = self.verifier.verify(&self.manifest, lock);
            for warning in &report.warnings {
                self.log.warn(warning);
            }
            for error in &report.errors {
                self.log.warn(error);
            }
            if !report.status {
                self.log.warn("lockfile out of sync with package.json; regenerating");
                self.generator.generate(&self.prefix)?;
                self.lock = read_json(&self.prefix.join(PACKAGE_LOCK), true)?;
            }
        }
        let lock = self
            .lock
            .as_ref()
            .context("lockfile regeneration produced no package-lock.json")?;
        let digest = lockfile_digest(lock).to_string();
        let root = tree::build_tree(&self.manifest, lock)?;
        self.lock_integrity = digest;
        self.tree_root = Some(root);
        if let Some(map) = &self.existing_map {
            if map.lockfile_integrity != self.lock_integrity {
                self.log.info("package map is stale; rebuilding");
                self.existing_map = None;
            }
        }
        Ok(())
    }

    fn fetch_tree(&mut self) -> Result<()> {
        if self.existing_map.is_some() {
            self.log.info("package map is current; skipping fetch");
            return Ok(());
        }
        let root = self.tree_root.take().context("logical tree missing")?;
        let this = &*self;
        let failures = visit_concurrent(&root, this.opts.concurrency.max(1), |node, next| {
            this.visit_node(node, next)
        });
        let mut optional_failed = HashSet::new();
        let mut fatal = None;
        for failure in failures {
            if failure.optional {
                self.log.warn(&format!(
                    "optional dependency {} failed: {:#}",
                    failure.address, failure.error
                ));
                optional_failed.insert(failure.address);
            } else if fatal.is_none() {
                fatal = Some(
                    failure
                        .error
                        .context(format!("install {} failed", failure.address)),
                );
            }
        }
        if let Some(error) = fatal {
            self.tree_root = Some(root);
            return Err(error);
        }
        if !optional_failed.is_empty() {
            let warn = |msg: &str| self.log.warn(msg);
            let purged = reclaim(&root, &optional_failed, &self.prefix, &warn);
            let mut metadata = self.metadata.lock();
            for address in &purged {
                metadata.remove(address);
            }
            drop(metadata);
            let removed = purged.len().min(self.pkg_count.load(Ordering::SeqCst));
            self.pkg_count.fetch_sub(removed, Ordering::SeqCst);
            self.purged = purged.len();
            self.failed_deps = {
                let mut failed: Vec<String> = optional_failed.into_iter().collect();
                failed.sort();
                failed
            };
        }
        self.tree_root = Some(root);
        Ok(())
    }

    fn visit_node(&self, node: &DepNode, next: &dyn Fn()) -> Result<()> {
        if !node.is_root && !self.opts.includes(node) {
            return Ok(());
        }
        next();
        if node.is_root {
            return Ok(());
        }
        // counted up front; the reclaimer subtracts purged subtrees later
        self.pkg_count.fetch_add(1, Ordering::SeqCst);
        if node.bundled {
            // files arrived inside the parent's tarball
            return Ok(());
        }
        if let Some(target) = local_dir_spec(node) {
            return self.link_local(node, &target);
        }
        let doc = self.ensure_package(&node.name, node)?;
        self.metadata.lock().insert(node.address.clone(), doc);
        Ok(())
    }

    pub(crate) fn ensure_package(&self, name: &str, dep: &DepNode) -> Result<PackageDocument> {
        let mut resolved = dep.resolved.clone();
        let mut integrity = dep.integrity.clone();
        let spec = format!("{}@{}", name, dep.version);
        if resolved.is_empty() || integrity.is_empty() {
            let manifest = self
                .fetcher
                .manifest(&spec)
                .with_context(|| format!("resolve manifest for {spec}"))?;
            if resolved.is_empty() {
                resolved = manifest.resolved_url().to_string();
            }
            if integrity.is_empty() {
                integrity = manifest.integrity_string().to_string();
            }
        }
        let key = dep_key(name, &resolved, &integrity);
        if !integrity.is_empty() && !self.opts.restore {
            if let Some(info) = self.store.get_info(&key)? {
                let doc: PackageDocument = serde_json::from_str(&info.metadata)
                    .with_context(|| format!("parse cached metadata for {spec}"))?;
                return Ok(doc);
            }
        }
        let expected = match integrity.is_empty() {
            true => None,
            false => Some(
                Digest::parse(&integrity).with_context(|| format!("integrity of {spec}"))?,
            ),
        };
        let stream = self.fetcher.tarball_stream(
            &spec,
            &FetchOptions {
                integrity: expected.as_ref().map(|d| d.to_string()),
                resolved: Some(resolved.clone()),
            },
        )?;
        let (gate, handle) = IntegrityGate::new(stream);
        let warn = |msg: &str| self.log.warn(&format!("{spec}: {msg}"));
        let outcome = Unpacker::new(
            &self.store,
            UnpackOptions {
                strip: 1,
                algorithms: vec![Algorithm::Sha256],
                warn: Some(&warn),
                transform: None,
            },
        )
        .unpack(gate)
        .with_context(|| format!("unpack {spec}"))?;
        match &expected {
            Some(expected) => handle
                .verify(expected)
                .with_context(|| format!("verify {spec}"))?,
            None => integrity = handle.digest().to_string(),
        }
        let doc = PackageDocument::from_meta(outcome.meta, name, &dep.version, integrity, resolved);
        self.store.put_keyed(
            &key,
            Path::new("."),
            KeyedOptions {
                algorithms: vec![Algorithm::Sha256],
                metadata: serde_json::to_string(&doc)?,
                memoize: true,
            },
        )?;
        Ok(doc)
    }

    fn link_local(&self, node: &DepNode, target: &str) -> Result<()> {
        let source = self.prefix.join(target);
        let link = node.path(&self.prefix);
        if let Ok(meta) = fs::symlink_metadata(&link) {
            if meta.is_dir() {
                fs::remove_dir_all(&link)?;
            } else {
                fs::remove_file(&link)?;
            }
        }
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&source, &link)
            .with_context(|| format!("link {} -> {}", link.display(), source.display()))?;
        #[cfg(windows)]
        std::os::windows::fs::symlink_dir(&source, &link)
            .with_context(|| format!("link {} -> {}", link.display(), source.display()))?;
        Ok(())
    }

    fn build_package_map(&mut self) -> Result<()> {
        if let Some(existing) = self.existing_map.take() {
            self.pkg_count
                .store(existing.package_count(), Ordering::SeqCst);
            self.map = Some(existing);
            return Ok(());
        }
        let mut map = PackageMap::new(self.lock_integrity.clone());
        let metadata = self.metadata.lock();
        if let Some(root) = &self.tree_root {
            root.walk_pre_order(&mut |node| {
                if node.is_root {
                    return;
                }
                if let Some(doc) = metadata.get(&node.address) {
                    map.insert(&node.address, doc);
                }
            });
        }
        drop(metadata);
        self.map = Some(map);
        Ok(())
    }

    fn write_package_map(&mut self) -> Result<()> {
        self.map
            .as_ref()
            .context("package map not built")?
            .write(&self.prefix)
    }

    fn build_tree(&mut self) -> Result<()> {
        let map = self.map.as_ref().context("package map not built")?;
        if !self.opts.ignore_scripts {
            for event in ["preinstall", "install", "postinstall"] {
                self.scripts.run_lifecycle(&self.prefix, event)?;
            }
        }
        self.bins.link_bins(&self.prefix, map)?;
        Ok(())
    }

    fn teardown(&mut self, outcome: &Result<InstallReport>) {
        let total: Duration = self.timings.iter().map(|(_, d)| *d).sum();
        match outcome {
            Ok(report) => {
                let installed = report.pkg_count;
                self.log.info(&format!(
                    "{C_GREEN}installed{C_RESET} {installed} package{} ({} optional failed, {} purged) in {total:.2?}",
                    if installed == 1 { "" } else { "s" },
                    report.failed.len(),
                    report.purged,
                ));
            }
            Err(e) => {
                self.log
                    .warn(&format!("{C_RED}install failed{C_RESET} after {total:.2?}: {e:#}"));
            }
        }
    }

    fn report(&self) -> InstallReport {
        InstallReport {
            pkg_count: self.pkg_count.load(Ordering::SeqCst),
            failed: self.failed_deps.clone(),
            purged: self.purged,
            timings: self.timings.clone(),
        }
    }
}

/// A dep whose spec points at a local directory installs as a symlink,
/// not an unpacked tarball.
fn local_dir_spec(node: &DepNode) -> Option<String> {
    for value in [&node.version, &node.resolved] {
        if let Some(rest) = value.strip_prefix("file:") {
            return Some(rest.to_string());
        }
    }
    None
}
