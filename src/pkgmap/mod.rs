use crate::unpack::{FileNode, PackageMeta};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

pub const PACKAGE_MAP_FILE: &str = ".package-map.json";
pub const PATH_PREFIX: &str = "/node_modules";

/// The metadata document produced for one installed package: the unpacked
/// manifest plus the identity the orchestrator adds afterwards. This is
/// what gets persisted under the package's store key and merged into the
/// map at its leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDocument {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub integrity: String,
    #[serde(default)]
    pub resolved: String,
    pub main: String,
    #[serde(rename = "hasInstallScripts")]
    pub has_install_scripts: bool,
    #[serde(rename = "hasNativeBuild")]
    pub has_native_build: bool,
    pub files: FileNode,
}

impl PackageDocument {
    pub fn from_meta(
        meta: PackageMeta,
        name: &str,
        version: &str,
        integrity: String,
        resolved: String,
    ) -> Self {
        PackageDocument {
            name: name.to_string(),
            version: version.to_string(),
            integrity,
            resolved,
            main: meta.main,
            has_install_scripts: meta.has_install_scripts,
            has_native_build: meta.has_native_build,
            files: meta.files,
        }
    }
}

/// A leaf of the package map. Fields start empty (the fold materialises
/// leaves before their metadata may arrive) and merging is a shallow
/// overwrite of the known metadata keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(rename = "hasInstallScripts", skip_serializing_if = "Option::is_none")]
    pub has_install_scripts: Option<bool>,
    #[serde(rename = "hasNativeBuild", skip_serializing_if = "Option::is_none")]
    pub has_native_build: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<FileNode>,
}

impl PackageEntry {
    pub fn merge_document(&mut self, doc: &PackageDocument) {
        self.name = Some(doc.name.clone());
        self.version = Some(doc.version.clone());
        self.integrity = Some(doc.integrity.clone());
        self.resolved = Some(doc.resolved.clone());
        self.main = Some(doc.main.clone());
        self.has_install_scripts = Some(doc.has_install_scripts);
        self.has_native_build = Some(doc.has_native_build);
        self.files = Some(doc.files.clone());
    }
}

/// Nested scope holding the packages installed under one dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub path_prefix: String,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scopes: BTreeMap<String, Scope>,
}

impl Scope {
    fn new() -> Self {
        Scope {
            path_prefix: PATH_PREFIX.to_string(),
            packages: BTreeMap::new(),
            scopes: BTreeMap::new(),
        }
    }
}

/// The project-level map: every installed package's metadata, addressed by
/// install position, plus the digest of the lockfile it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMap {
    pub lockfile_integrity: String,
    pub path_prefix: String,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scopes: BTreeMap<String, Scope>,
}

impl PackageMap {
    pub fn new(lockfile_integrity: String) -> Self {
        PackageMap {
            lockfile_integrity,
            path_prefix: PATH_PREFIX.to_string(),
            packages: BTreeMap::new(),
            scopes: BTreeMap::new(),
        }
    }

    /// Fold one package's metadata in at its address. Ancestor segments
    /// become scope hops, the final segment is the package leaf.
    pub fn insert(&mut self, address: &str, doc: &PackageDocument) {
        let segments: Vec<&str> = address.split(':').collect();
        let (leaf, ancestors) = segments.split_last().expect("non-empty address");
        let mut packages = &mut self.packages;
        let mut scopes = &mut self.scopes;
        for ancestor in ancestors {
            let scope = scopes
                .entry((*ancestor).to_string())
                .or_insert_with(Scope::new);
            let Scope { packages: p, scopes: s, .. } = scope;
            packages = p;
            scopes = s;
        }
        packages
            .entry((*leaf).to_string())
            .or_default()
            .merge_document(doc);
    }

    /// Number of package leaves, across all scopes.
    pub fn package_count(&self) -> usize {
        fn count(packages: &BTreeMap<String, PackageEntry>, scopes: &BTreeMap<String, Scope>) -> usize {
            packages.len()
                + scopes
                    .values()
                    .map(|s| count(&s.packages, &s.scopes))
                    .sum::<usize>()
        }
        count(&self.packages, &self.scopes)
    }

    pub fn to_json_string(&self) -> Result<String> {
        let mut out = serde_json::to_string_pretty(self).context("serialize package map")?;
        out.push('\n');
        Ok(out)
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(PACKAGE_MAP_FILE);
        fs::write(&path, self.to_json_string()?)
            .with_context(|| format!("write {}", path.display()))
    }

    /// Read a persisted map; a missing file is `None`, a corrupt one is an
    /// error for the caller to discard.
    pub fn read(dir: &Path) -> Result<Option<PackageMap>> {
        let path = dir.join(PACKAGE_MAP_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        let map = serde_json::from_str(text).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(map))
    }
}
