use crate::digest::{Algorithm, Digest};
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;

pub const PACKAGE_JSON: &str = "package.json";
pub const PACKAGE_LOCK: &str = "package-lock.json";
pub const SHRINKWRAP: &str = "npm-shrinkwrap.json";

/// Read a JSON file, stripping a leading UTF-8 BOM. With `ignore_missing`
/// a missing file is `None` instead of an error.
pub fn read_json(path: &Path, ignore_missing: bool) -> Result<Option<Value>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound && ignore_missing => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    let value = serde_json::from_str(text).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

/// Serialize with object keys sorted at every level, so the digest of a
/// lockfile does not depend on the order npm happened to write it in.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sort_keys(value)).expect("serialize canonical json")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

pub fn lockfile_digest(lock: &Value) -> Digest {
    Digest::compute(Algorithm::Sha256, canonical_json(lock).as_bytes())
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub status: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Checks a lockfile against the project manifest before it is trusted.
pub trait LockfileVerifier: Send + Sync {
    fn verify(&self, manifest: &Value, lock: &Value) -> VerifyReport;
}

/// Declared-dependency coverage check: every dependency named in
/// `package.json` must have a lockfile entry; lockfile entries nobody
/// declares are only worth a warning.
pub struct BasicVerifier;

impl LockfileVerifier for BasicVerifier {
    fn verify(&self, manifest: &Value, lock: &Value) -> VerifyReport {
        let mut report = VerifyReport { status: true, ..Default::default() };
        let locked = lock
            .get("dependencies")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        for section in ["dependencies", "devDependencies", "optionalDependencies"] {
            if let Some(declared) = manifest.get(section).and_then(|v| v.as_object()) {
                for name in declared.keys() {
                    if !locked.contains_key(name) {
                        report
                            .errors
                            .push(format!("{name} is declared in {section} but missing from the lockfile"));
                        report.status = false;
                    }
                }
            }
        }
        let declared_anywhere = |name: &str| {
            ["dependencies", "devDependencies", "optionalDependencies"]
                .iter()
                .any(|section| {
                    manifest
                        .get(section)
                        .and_then(|v| v.as_object())
                        .map(|m| m.contains_key(name))
                        .unwrap_or(false)
                })
        };
        for name in locked.keys() {
            if !declared_anywhere(name) {
                report
                    .warnings
                    .push(format!("{name} is locked but not declared in package.json"));
            }
        }
        report
    }
}

/// Writes a fresh `package-lock.json` for the project at `prefix`.
pub trait LockGenerator: Send + Sync {
    fn generate(&self, prefix: &Path) -> Result<()>;
}

/// Shells out to npm, which owns lockfile generation.
pub struct NpmLockGenerator;

impl LockGenerator for NpmLockGenerator {
    fn generate(&self, prefix: &Path) -> Result<()> {
        let status = Command::new("npm")
            .args(["install", "--package-lock-only", "--ignore-scripts"])
            .current_dir(prefix)
            .status()
            .context("spawn npm to generate a lockfile")?;
        anyhow::ensure!(status.success(), "npm exited with {status} while generating the lockfile");
        Ok(())
    }
}
