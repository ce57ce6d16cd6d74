use crate::digest::{Algorithm, Digest};
use crate::store::Store;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read};
use tar::{Archive, EntryType};

pub const DEFAULT_MAIN: &str = "index.js";

/// Nested path-to-digest tree for one package. Leaves are regular files;
/// directories exist only as intermediate mappings. Links, symlinks and
/// empty directories are never recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileNode {
    File(Digest),
    Dir(BTreeMap<String, FileNode>),
}

impl Default for FileNode {
    fn default() -> Self {
        FileNode::Dir(BTreeMap::new())
    }
}

impl FileNode {
    /// Fold a sanitised entry path into the tree. Segments are split on
    /// both separator kinds; `.` and empty segments are ignored.
    pub fn insert_path(&mut self, path: &str, digest: Digest) {
        let segments: Vec<&str> = path
            .split(['/', '\\'])
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        if !segments.is_empty() {
            self.insert_segments(&segments, digest);
        }
    }

    fn insert_segments(&mut self, segments: &[&str], digest: Digest) {
        if !matches!(self, FileNode::Dir(_)) {
            *self = FileNode::default();
        }
        let FileNode::Dir(map) = self else { unreachable!() };
        match segments {
            [] => {}
            [leaf] => {
                map.insert((*leaf).to_string(), FileNode::File(digest));
            }
            [dir, rest @ ..] => {
                map.entry((*dir).to_string())
                    .or_insert_with(FileNode::default)
                    .insert_segments(rest, digest);
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileNode> {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match node {
                FileNode::Dir(map) => node = map.get(segment)?,
                FileNode::File(_) => return None,
            }
        }
        Some(node)
    }

    pub fn file_digest(&self, path: &str) -> Option<&Digest> {
        match self.get(path)? {
            FileNode::File(d) => Some(d),
            FileNode::Dir(_) => None,
        }
    }

    pub fn file_count(&self) -> usize {
        match self {
            FileNode::File(_) => 1,
            FileNode::Dir(map) => map.values().map(FileNode::file_count).sum(),
        }
    }
}

/// Package-level facts extracted while unpacking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMeta {
    pub main: String,
    #[serde(rename = "hasInstallScripts")]
    pub has_install_scripts: bool,
    #[serde(rename = "hasNativeBuild")]
    pub has_native_build: bool,
    pub files: FileNode,
}

impl Default for PackageMeta {
    fn default() -> Self {
        PackageMeta {
            main: DEFAULT_MAIN.to_string(),
            has_install_scripts: false,
            has_native_build: false,
            files: FileNode::default(),
        }
    }
}

/// Terminal stream signals, recorded in emission order. A well-behaved
/// unpack produces exactly one `Metadata` followed by the four
/// end-of-stream signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Metadata,
    Prefinish,
    Finish,
    End,
    Close,
}

pub struct UnpackOptions<'o> {
    /// Leading path segments to drop from every entry.
    pub strip: usize,
    pub algorithms: Vec<Algorithm>,
    pub warn: Option<&'o (dyn Fn(&str) + Send + Sync)>,
    /// Per-file body rewrite, applied before hashing. A transform failure
    /// drops the entry with a warning.
    pub transform: Option<&'o (dyn Fn(&str, Vec<u8>) -> Result<Vec<u8>> + Send + Sync)>,
}

impl Default for UnpackOptions<'_> {
    fn default() -> Self {
        UnpackOptions {
            strip: 0,
            algorithms: vec![Algorithm::Sha256],
            warn: None,
            transform: None,
        }
    }
}

pub struct UnpackOutcome {
    pub meta: PackageMeta,
    pub events: Vec<StreamEvent>,
}

/// Streams one gzip-compressed tar archive into the content store and
/// builds the package's file manifest. Bad entries are warnings, not
/// failures; only a broken archive stream aborts the unpack.
pub struct Unpacker<'s, 'o> {
    store: &'s Store,
    opts: UnpackOptions<'o>,
    meta: PackageMeta,
    pending_files: usize,
    archive_ended: bool,
    events: Vec<StreamEvent>,
}

impl<'s, 'o> Unpacker<'s, 'o> {
    pub fn new(store: &'s Store, opts: UnpackOptions<'o>) -> Self {
        Unpacker {
            store,
            opts,
            meta: PackageMeta::default(),
            pending_files: 0,
            archive_ended: false,
            events: Vec::new(),
        }
    }

    pub fn unpack<R: Read>(mut self, reader: R) -> Result<UnpackOutcome> {
        let mut archive = Archive::new(GzDecoder::new(reader));
        for entry in archive.entries().context("read tar archive")? {
            let mut entry = entry.context("read tar entry")?;
            let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            match entry.header().entry_type() {
                EntryType::Regular | EntryType::Continuous => {
                    let Some(path) = self.clean_path(&raw) else { continue };
                    self.pending_files += 1;
                    if let Err(e) = self.consume_file(&path, &mut entry) {
                        self.warn(&format!("failed to unpack {path}: {e:#}"));
                    }
                    self.pending_files -= 1;
                }
                EntryType::Directory | EntryType::Link | EntryType::Symlink => {
                    // manifests record only regular files
                }
                EntryType::Char | EntryType::Block | EntryType::Fifo => {
                    self.warn(&format!("unsupported entry type: {raw}"));
                    let _ = io::copy(&mut entry, &mut io::sink());
                }
                _ => {
                    // pax headers, gnu extensions and other metadata entries
                }
            }
        }
        self.archive_ended = true;
        self.maybe_close();
        Ok(UnpackOutcome { meta: self.meta, events: self.events })
    }

    /// Apply strip count, traversal rejection and root stripping. `None`
    /// means the entry is skipped (with a warning where the rules say so).
    fn clean_path(&self, raw: &str) -> Option<String> {
        let segments: Vec<&str> = raw.split(['/', '\\']).collect();
        if self.opts.strip > 0 && segments.len() <= self.opts.strip {
            return None;
        }
        let segments = &segments[self.opts.strip..];
        if segments.iter().any(|s| *s == "..") {
            self.warn(&format!("path contains '..': {raw}"));
            return None;
        }
        let mut path = segments.join("/");
        if let Some(rest) = strip_one_root(&path) {
            self.warn(&format!("stripping absolute path prefix from {raw}"));
            if strip_one_root(&rest).is_some() {
                self.warn(&format!("entry path is still absolute: {rest}"));
            }
            path = rest;
        }
        if path.is_empty() || path == "." {
            return None;
        }
        Some(path)
    }

    fn consume_file<R: Read>(&mut self, path: &str, entry: &mut R) -> Result<()> {
        let mut body = Vec::new();
        entry.read_to_end(&mut body).context("read entry body")?;
        if let Some(transform) = self.opts.transform {
            body = transform(path, body).context("transform entry body")?;
        }
        if path == "package.json" {
            self.apply_package_json(&body);
        }
        if path.ends_with(".gyp") {
            self.meta.has_install_scripts = true;
            self.meta.has_native_build = true;
        }
        let digest = self.store.put(&body, &self.opts.algorithms)?;
        self.meta.files.insert_path(path, digest.clone());
        self.store.memo_by_digest(&digest, &body);
        Ok(())
    }

    fn apply_package_json(&mut self, body: &[u8]) {
        let text = String::from_utf8_lossy(body);
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(pkg) => {
                if let Some(main) = pkg.get("main").and_then(|v| v.as_str()) {
                    self.meta.main = main.to_string();
                }
                if let Some(scripts) = pkg.get("scripts").and_then(|v| v.as_object()) {
                    if ["install", "preinstall", "postinstall"]
                        .iter()
                        .any(|k| scripts.contains_key(*k))
                    {
                        self.meta.has_install_scripts = true;
                    }
                }
            }
            Err(e) => self.warn(&format!("failed to parse package.json: {e}")),
        }
    }

    /// The archive-end signal only commits to closure; the event sequence
    /// fires once no file work is outstanding.
    fn maybe_close(&mut self) {
        if self.archive_ended && self.pending_files == 0 && self.events.is_empty() {
            self.events.extend([
                StreamEvent::Metadata,
                StreamEvent::Prefinish,
                StreamEvent::Finish,
                StreamEvent::End,
                StreamEvent::Close,
            ]);
        }
    }

    fn warn(&self, msg: &str) {
        if let Some(warn) = self.opts.warn {
            warn(msg);
        }
    }
}

/// Strip a single absolute-path marker (POSIX separator, Windows drive
/// letter or leading backslash). Returns `None` when the path is not
/// absolute.
fn strip_one_root(path: &str) -> Option<String> {
    if let Some(rest) = path.strip_prefix('/') {
        return Some(rest.to_string());
    }
    if let Some(rest) = path.strip_prefix('\\') {
        return Some(rest.to_string());
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let rest = &path[2..];
        let rest = rest
            .strip_prefix('/')
            .or_else(|| rest.strip_prefix('\\'))
            .unwrap_or(rest);
        return Some(rest.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use tar::{Builder, Header};

    fn tgz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let gz = GzEncoder::new(&mut buf, Compression::default());
            let mut tar = Builder::new(gz);
            for (path, contents) in entries {
                let mut header = Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                tar.append_data(&mut header, path, *contents).unwrap();
            }
            tar.finish().unwrap();
        }
        buf
    }

    fn tgz_with_type(entries: &[(&str, EntryType, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let gz = GzEncoder::new(&mut buf, Compression::default());
            let mut tar = Builder::new(gz);
            for (path, etype, contents) in entries {
                let mut header = Header::new_gnu();
                header.set_entry_type(*etype);
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                tar.append_data(&mut header, path, *contents).unwrap();
            }
            tar.finish().unwrap();
        }
        buf
    }

    // The tar Builder refuses `..` and other hostile names, so malformed
    // archives are written block by block.
    fn raw_block(name: &str, size: u64, typeflag: u8) -> [u8; 512] {
        fn octal(buf: &mut [u8], value: u64) {
            for b in buf.iter_mut() {
                *b = b'0';
            }
            let s = format!("{value:o}");
            let end = buf.len() - 1;
            let start = end - s.len();
            buf[start..start + s.len()].copy_from_slice(s.as_bytes());
            buf[end] = 0;
        }
        let mut h = [0u8; 512];
        assert!(name.len() <= 100);
        h[..name.len()].copy_from_slice(name.as_bytes());
        octal(&mut h[100..108], 0o644);
        octal(&mut h[108..116], 0);
        octal(&mut h[116..124], 0);
        octal(&mut h[124..136], size);
        octal(&mut h[136..148], 0);
        for b in &mut h[148..156] {
            *b = b' ';
        }
        h[156] = typeflag;
        h[257..263].copy_from_slice(b"ustar\0");
        h[263..265].copy_from_slice(b"00");
        let checksum: u32 = h.iter().map(|b| *b as u32).sum();
        h[148..156].copy_from_slice(format!("{checksum:06o}\0 ").as_bytes());
        h
    }

    fn raw_tgz(entries: &[(&str, u8, &[u8])]) -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        for (name, typeflag, data) in entries {
            tar_bytes.extend_from_slice(&raw_block(name, data.len() as u64, *typeflag));
            tar_bytes.extend_from_slice(data);
            let pad = (512 - (data.len() % 512)) % 512;
            tar_bytes.extend(std::iter::repeat(0u8).take(pad));
        }
        tar_bytes.extend(std::iter::repeat(0u8).take(1024));
        let mut buf = Vec::new();
        {
            let mut gz = GzEncoder::new(&mut buf, Compression::default());
            std::io::Write::write_all(&mut gz, &tar_bytes).unwrap();
            gz.finish().unwrap();
        }
        buf
    }

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn strip1() -> UnpackOptions<'static> {
        UnpackOptions { strip: 1, ..Default::default() }
    }

    #[test]
    fn simple_package_manifest_and_metadata() {
        let (_dir, store) = open_store();
        let data = tgz(&[
            ("package/index.js", b"hello"),
            (
                "package/package.json",
                br#"{"name":"x","version":"1.0.0","main":"index.js"}"#,
            ),
        ]);
        let outcome = Unpacker::new(&store, strip1())
            .unpack(Cursor::new(data))
            .unwrap();
        let meta = outcome.meta;
        assert_eq!(meta.main, "index.js");
        assert!(!meta.has_install_scripts);
        assert!(!meta.has_native_build);
        assert_eq!(meta.files.file_count(), 2);
        let expected = Digest::compute(Algorithm::Sha256, b"hello");
        assert_eq!(meta.files.file_digest("index.js"), Some(&expected));
        assert!(meta.files.file_digest("package.json").is_some());
        assert!(store.contains(&expected));
        assert!(store.memo(&expected).is_some());
    }

    #[test]
    fn events_fire_once_in_order() {
        let (_dir, store) = open_store();
        let data = tgz(&[("package/a.js", b"a")]);
        let outcome = Unpacker::new(&store, strip1())
            .unpack(Cursor::new(data))
            .unwrap();
        assert_eq!(
            outcome.events,
            vec![
                StreamEvent::Metadata,
                StreamEvent::Prefinish,
                StreamEvent::Finish,
                StreamEvent::End,
                StreamEvent::Close,
            ]
        );
    }

    #[test]
    fn strip_skips_shallow_entries() {
        let (_dir, store) = open_store();
        let data = tgz(&[("toplevel.txt", b"skipped"), ("package/kept.txt", b"kept")]);
        let outcome = Unpacker::new(&store, strip1())
            .unpack(Cursor::new(data))
            .unwrap();
        assert_eq!(outcome.meta.files.file_count(), 1);
        assert!(outcome.meta.files.file_digest("kept.txt").is_some());
    }

    #[test]
    fn traversal_entries_are_rejected_without_aborting() {
        let (_dir, store) = open_store();
        let warnings = Mutex::new(Vec::new());
        let warn = |msg: &str| warnings.lock().push(msg.to_string());
        let data = raw_tgz(&[
            ("package/../../etc/passwd", b'0', b"evil"),
            ("package/ok.txt", b'0', b"fine"),
        ]);
        let outcome = Unpacker::new(
            &store,
            UnpackOptions { strip: 1, warn: Some(&warn), ..Default::default() },
        )
        .unpack(Cursor::new(data))
        .unwrap();
        assert_eq!(outcome.meta.files.file_count(), 1);
        assert!(outcome.meta.files.file_digest("ok.txt").is_some());
        assert!(warnings
            .lock()
            .iter()
            .any(|w| w.contains("path contains '..'")));
        assert_eq!(outcome.events.len(), 5);
    }

    #[test]
    fn absolute_paths_are_rerooted_with_warning() {
        let (_dir, store) = open_store();
        let warnings = Mutex::new(Vec::new());
        let warn = |msg: &str| warnings.lock().push(msg.to_string());
        let data = raw_tgz(&[
            ("package//etc/hosts", b'0', b"entries"),
            (r"package/C:\temp\notes.txt", b'0', b"drive"),
        ]);
        let outcome = Unpacker::new(
            &store,
            UnpackOptions { strip: 1, warn: Some(&warn), ..Default::default() },
        )
        .unpack(Cursor::new(data))
        .unwrap();
        assert!(outcome.meta.files.file_digest("etc/hosts").is_some());
        assert!(outcome.meta.files.file_digest("temp/notes.txt").is_some());
        assert!(warnings
            .lock()
            .iter()
            .any(|w| w.contains("absolute path prefix")));
    }

    #[test]
    fn links_and_dirs_skipped_devices_warned() {
        let (_dir, store) = open_store();
        let warnings = Mutex::new(Vec::new());
        let warn = |msg: &str| warnings.lock().push(msg.to_string());
        let data = tgz_with_type(&[
            ("package/dir/", EntryType::Directory, b""),
            ("package/dev-null", EntryType::Char, b""),
            ("package/file.txt", EntryType::Regular, b"body"),
        ]);
        let outcome = Unpacker::new(
            &store,
            UnpackOptions { strip: 1, warn: Some(&warn), ..Default::default() },
        )
        .unpack(Cursor::new(data))
        .unwrap();
        assert_eq!(outcome.meta.files.file_count(), 1);
        assert!(outcome.meta.files.file_digest("file.txt").is_some());
        assert!(warnings
            .lock()
            .iter()
            .any(|w| w.contains("unsupported entry type")));
        assert_eq!(outcome.events.len(), 5);
    }

    #[test]
    fn gyp_file_marks_native_build() {
        let (_dir, store) = open_store();
        let data = tgz(&[("package/binding.gyp", b"{}")]);
        let outcome = Unpacker::new(&store, strip1())
            .unpack(Cursor::new(data))
            .unwrap();
        assert!(outcome.meta.has_install_scripts);
        assert!(outcome.meta.has_native_build);
    }

    #[test]
    fn install_scripts_detected_from_package_json() {
        let (_dir, store) = open_store();
        let data = tgz(&[(
            "package/package.json",
            br#"{"name":"s","version":"1.0.0","scripts":{"postinstall":"node setup.js"}}"#,
        )]);
        let outcome = Unpacker::new(&store, strip1())
            .unpack(Cursor::new(data))
            .unwrap();
        assert!(outcome.meta.has_install_scripts);
        assert!(!outcome.meta.has_native_build);
        // no main declared: the default stands
        assert_eq!(outcome.meta.main, DEFAULT_MAIN);
    }

    #[test]
    fn bom_in_package_json_is_tolerated() {
        let (_dir, store) = open_store();
        let mut body = "\u{feff}".to_string().into_bytes();
        body.extend_from_slice(br#"{"name":"b","version":"1.0.0","main":"lib/b.js"}"#);
        let data = tgz(&[("package/package.json", body.as_slice())]);
        let outcome = Unpacker::new(&store, strip1())
            .unpack(Cursor::new(data))
            .unwrap();
        assert_eq!(outcome.meta.main, "lib/b.js");
    }

    #[test]
    fn transform_rewrites_bodies_and_failures_drop_the_entry() {
        let (_dir, store) = open_store();
        let warnings = Mutex::new(Vec::new());
        let warn = |msg: &str| warnings.lock().push(msg.to_string());
        let transform = |path: &str, body: Vec<u8>| -> Result<Vec<u8>> {
            if path == "bad.txt" {
                anyhow::bail!("refused");
            }
            Ok(body.to_ascii_uppercase())
        };
        let data = tgz(&[("package/good.txt", b"abc"), ("package/bad.txt", b"xyz")]);
        let outcome = Unpacker::new(
            &store,
            UnpackOptions {
                strip: 1,
                warn: Some(&warn),
                transform: Some(&transform),
                ..Default::default()
            },
        )
        .unpack(Cursor::new(data))
        .unwrap();
        let expected = Digest::compute(Algorithm::Sha256, b"ABC");
        assert_eq!(outcome.meta.files.file_digest("good.txt"), Some(&expected));
        assert!(outcome.meta.files.file_digest("bad.txt").is_none());
        assert!(warnings.lock().iter().any(|w| w.contains("bad.txt")));
        assert_eq!(outcome.events.len(), 5);
    }

    #[test]
    fn nested_paths_fold_into_directories() {
        let (_dir, store) = open_store();
        let data = tgz(&[
            ("package/lib/deep/mod.js", b"m"),
            ("package/lib/index.js", b"i"),
        ]);
        let outcome = Unpacker::new(&store, strip1())
            .unpack(Cursor::new(data))
            .unwrap();
        assert!(outcome.meta.files.file_digest("lib/deep/mod.js").is_some());
        assert!(outcome.meta.files.file_digest("lib/index.js").is_some());
        assert!(matches!(outcome.meta.files.get("lib"), Some(FileNode::Dir(_))));
    }

    #[test]
    fn truncated_archive_is_fatal() {
        let (_dir, store) = open_store();
        let mut data = tgz(&[("package/a.js", b"a")]);
        data.truncate(10);
        assert!(Unpacker::new(&store, strip1())
            .unpack(Cursor::new(data))
            .is_err());
    }

    #[test]
    fn manifest_serializes_as_nested_digest_map() {
        let mut files = FileNode::default();
        let d = Digest::compute(Algorithm::Sha256, b"x");
        files.insert_path("lib/index.js", d.clone());
        files.insert_path("./package.json", d.clone());
        let json = serde_json::to_value(&files).unwrap();
        assert_eq!(json["package.json"], serde_json::json!(d.to_string()));
        assert_eq!(json["lib"]["index.js"], serde_json::json!(d.to_string()));
        let back: FileNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, files);
    }
}
