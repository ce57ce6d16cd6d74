use crate::digest::{Algorithm, Digest};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bodies above this size are not kept in the in-process memo cache.
const MEMO_MAX_BYTES: usize = 512 * 1024;

/// Content-addressed store. Blobs are keyed by their own sha256 digest, so
/// concurrent writers of the same content always converge on the same path
/// and writing twice is a no-op. A side index maps caller-chosen string keys
/// to a stored metadata document plus its digest.
pub struct Store {
    root: PathBuf,
    memo: Mutex<HashMap<Digest, Arc<Vec<u8>>>>,
    keyed_memo: Mutex<HashMap<String, KeyInfo>>,
    tmp_seq: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: String,
    pub source: String,
    pub digest: Digest,
    pub metadata: String,
}

pub struct KeyedOptions {
    pub algorithms: Vec<Algorithm>,
    pub metadata: String,
    pub memoize: bool,
}

#[derive(Debug)]
pub struct StoreStats {
    pub blob_count: u64,
    pub total_size: u64,
    pub key_count: u64,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs").join("sha256"))
            .with_context(|| format!("create store at {}", root.display()))?;
        fs::create_dir_all(root.join("index"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Store {
            root,
            memo: Mutex::new(HashMap::new()),
            keyed_memo: Mutex::new(HashMap::new()),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a sink that hashes while it writes. `commit` finishes the hash
    /// and publishes the blob under its digest.
    pub fn write_stream(&self, algorithms: &[Algorithm]) -> Result<WriteStream<'_>> {
        let _ = algorithms; // only sha256 exists; the list keeps the call shape
        let tmp = self.tmp_path();
        let file = fs::File::create(&tmp)
            .with_context(|| format!("create staging file {}", tmp.display()))?;
        Ok(WriteStream {
            store: self,
            hasher: Sha256::new(),
            tmp,
            file: Some(BufWriter::new(file)),
        })
    }

    pub fn put(&self, bytes: &[u8], algorithms: &[Algorithm]) -> Result<Digest> {
        let mut sink = self.write_stream(algorithms)?;
        sink.write_all(bytes)?;
        sink.commit()
    }

    /// Commit an already-staged artifact under `key` with an attached
    /// metadata document. The metadata itself is the stored payload; blobs
    /// referenced by it are content-addressed and already in place.
    pub fn put_keyed(&self, key: &str, source: &Path, opts: KeyedOptions) -> Result<Digest> {
        let digest = self.put(opts.metadata.as_bytes(), &opts.algorithms)?;
        let info = KeyInfo {
            key: key.to_string(),
            source: source.display().to_string(),
            digest: digest.clone(),
            metadata: opts.metadata,
        };
        let path = self.index_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.tmp_path();
        fs::write(&tmp, serde_json::to_vec(&info)?)?;
        fs::rename(&tmp, &path).with_context(|| format!("publish index entry for {key}"))?;
        if opts.memoize {
            self.keyed_memo.lock().insert(key.to_string(), info);
        }
        Ok(digest)
    }

    pub fn get_info(&self, key: &str) -> Result<Option<KeyInfo>> {
        if let Some(hit) = self.keyed_memo.lock().get(key) {
            return Ok(Some(hit.clone()));
        }
        let path = self.index_path(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read index entry for {key}")),
        };
        let info: KeyInfo = serde_json::from_slice(&data)
            .with_context(|| format!("parse index entry for {key}"))?;
        Ok(Some(info))
    }

    /// Side-effect only: hint the in-process cache that `bytes` are the
    /// content behind `digest`.
    pub fn memo_by_digest(&self, digest: &Digest, bytes: &[u8]) {
        if bytes.len() > MEMO_MAX_BYTES {
            return;
        }
        self.memo
            .lock()
            .insert(digest.clone(), Arc::new(bytes.to_vec()));
    }

    pub fn memo(&self, digest: &Digest) -> Option<Arc<Vec<u8>>> {
        self.memo.lock().get(digest).cloned()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        if let Some(hit) = self.memo(digest) {
            return Ok(hit.as_ref().clone());
        }
        let path = self.blob_path(digest);
        fs::read(&path).with_context(|| format!("read blob {digest}"))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut blob_count = 0u64;
        let mut total_size = 0u64;
        for entry in walkdir::WalkDir::new(self.root.join("blobs"))
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                blob_count += 1;
                total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        let mut key_count = 0u64;
        for entry in walkdir::WalkDir::new(self.root.join("index"))
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                key_count += 1;
            }
        }
        Ok(StoreStats { blob_count, total_size, key_count })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        let (shard, _) = hex.split_at(2.min(hex.len()));
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(shard)
            .join(hex)
    }

    fn index_path(&self, key: &str) -> PathBuf {
        let hex = Digest::compute(Algorithm::Sha256, key.as_bytes()).hex();
        let (shard, _) = hex.split_at(2);
        self.root
            .join("index")
            .join(shard)
            .join(format!("{hex}.json"))
    }

    fn tmp_path(&self) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("{}.{seq}", std::process::id()))
    }
}

/// In-flight blob write. Dropping without `commit` discards the staging file.
pub struct WriteStream<'a> {
    store: &'a Store,
    hasher: Sha256,
    tmp: PathBuf,
    file: Option<BufWriter<fs::File>>,
}

impl WriteStream<'_> {
    pub fn commit(mut self) -> Result<Digest> {
        let mut file = self.file.take().expect("write stream already committed");
        file.flush()?;
        file.get_ref().sync_all()?;
        drop(file);
        let digest = Digest::from_sha256(std::mem::take(&mut self.hasher));
        let target = self.store.blob_path(&digest);
        if target.exists() {
            // Another writer already published the same content.
            let _ = fs::remove_file(&self.tmp);
            return Ok(digest);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&self.tmp, &target) {
            Ok(()) => {}
            Err(_) if target.exists() => {
                let _ = fs::remove_file(&self.tmp);
            }
            Err(e) => {
                let _ = fs::remove_file(&self.tmp);
                return Err(e).with_context(|| format!("publish blob {digest}"));
            }
        }
        Ok(digest)
    }
}

impl io::Write for WriteStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("write stream already committed"))?;
        file.write_all(buf)?;
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for WriteStream<'_> {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}
