use crate::digest::{Digest, DigestError};
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use std::io::{self, Read};
use std::sync::Arc;

/// Pass-through reader that folds every byte into a rolling sha256. Sits
/// between the fetcher and the unpacker when the ambient integrity of a
/// tarball is unknown, or to check a known digest against what actually
/// came over the wire.
pub struct IntegrityGate<R> {
    inner: R,
    hasher: Arc<Mutex<Sha256>>,
}

/// Handle onto a gate's rolling digest, usable after the gate itself has
/// been consumed by the unpacker.
#[derive(Clone)]
pub struct DigestHandle {
    hasher: Arc<Mutex<Sha256>>,
}

impl<R: Read> IntegrityGate<R> {
    pub fn new(inner: R) -> (Self, DigestHandle) {
        let hasher = Arc::new(Mutex::new(Sha256::new()));
        let handle = DigestHandle { hasher: hasher.clone() };
        (IntegrityGate { inner, hasher }, handle)
    }
}

impl<R: Read> Read for IntegrityGate<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.lock().update(&buf[..n]);
        }
        Ok(n)
    }
}

impl DigestHandle {
    /// Digest of everything read through the gate so far.
    pub fn digest(&self) -> Digest {
        Digest::from_sha256(self.hasher.lock().clone())
    }

    pub fn verify(&self, expected: &Digest) -> Result<(), DigestError> {
        let actual = self.digest();
        if actual == *expected {
            Ok(())
        } else {
            Err(DigestError::Mismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}
