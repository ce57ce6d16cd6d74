use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// The only hash the store speaks. Integrity strings naming any other
/// algorithm are rejected at the parse boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("unsupported digest algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("malformed digest string '{0}'")]
    Malformed(String),
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// A named hash rendered canonically as `<alg>-<base64>`. Equality is
/// byte-exact on the algorithm and raw digest bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    bytes: Vec<u8>,
}

impl Digest {
    pub fn compute(algorithm: Algorithm, data: &[u8]) -> Self {
        match algorithm {
            Algorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                Self::from_sha256(hasher)
            }
        }
    }

    pub(crate) fn from_sha256(hasher: Sha256) -> Self {
        Digest { algorithm: Algorithm::Sha256, bytes: hasher.finalize().to_vec() }
    }

    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let (alg, b64) = s
            .split_once('-')
            .ok_or_else(|| DigestError::Malformed(s.to_string()))?;
        let algorithm = alg.parse::<Algorithm>()?;
        let bytes = STANDARD
            .decode(b64)
            .map_err(|_| DigestError::Malformed(s.to_string()))?;
        Ok(Digest { algorithm, bytes })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Hex form, used for on-disk sharding.
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn verify(&self, data: &[u8]) -> Result<(), DigestError> {
        let actual = Digest::compute(self.algorithm, data);
        if actual == *self {
            Ok(())
        } else {
            Err(DigestError::Mismatch { expected: self.to_string(), actual: actual.to_string() })
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algorithm.as_str(), STANDARD.encode(&self.bytes))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}
