//! The `Id` type: a whole-file content hash, base64-encoded for filenames and manifests.
use std::{fmt, str::FromStr};

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RepairError, RepairResult};
use crate::hash::hash;

/// Length in bytes of a SHA-256 digest.
const LEN: usize = 32;

/// The content hash of a remote volume or block, base64-encoded when serialized.
///
/// This mirrors how a teacher `Id` wraps a fixed-size hash, but the on-wire
/// representation here is base64 rather than hex, matching the filename and
/// manifest grammar this repair engine targets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id([u8; LEN]);

impl Id {
    /// Wrap a raw 32-byte digest.
    #[must_use]
    pub const fn new(bytes: [u8; LEN]) -> Self {
        Self(bytes)
    }

    /// Parse an `Id` from its base64 string form.
    pub fn from_base64(s: &str) -> RepairResult<Self> {
        if s.is_empty() {
            return Err(RepairError::new(ErrorKind::Codec, "empty hash string"));
        }
        let decoded = STANDARD
            .decode(s)
            .map_err(|err| RepairError::new(ErrorKind::Codec, "invalid base64 hash").source(err))?;
        let bytes: [u8; LEN] = decoded.try_into().map_err(|v: Vec<u8>| {
            RepairError::new(ErrorKind::Codec, "hash has the wrong length")
                .context("length", v.len().to_string())
        })?;
        Ok(Self(bytes))
    }

    /// Render as a base64 string, the form used in manifests and log output.
    #[must_use]
    pub fn to_base64(self) -> String {
        STANDARD.encode(self.0)
    }

    /// Generate a random `Id`. Used by tests and by the locator's temp-file naming.
    #[must_use]
    pub fn random() -> Self {
        let mut id = Self::default();
        rng().fill_bytes(&mut id.0);
        id
    }

    /// `true` if this is the all-zero sentinel.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self == &Self::default()
    }

    /// Check whether this `Id` is the hash of the bytes yielded by `reader`.
    pub fn matches_reader(&self, length: usize, r: &mut impl std::io::Read) -> bool {
        let mut buf = vec![0; length];
        r.read_exact(&mut buf).is_ok() && self == &hash(&buf)
    }
}

impl FromStr for Id {
    type Err = Box<RepairError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.to_base64();
        write!(f, "{}", &encoded[..11.min(encoded.len())])
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_base64())
    }
}

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}
