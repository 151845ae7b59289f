use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("wrong digest length: expected 32 bytes, got {0}")]
    WrongLength(usize),
}

macro_rules! digest_newtype {
    ($name:ident) => {
        /// 256-bit content digest, stored raw and rendered as lowercase hex.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name([u8; 32]);

        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Digest of the given data.
            pub fn from_data(data: &[u8]) -> Self {
                let mut hasher = Sha256::new();
                hasher.update(data);
                Self(hasher.finalize().into())
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = HashParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = hex::decode(s)?;
                let bytes: [u8; 32] =
                    raw.try_into().map_err(|v: Vec<u8>| HashParseError::WrongLength(v.len()))?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Eight hex chars is plenty for log lines.
                write!(f, concat!(stringify!($name), "({}..)"), &self.hex()[..8])
            }
        }
    };
}

digest_newtype!(ChunkId);
digest_newtype!(FileHash);

impl FileHash {
    /// Finalize a streaming hasher into a file hash.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let id = ChunkId::from_data(b"some chunk bytes");
        let parsed: ChunkId = id.hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(matches!("abcd".parse::<ChunkId>(), Err(HashParseError::WrongLength(2))));
        assert!("zz".repeat(32).parse::<ChunkId>().is_err());
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"streaming and one-shot hashes must agree";
        let mut hasher = Sha256::new();
        hasher.update(&data[..10]);
        hasher.update(&data[10..]);
        assert_eq!(FileHash::from_hasher(hasher), FileHash::from_data(data));
    }
}
