//! SHA-1 message digests. WIM archives are content-addressed: every data
//! stream is identified by the SHA-1 of its uncompressed bytes.

use std::fmt;
use std::str::FromStr;

use binrw::prelude::*;
use sha1::{Digest, Sha1};

pub const SHA1_HASH_SIZE: usize = 20;

#[derive(BinRead, BinWrite, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sha1Hash(pub [u8; SHA1_HASH_SIZE]);

impl Sha1Hash {
    /// The all-zero digest, used by WIM metadata for "no stream".
    pub const ZERO: Sha1Hash = Sha1Hash([0; SHA1_HASH_SIZE]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Digest of a complete in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({self})")
    }
}

impl FromStr for Sha1Hash {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 * SHA1_HASH_SIZE {
            return Err("SHA-1 digest must be 40 hex characters");
        }
        let nibble = |c: u8| match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err("SHA-1 digest contains a non-hex character"),
        };
        let mut out = [0u8; SHA1_HASH_SIZE];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            out[i] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
        }
        Ok(Self(out))
    }
}
