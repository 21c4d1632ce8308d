use std::fmt;

use serde::{Deserialize, Serialize};

/// Width in hex characters of a [`Uid`] (256-bit digest).
pub const UID_HEX_LEN: usize = 64;

/// An opaque, fixed-width content identifier.
///
/// A `Uid` names either a value's payload (`content_uid`) or a value's full
/// causal identity (`uid` = hash of `content_uid` + producing call + output
/// index), or a call's identity. All three share the same representation:
/// the lowercase hex encoding of a BLAKE3-256 digest.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    /// Wrap an already-computed hex digest. Panics if the length doesn't
    /// match a 256-bit digest; this only ever happens if a caller hand-builds
    /// a `Uid` from something other than [`crate::hash::hash_canonical`].
    pub fn from_hex(hex: impl Into<String>) -> Self {
        let hex = hex.into();
        debug_assert_eq!(hex.len(), UID_HEX_LEN, "Uid must be a 256-bit hex digest");
        Uid(hex)
    }

    /// Borrow the hex representation, e.g. for use as a SQL primary key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_digest(digest: blake3::Hash) -> Self {
        Uid(digest.to_hex().to_string())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({}…)", &self.0[..8])
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display() {
        let hex = "a".repeat(UID_HEX_LEN);
        let uid = Uid::from_hex(hex.clone());
        assert_eq!(uid.to_string(), hex);
        assert_eq!(uid.as_str(), hex);
    }
}
