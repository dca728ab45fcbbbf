//! Child-set fingerprints for cache validation.

use std::time::{SystemTime, UNIX_EPOCH};

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::entry::{Entry, EntryKind};

/// BLAKE3 digest over a directory's sorted child set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

/// One child as seen by the fingerprint.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintItem<'a> {
    pub name: &'a str,
    pub kind: EntryKind,
    pub modified: SystemTime,
    /// Ignored for directories, whose size is derived.
    pub size: u64,
}

impl Fingerprint {
    /// Create a fingerprint from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a child set. Input order does not matter.
    pub fn compute<'a>(items: impl IntoIterator<Item = FingerprintItem<'a>>) -> Self {
        let mut items: Vec<FingerprintItem<'a>> = items.into_iter().collect();
        items.sort_unstable_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

        let mut hasher = Hasher::new();
        hasher.update(&(items.len() as u64).to_le_bytes());
        for item in &items {
            hasher.update(&(item.name.len() as u64).to_le_bytes());
            hasher.update(item.name.as_bytes());
            hasher.update(&[item.kind.tag()]);

            let (sign, since) = match item.modified.duration_since(UNIX_EPOCH) {
                Ok(d) => (0u8, d),
                Err(e) => (1u8, e.duration()),
            };
            hasher.update(&[sign]);
            hasher.update(&since.as_secs().to_le_bytes());
            hasher.update(&since.subsec_nanos().to_le_bytes());

            let size = if item.kind.is_dir() { 0 } else { item.size };
            hasher.update(&size.to_le_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Fingerprint the children of a listing.
    pub fn of_entries(children: &[Entry]) -> Self {
        Self::compute(children.iter().map(|e| FingerprintItem {
            name: e.name.as_str(),
            kind: e.kind,
            modified: e.modified,
            size: e.size,
        }))
    }

    /// Get the fingerprint as a hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}
