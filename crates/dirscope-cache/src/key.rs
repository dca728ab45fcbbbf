//! Path keys and record encoding.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use dirscope_core::CacheRecord;

use crate::error::CacheError;

/// Version byte prefixed to every stored record.
pub const FORMAT_VERSION: u8 = 1;

/// Key bytes for a normalized path.
#[cfg(unix)]
pub fn path_key(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
pub fn path_key(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// Path for stored key bytes.
#[cfg(unix)]
pub fn key_path(key: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(key))
}

#[cfg(not(unix))]
pub fn key_path(key: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(key).into_owned())
}

/// Prefix shared by every strict descendant of `path`.
pub fn descendant_prefix(path: &Path) -> Vec<u8> {
    let mut key = path_key(path);
    if key.last() != Some(&(MAIN_SEPARATOR as u8)) {
        key.push(MAIN_SEPARATOR as u8);
    }
    key
}

/// Whether `key` lies directly under `prefix` (no further separator).
pub fn is_direct_child(prefix: &[u8], key: &[u8]) -> bool {
    key.len() > prefix.len() && !key[prefix.len()..].contains(&(MAIN_SEPARATOR as u8))
}

pub fn encode(record: &CacheRecord) -> Result<Vec<u8>, CacheError> {
    let mut bytes = vec![FORMAT_VERSION];
    bincode::serialize_into(&mut bytes, record)?;
    Ok(bytes)
}

pub fn decode(key: &[u8], bytes: &[u8]) -> Result<CacheRecord, CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt {
        path: key_path(key),
        reason,
    };
    match bytes.split_first() {
        Some((&FORMAT_VERSION, body)) => {
            bincode::deserialize(body).map_err(|e| corrupt(e.to_string()))
        }
        Some((version, _)) => Err(corrupt(format!("unknown format version {version}"))),
        None => Err(corrupt("empty value".to_string())),
    }
}
