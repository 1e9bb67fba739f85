//! Content-addressed blob store for textures, comments and long
//! descriptions: `<root>/<first-2-hex>/<full-40-hex>`, written via `.tmp`
//! plus atomic rename.

use ring::digest;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn sha1_hex(data: &[u8]) -> String {
    let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data);
    let mut out = String::with_capacity(40);

    for byte in digest.as_ref() {
        let _ = write!(out, "{byte:02x}");
    }

    out
}

pub fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);

    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }

    out
}

fn valid_hash(hash: &str) -> bool {
    hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref())?;

        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2]).join(hash)
    }

    /// Stores `data` and returns its SHA-1. Repeated puts of the same bytes
    /// land on the same path and skip the write.
    pub fn put(&self, data: &[u8]) -> io::Result<String> {
        let hash = sha1_hex(data);
        let path = self.path_for(&hash);

        if path.exists() {
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o640))?;
        }

        fs::rename(&tmp, &path)?;

        Ok(hash)
    }

    /// Reads a blob back. A missing file, a malformed key, or content whose
    /// digest no longer matches all read as not-found.
    pub fn get(&self, hash: &str) -> io::Result<Option<Vec<u8>>> {
        if !valid_hash(hash) {
            return Ok(None);
        }

        let path = self.path_for(hash);

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if sha1_hex(&data) != hash {
            tracing::warn!("blob {} failed its digest check", hash);

            return Ok(None);
        }

        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_reference_vector() {
        // FIPS 180-1 "abc"
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let hash = store.put(b"hello blob").unwrap();
        assert_eq!(store.get(&hash).unwrap().unwrap(), b"hello blob");
    }

    #[test]
    fn put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let first = store.put(b"same bytes").unwrap();
        let second = store.put(b"same bytes").unwrap();
        assert_eq!(first, second);

        // exactly one file under the fan-out directory
        let fanout = dir.path().join(&first[..2]);
        assert_eq!(fs::read_dir(fanout).unwrap().count(), 1);
    }

    #[test]
    fn sharded_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let hash = store.put(b"layout").unwrap();
        assert!(dir.path().join(&hash[..2]).join(&hash).exists());
    }

    #[test]
    fn corrupted_blob_reads_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let hash = store.put(b"pristine").unwrap();
        fs::write(dir.path().join(&hash[..2]).join(&hash), b"tampered").unwrap();

        assert!(store.get(&hash).unwrap().is_none());
    }

    #[test]
    fn malformed_keys_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        assert!(store.get("nope").unwrap().is_none());
        assert!(store.get("../../etc/passwd").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn blob_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let hash = store.put(b"perms").unwrap();
        let meta = fs::metadata(dir.path().join(&hash[..2]).join(&hash)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
    }
}
