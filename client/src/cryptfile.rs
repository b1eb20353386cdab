//! Encryption at rest for local cache files.
//!
//! Cache files hold remote cleartext, so they are never written to disk in
//! the clear. Each file gets a random AES-256 key that lives only in this
//! process; bytes are XORed with the AES encryption of their 16-byte block
//! index, which keeps reads and writes positional. The key registry is
//! keyed by on-disk path and reference counted so renames and deletes stay
//! coherent with the cache engine's file moves.
//!
//! The cache directory is wiped at startup, so losing the in-memory keys on
//! exit loses nothing.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};

const BLOCK: usize = 16;
const ZERO_CHUNK: usize = 128 * 1024;

struct KeyEntry {
    key: [u8; 32],
    refs: usize,
}

/// Registry of per-file keys. Owned by the cache engine; one per mount.
#[derive(Default)]
pub struct CryptStore {
    inner: Mutex<HashMap<PathBuf, KeyEntry>>,
}

impl CryptStore {
    pub fn new() -> Arc<Self> {
        Arc::new(CryptStore::default())
    }

    /// Open `path` read/write, creating it if needed. A key is minted on
    /// first open of a path and shared by later opens; the entry survives
    /// last close so closed-but-cached files stay readable.
    pub fn open(self: &Arc<Self>, path: &Path, truncate: bool) -> io::Result<CryptFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;
        let key = {
            let mut inner = self.inner.lock();
            let entry = inner.entry(path.to_path_buf()).or_insert_with(|| {
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                KeyEntry { key, refs: 0 }
            });
            entry.refs += 1;
            entry.key
        };
        Ok(CryptFile {
            store: Arc::clone(self),
            file,
            key,
            path: path.to_path_buf(),
        })
    }

    /// Move the on-disk file and its key binding together.
    pub fn rename(&self, old: &Path, new: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock();
        std::fs::rename(old, new)?;
        if let Some(entry) = inner.remove(old) {
            inner.insert(new.to_path_buf(), entry);
        }
        Ok(())
    }

    /// Rename under an open handle, keeping handle, key binding and disk
    /// file in step. Replacing an existing destination rebinds it; readers
    /// already open on the replaced file keep their own key and inode.
    pub fn rename_file(&self, file: &mut CryptFile, new: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock();
        std::fs::rename(&file.path, new)?;
        if let Some(entry) = inner.remove(&file.path) {
            inner.insert(new.to_path_buf(), entry);
        }
        file.path = new.to_path_buf();
        Ok(())
    }

    /// Delete the file and drop its key. Open handles keep their own copy
    /// of the key and are unaffected.
    pub fn remove(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.remove(path);
        std::fs::remove_file(path)
    }

    /// Current open-handle count for a path; diagnostic only.
    pub fn refs(&self, path: &Path) -> usize {
        self.inner.lock().get(path).map_or(0, |e| e.refs)
    }

    fn release(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(path) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }
}

/// One open, encrypted-at-rest file. Positional I/O only; the cache engine
/// tracks offsets itself.
pub struct CryptFile {
    store: Arc<CryptStore>,
    file: File,
    key: [u8; 32],
    path: PathBuf,
}

impl CryptFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let n = self.file.read_at(buf, offset)?;
        self.apply_keystream(&mut buf[..n], offset);
        Ok(n)
    }

    /// Write all of `data` at `offset`. Writing past EOF first fills the
    /// gap with encrypted zeros so reads of the hole return zeros.
    pub fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        let len = self.len()?;
        if offset > len {
            self.write_encrypted_zeros(len, offset)?;
        }
        let mut out = data.to_vec();
        self.apply_keystream(&mut out, offset);
        self.file.write_all_at(&out, offset)?;
        Ok(data.len())
    }

    /// Truncate or extend to `size`; extension is zero-filled.
    pub fn set_len(&self, size: u64) -> io::Result<()> {
        let len = self.len()?;
        self.file.set_len(size)?;
        if size > len {
            self.write_encrypted_zeros(len, size)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn write_encrypted_zeros(&self, from: u64, to: u64) -> io::Result<()> {
        let mut pos = from;
        let mut buf = vec![0u8; ZERO_CHUNK];
        while pos < to {
            let n = ((to - pos) as usize).min(ZERO_CHUNK);
            buf[..n].fill(0);
            self.apply_keystream(&mut buf[..n], pos);
            self.file.write_all_at(&buf[..n], pos)?;
            pos += n as u64;
        }
        Ok(())
    }

    /// XOR `buf` (starting at file offset `offset`) with the AES
    /// encryption of each covered block index.
    fn apply_keystream(&self, buf: &mut [u8], offset: u64) {
        if buf.is_empty() {
            return;
        }
        let cipher = Aes256::new(GenericArray::from_slice(&self.key));
        let mut index = offset / BLOCK as u64;
        let mut skip = (offset % BLOCK as u64) as usize;
        let mut pos = 0usize;
        while pos < buf.len() {
            let mut block = [0u8; BLOCK];
            block[8..].copy_from_slice(&index.to_be_bytes());
            let mut ga = GenericArray::from(block);
            cipher.encrypt_block(&mut ga);
            let n = (BLOCK - skip).min(buf.len() - pos);
            for i in 0..n {
                buf[pos + i] ^= ga[skip + i];
            }
            pos += n;
            skip = 0;
            index += 1;
        }
    }
}

impl Drop for CryptFile {
    fn drop(&mut self) {
        self.store.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_and_on_disk_bytes_differ() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let store = CryptStore::new();
        let f = store.open(&path, true).unwrap();

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        f.write_at(&data, 0).unwrap();

        let mut back = vec![0u8; data.len()];
        assert_eq!(f.read_at(&mut back, 0).unwrap(), data.len());
        assert_eq!(back, data);

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), data.len());
        assert_ne!(raw, data);
    }

    #[test]
    fn unaligned_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let store = CryptStore::new();
        let f = store.open(&path, true).unwrap();

        f.write_at(&[0xaa; 100], 0).unwrap();
        f.write_at(b"hello", 7).unwrap();
        let mut buf = [0u8; 5];
        f.read_at(&mut buf, 7).unwrap();
        assert_eq!(&buf, b"hello");
        let mut one = [0u8; 1];
        f.read_at(&mut one, 9).unwrap();
        assert_eq!(one[0], b'l');
    }

    #[test]
    fn gap_writes_and_extension_read_as_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let store = CryptStore::new();
        let f = store.open(&path, true).unwrap();

        f.write_at(b"abc", 0).unwrap();
        f.write_at(b"xyz", 100).unwrap();
        let mut buf = vec![0u8; 103];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 103);
        assert_eq!(&buf[..3], b"abc");
        assert!(buf[3..100].iter().all(|&b| b == 0));
        assert_eq!(&buf[100..], b"xyz");

        f.set_len(200).unwrap();
        let mut tail = vec![0u8; 97];
        assert_eq!(f.read_at(&mut tail, 103).unwrap(), 97);
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn reopen_after_close_keeps_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let store = CryptStore::new();
        {
            let f = store.open(&path, true).unwrap();
            f.write_at(b"persistent", 0).unwrap();
        }
        assert_eq!(store.refs(&path), 0);
        let f = store.open(&path, false).unwrap();
        let mut buf = [0u8; 10];
        f.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"persistent");
    }

    #[test]
    fn rename_moves_the_key_binding() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        let store = CryptStore::new();
        {
            let f = store.open(&old, true).unwrap();
            f.write_at(b"moved", 0).unwrap();
        }
        store.rename(&old, &new).unwrap();
        let f = store.open(&new, false).unwrap();
        let mut buf = [0u8; 5];
        f.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"moved");
    }

    #[test]
    fn remove_drops_file_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let store = CryptStore::new();
        {
            let f = store.open(&path, true).unwrap();
            f.write_at(b"gone", 0).unwrap();
        }
        store.remove(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(store.refs(&path), 0);
    }

    #[test]
    fn refcount_tracks_open_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let store = CryptStore::new();
        let a = store.open(&path, true).unwrap();
        let b = store.open(&path, false).unwrap();
        assert_eq!(store.refs(&path), 2);
        drop(a);
        assert_eq!(store.refs(&path), 1);
        drop(b);
        assert_eq!(store.refs(&path), 0);
    }
}
