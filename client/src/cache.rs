//! The cached-file engine: the bridge between POSIX byte ranges and the
//! remote's encrypted, content-addressed blocks.
//!
//! On-disk layout, rooted at the per-user cache directory:
//!
//! ```text
//! fscache/tmp/<n>          files under construction (dirty, unnamed)
//! fscache/ab/<fingerprint> local copies of known remote versions
//! ```
//!
//! The fingerprint is SHA-256 over the entry's block references, so files
//! whose remote content is unchanged share a cache path no matter their
//! name. Store copies are demand-loaded: open validates the entry and
//! sizes the local file, but blocks are fetched only when a read touches
//! them, with a per-file presence map remembering which blocks have
//! landed. Presence survives close and reopen; the cache directory is
//! wiped at startup so it never outlives the maps.
//!
//! Writes are copy-on-write: an in-store file is completed and cloned to
//! a fresh temporary before the first byte changes, and writeback renames
//! the result to its new fingerprint. Closed files enter an LRU with a
//! byte ceiling; eviction deletes oldest first.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::api_client::ApiClient;
use crate::cryptfile::{CryptFile, CryptStore};
use crate::error::{Error, Kind, Result};
use crate::packer::EntryUnpacker;
use crate::proto::{BlockRef, DirEntry, Packing};

const COPY_CHUNK: usize = 128 * 1024;
const WRITEBACK_RETRIES: u32 = 3;
const WRITEBACK_DELAY: Duration = Duration::from_millis(500);

/// The on-disk backing for a node's content.
pub struct CachedFile {
    file: CryptFile,
    /// The local copy matches a known remote version.
    pub in_store: bool,
    /// Modified since the last successful writeback.
    pub dirty: bool,
    /// Remote sequence at the time the content was read or stored.
    pub sequence: i64,
    /// Present while the file may still be missing blocks; carries the
    /// validated entry and its unwrapped key for demand loads.
    loader: Option<EntryUnpacker>,
}

impl CachedFile {
    pub fn fname(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> Result<u64> {
        self.file.len().map_err(|e| Error::io("cache", self.file.path().to_string_lossy(), e))
    }
}

struct ClosedLru {
    lru: LruCache<PathBuf, u64>,
    total: u64,
    pinned: HashSet<PathBuf>,
}

pub struct Cache {
    root: PathBuf,
    tmp: PathBuf,
    store: Arc<CryptStore>,
    limit: u64,
    next_tmp: AtomicU64,
    inner: Mutex<ClosedLru>,
    /// fingerprint path → which blocks have been fetched, for files that
    /// are not yet complete. No entry means complete.
    presence: Mutex<HashMap<PathBuf, Vec<bool>>>,
}

impl Cache {
    /// Create the engine rooted at `dir`, wiping whatever a previous
    /// process left there. The directory is exclusively ours.
    pub fn new(dir: &Path, limit: u64) -> Result<Cache> {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("cache-init", dir.to_string_lossy(), e)),
        }
        let tmp = dir.join("tmp");
        std::fs::create_dir_all(&tmp)
            .map_err(|e| Error::io("cache-init", tmp.to_string_lossy(), e))?;
        Ok(Cache {
            root: dir.to_path_buf(),
            tmp,
            store: CryptStore::new(),
            limit,
            next_tmp: AtomicU64::new(1),
            inner: Mutex::new(ClosedLru {
                lru: LruCache::unbounded(),
                total: 0,
                pinned: HashSet::new(),
            }),
            presence: Mutex::new(HashMap::new()),
        })
    }

    /// Stable fingerprint of a block list: SHA-256 over the concatenated
    /// reference bytes, rendered as 64 hex digits.
    pub fn fingerprint(blocks: &[BlockRef]) -> String {
        let mut h = Sha256::new();
        for b in blocks {
            h.update(b.reference.as_bytes());
        }
        hex::encode(h.finalize())
    }

    fn fingerprint_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(&fingerprint[..2]).join(fingerprint)
    }

    fn tmp_path(&self) -> PathBuf {
        let n = self.next_tmp.fetch_add(1, Ordering::Relaxed);
        self.tmp.join(n.to_string())
    }

    // ---- LRU of closed files ----

    fn lru_add(&self, path: PathBuf, size: u64) {
        let mut evict = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.pinned.contains(&path) {
                return;
            }
            if inner.lru.put(path, size).is_none() {
                inner.total += size;
            }
            while inner.total > self.limit {
                match inner.lru.pop_lru() {
                    Some((p, s)) => {
                        inner.total -= s;
                        evict.push(p);
                    }
                    None => break,
                }
            }
        }
        for p in evict {
            tracing::debug!(path = %p.display(), "evicting closed cache file");
            self.presence.lock().remove(&p);
            if let Err(e) = self.store.remove(&p) {
                tracing::debug!(path = %p.display(), error = %e, "evict failed");
            }
        }
    }

    fn lru_remove(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some(size) = inner.lru.pop(path) {
            inner.total -= size;
        }
    }

    /// Bytes currently attributed to closed cache files.
    pub fn closed_bytes(&self) -> u64 {
        self.inner.lock().total
    }

    /// Pin a cache file so eviction never touches it. Used for attribute
    /// shadow files whose writeback failed; they must survive in-process.
    pub fn pin(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some(size) = inner.lru.pop(path) {
            inner.total -= size;
        }
        inner.pinned.insert(path.to_path_buf());
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.inner.lock().pinned.contains(path)
    }

    // ---- file operations (caller holds the node lock) ----

    /// A fresh, empty, dirty cache file for a newly created node.
    pub fn create(&self) -> Result<CachedFile> {
        let path = self.tmp_path();
        let file = self
            .store
            .open(&path, true)
            .map_err(|e| Error::io("create", path.to_string_lossy(), e))?;
        Ok(CachedFile { file, in_store: false, dirty: true, sequence: 0, loader: None })
    }

    /// Materialize `entry` as a local file. The entry is validated (block
    /// list dense and ordered, packdata consistent, signature good) and
    /// the file is sized, but block content is fetched on demand by
    /// reads. An existing fingerprint file is taken over, partial or
    /// complete; plain-packed entries are always re-fetched in full.
    pub async fn open(&self, client: &ApiClient, entry: &DirEntry) -> Result<CachedFile> {
        let mut offset = 0u64;
        for b in &entry.blocks {
            // A sparse or shuffled block list is corrupt; nothing can be
            // cached from it.
            if b.offset != offset {
                return Err(Error::new("open", &entry.name, Kind::Invalid)
                    .with_detail("block offset out of order"));
            }
            offset += b.size;
        }

        if entry.packing == Packing::Plain {
            let tmp = self.tmp_path();
            let file = self
                .store
                .open(&tmp, true)
                .map_err(|e| Error::io("open", tmp.to_string_lossy(), e))?;
            for b in &entry.blocks {
                let data = client.get_block(&b.reference).await?;
                file.write_at(&data, b.offset).map_err(|e| Error::io("open", &*entry.name, e))?;
            }
            return Ok(CachedFile {
                file,
                in_store: true,
                dirty: false,
                sequence: entry.sequence,
                loader: None,
            });
        }

        let fingerprint = Self::fingerprint(&entry.blocks);
        let fpath = self.fingerprint_path(&fingerprint);
        if let Some(prefix) = fpath.parent() {
            std::fs::create_dir_all(prefix)
                .map_err(|e| Error::io("open", prefix.to_string_lossy(), e))?;
        }

        if fpath.exists() {
            self.lru_remove(&fpath);
            let file = self
                .store
                .open(&fpath, false)
                .map_err(|e| Error::io("open", fpath.to_string_lossy(), e))?;
            let partial = self.presence.lock().contains_key(&fpath);
            let loader = if partial { Some(self.unpacker_for(client, entry).await?) } else { None };
            tracing::debug!(path = %entry.name, cache = %fingerprint, partial, "cache hit");
            return Ok(CachedFile {
                file,
                in_store: true,
                dirty: false,
                sequence: entry.sequence,
                loader,
            });
        }

        let file = self
            .store
            .open(&fpath, true)
            .map_err(|e| Error::io("open", fpath.to_string_lossy(), e))?;
        file.set_len(entry.size()).map_err(|e| Error::io("open", &*entry.name, e))?;
        let loader = if entry.blocks.is_empty() {
            None
        } else {
            let unpacker = self.unpacker_for(client, entry).await?;
            self.presence.lock().insert(fpath.clone(), vec![false; entry.blocks.len()]);
            Some(unpacker)
        };
        Ok(CachedFile { file, in_store: true, dirty: false, sequence: entry.sequence, loader })
    }

    async fn unpacker_for(&self, client: &ApiClient, entry: &DirEntry) -> Result<EntryUnpacker> {
        let (writer_key, writer_prev) = client.user_key(&entry.writer).await?;
        client.packer().unpack(entry, &writer_key, writer_prev.as_ref())
    }

    /// Fetch whatever blocks of `[offset, offset+len)` are still missing.
    async fn ensure_range(
        &self,
        client: &ApiClient,
        cf: &mut CachedFile,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        let Some(loader) = cf.loader.as_ref() else { return Ok(()) };
        let path = cf.file.path().to_path_buf();
        let end = offset.saturating_add(len);
        let blocks = loader.blocks().to_vec();
        for (i, b) in blocks.iter().enumerate() {
            if b.offset + b.size <= offset || b.offset >= end {
                continue;
            }
            let missing = self.presence.lock().get(&path).map_or(false, |p| !p[i]);
            if !missing {
                continue;
            }
            let ciphertext = client.get_block(&b.reference).await?;
            let clear = loader.unpack(b, &ciphertext)?;
            cf.file
                .write_at(&clear, b.offset)
                .map_err(|e| Error::io("read", path.to_string_lossy(), e))?;
            let mut presence = self.presence.lock();
            if let Some(p) = presence.get_mut(&path) {
                p[i] = true;
                if p.iter().all(|&done| done) {
                    presence.remove(&path);
                }
            }
        }
        if !self.presence.lock().contains_key(&path) {
            cf.loader = None;
        }
        Ok(())
    }

    /// Positional read; a short read past end is EOF, not an error.
    pub async fn read(
        &self,
        client: &ApiClient,
        cf: &mut CachedFile,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        self.ensure_range(client, cf, offset, buf.len() as u64).await?;
        cf.file
            .read_at(buf, offset)
            .map_err(|e| Error::io("read", cf.file.path().to_string_lossy(), e))
    }

    /// Positional write; completes and clones an in-store file first so
    /// store copies are never modified in place.
    pub async fn write(
        &self,
        client: &ApiClient,
        cf: &mut CachedFile,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        self.mark_dirty(client, cf).await?;
        cf.file
            .write_at(data, offset)
            .map_err(|e| Error::io("write", cf.file.path().to_string_lossy(), e))
    }

    async fn mark_dirty(&self, client: &ApiClient, cf: &mut CachedFile) -> Result<()> {
        if cf.dirty {
            return Ok(());
        }
        if cf.in_store {
            self.ensure_range(client, cf, 0, u64::MAX).await?;
            self.clone_file(cf, None)?;
        }
        cf.dirty = true;
        cf.in_store = false;
        Ok(())
    }

    /// Truncate in place when already dirty; otherwise clone the prefix
    /// (completing it first) to a fresh temporary and swap.
    pub async fn truncate(&self, client: &ApiClient, cf: &mut CachedFile, size: u64) -> Result<()> {
        if !cf.dirty && cf.in_store {
            self.ensure_range(client, cf, 0, size).await?;
            self.clone_file(cf, Some(size))?;
        }
        cf.file
            .set_len(size)
            .map_err(|e| Error::io("truncate", cf.file.path().to_string_lossy(), e))?;
        cf.dirty = true;
        cf.in_store = false;
        Ok(())
    }

    /// Copy the first `size` bytes (all of them when None) to a new
    /// temporary and make it the backing file. The old store copy stays
    /// on disk for other opens and joins the closed-file LRU.
    fn clone_file(&self, cf: &mut CachedFile, size: Option<u64>) -> Result<()> {
        let old_path = cf.file.path().to_path_buf();
        let old_len = cf.len()?;
        let copy_len = size.map_or(old_len, |s| s.min(old_len));

        let tmp = self.tmp_path();
        let fresh = self
            .store
            .open(&tmp, true)
            .map_err(|e| Error::io("clone", tmp.to_string_lossy(), e))?;

        let mut buf = vec![0u8; COPY_CHUNK];
        let mut offset = 0u64;
        while offset < copy_len {
            let want = ((copy_len - offset) as usize).min(COPY_CHUNK);
            let n = cf
                .file
                .read_at(&mut buf[..want], offset)
                .map_err(|e| Error::io("clone", old_path.to_string_lossy(), e))?;
            if n == 0 {
                break;
            }
            fresh
                .write_at(&buf[..n], offset)
                .map_err(|e| Error::io("clone", tmp.to_string_lossy(), e))?;
            offset += n as u64;
        }

        cf.file = fresh;
        cf.loader = None;
        if cf.in_store {
            self.lru_add(old_path, old_len);
        }
        Ok(())
    }

    /// Push the whole file to the remote. No-op when clean or writeback
    /// is suppressed; unreachable servers get a few retries. On success
    /// the local copy is renamed to its new fingerprint and marked clean.
    pub async fn writeback(
        &self,
        client: &ApiClient,
        path: &str,
        cf: &mut CachedFile,
        no_writeback: bool,
        mtime: u64,
    ) -> Result<Option<DirEntry>> {
        if !cf.dirty || no_writeback {
            return Ok(None);
        }

        let len = cf.len()?;
        let mut data = vec![0u8; len as usize];
        let n = cf
            .file
            .read_at(&mut data, 0)
            .map_err(|e| Error::io("writeback", path, e))?;
        data.truncate(n);

        let mut attempt = 0u32;
        let entry = loop {
            match client.put(path, &data, mtime).await {
                Ok(entry) => break entry,
                Err(e) if e.is_unreachable() && attempt < WRITEBACK_RETRIES => {
                    attempt += 1;
                    tracing::warn!(path, attempt, "writeback target unreachable, retrying");
                    tokio::time::sleep(WRITEBACK_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        };

        let fingerprint = Self::fingerprint(&entry.blocks);
        let fpath = self.fingerprint_path(&fingerprint);
        if let Some(prefix) = fpath.parent() {
            std::fs::create_dir_all(prefix)
                .map_err(|e| Error::io("writeback", prefix.to_string_lossy(), e))?;
        }
        match self.store.rename_file(&mut cf.file, &fpath) {
            Ok(()) => {
                // This copy is complete by construction.
                self.presence.lock().remove(&fpath);
            }
            Err(e) => {
                // The file stays usable under its temporary name.
                tracing::debug!(path, error = %e, "rename to fingerprint failed");
            }
        }

        cf.dirty = false;
        cf.in_store = true;
        cf.sequence = entry.sequence;
        Ok(Some(entry))
    }

    /// Drop the local copy entirely; used when notification says the
    /// cached version is stale.
    pub fn forget(&self, cf: CachedFile) {
        let path = cf.file.path().to_path_buf();
        self.lru_remove(&path);
        self.presence.lock().remove(&path);
        drop(cf);
        if let Err(e) = self.store.remove(&path) {
            tracing::debug!(path = %path.display(), error = %e, "forget failed");
        }
    }

    /// Last handle of a node closed: the backing file joins the LRU of
    /// closed files (unless pinned) and may be evicted.
    pub fn close(&self, cf: CachedFile) {
        let path = cf.file.path().to_path_buf();
        let size = cf.len().unwrap_or(0);
        drop(cf);
        self.lru_add(path, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Factotum;
    use crate::proto::BlockRef;

    fn block(reference: &str) -> BlockRef {
        BlockRef { offset: 0, size: 1, reference: reference.to_string(), checksum: String::new() }
    }

    /// A client that never gets used: dirty local files demand nothing.
    fn offline_client() -> ApiClient {
        ApiClient::new("http://127.0.0.1:9", "u@x", Arc::new(Factotum::generate()), 4096).unwrap()
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    #[test]
    fn fingerprints_depend_only_on_references() {
        let a = [block("one"), block("two")];
        let mut b = [block("one"), block("two")];
        b[0].offset = 99;
        b[1].checksum = "ff".into();
        assert_eq!(Cache::fingerprint(&a), Cache::fingerprint(&b));
        let c = [block("one"), block("three")];
        assert_ne!(Cache::fingerprint(&a), Cache::fingerprint(&c));
        assert_eq!(Cache::fingerprint(&a).len(), 64);
    }

    #[test]
    fn create_write_read_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&dir.path().join("fscache"), 1 << 20).unwrap();
        let client = offline_client();
        let rt = rt();
        let mut cf = cache.create().unwrap();
        assert!(cf.dirty);
        assert!(!cf.in_store);

        rt.block_on(cache.write(&client, &mut cf, b"0123456789", 0)).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(rt.block_on(cache.read(&client, &mut cf, &mut buf, 0)).unwrap(), 10);
        assert_eq!(&buf, b"0123456789");

        rt.block_on(cache.truncate(&client, &mut cf, 4)).unwrap();
        assert_eq!(cf.len().unwrap(), 4);
        let n = rt.block_on(cache.read(&client, &mut cf, &mut buf, 0)).unwrap();
        assert_eq!(&buf[..n], b"0123");

        // Extension reads back as zeros.
        rt.block_on(cache.truncate(&client, &mut cf, 8)).unwrap();
        let n = rt.block_on(cache.read(&client, &mut cf, &mut buf, 0)).unwrap();
        assert_eq!(&buf[..n], b"0123\0\0\0\0");

        // Reads past end are EOF, not errors.
        assert_eq!(rt.block_on(cache.read(&client, &mut cf, &mut buf, 100)).unwrap(), 0);
    }

    #[test]
    fn write_clones_in_store_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&dir.path().join("fscache"), 1 << 20).unwrap();
        let client = offline_client();
        let rt = rt();
        let mut cf = cache.create().unwrap();
        rt.block_on(cache.write(&client, &mut cf, b"stored content", 0)).unwrap();
        // Pretend a writeback just happened.
        cf.dirty = false;
        cf.in_store = true;
        let stored_name = cf.fname().to_path_buf();

        rt.block_on(cache.write(&client, &mut cf, b"X", 0)).unwrap();
        assert!(cf.dirty);
        assert!(!cf.in_store);
        assert_ne!(cf.fname(), stored_name);
        // The store copy is still on disk, untouched.
        assert!(stored_name.exists());

        let mut buf = [0u8; 14];
        rt.block_on(cache.read(&client, &mut cf, &mut buf, 0)).unwrap();
        assert_eq!(&buf, b"Xtored content");
    }

    #[test]
    fn truncate_on_in_store_clones_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&dir.path().join("fscache"), 1 << 20).unwrap();
        let client = offline_client();
        let rt = rt();
        let mut cf = cache.create().unwrap();
        rt.block_on(cache.write(&client, &mut cf, b"abcdefgh", 0)).unwrap();
        cf.dirty = false;
        cf.in_store = true;

        rt.block_on(cache.truncate(&client, &mut cf, 3)).unwrap();
        assert!(cf.dirty);
        let mut buf = [0u8; 8];
        let n = rt.block_on(cache.read(&client, &mut cf, &mut buf, 0)).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn eviction_keeps_closed_bytes_under_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let limit = 4096u64;
        let cache = Cache::new(&dir.path().join("fscache"), limit).unwrap();
        let client = offline_client();
        let rt = rt();

        let mut paths = Vec::new();
        for _ in 0..8 {
            let mut cf = cache.create().unwrap();
            rt.block_on(cache.write(&client, &mut cf, &[7u8; 1024], 0)).unwrap();
            paths.push(cf.fname().to_path_buf());
            cache.close(cf);
        }

        assert!(cache.closed_bytes() <= limit);
        let on_disk: u64 = paths.iter().filter(|p| p.exists()).count() as u64 * 1024;
        assert!(on_disk <= limit * 5 / 4, "on disk: {}", on_disk);
        // The oldest files are the ones that went.
        assert!(!paths[0].exists());
        assert!(paths[7].exists());
    }

    #[test]
    fn reopen_removes_from_lru_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&dir.path().join("fscache"), 1 << 20).unwrap();
        let client = offline_client();
        let rt = rt();
        let mut cf = cache.create().unwrap();
        rt.block_on(cache.write(&client, &mut cf, &[1u8; 512], 0)).unwrap();
        let path = cf.fname().to_path_buf();
        cache.close(cf);
        assert_eq!(cache.closed_bytes(), 512);
        cache.lru_remove(&path);
        assert_eq!(cache.closed_bytes(), 0);
    }

    #[test]
    fn pinned_files_are_never_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&dir.path().join("fscache"), 1024).unwrap();
        let client = offline_client();
        let rt = rt();

        let mut shadow = cache.create().unwrap();
        rt.block_on(cache.write(&client, &mut shadow, &[9u8; 800], 0)).unwrap();
        let shadow_path = shadow.fname().to_path_buf();
        cache.pin(&shadow_path);
        cache.close(shadow);

        // Push enough data through to evict anything evictable.
        for _ in 0..4 {
            let mut cf = cache.create().unwrap();
            rt.block_on(cache.write(&client, &mut cf, &[1u8; 1024], 0)).unwrap();
            cache.close(cf);
        }
        assert!(shadow_path.exists());
        assert!(cache.is_pinned(&shadow_path));
    }

    #[test]
    fn startup_wipes_the_cache_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fscache");
        std::fs::create_dir_all(root.join("ab")).unwrap();
        std::fs::write(root.join("ab").join("stale"), b"old").unwrap();
        let _cache = Cache::new(&root, 1 << 20).unwrap();
        assert!(!root.join("ab").join("stale").exists());
        assert!(root.join("tmp").exists());
    }
}
