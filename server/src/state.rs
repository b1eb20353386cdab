//! In-memory directory service, block store and key registry.
//!
//! Paths are remote names, `user@domain/elem/...`. Every mutation bumps the
//! owning root's sequence counter and broadcasts a watch event to that
//! root's subscribers. Blocks are content addressed by SHA-256 of the bytes
//! as stored; fetches are counted per reference so tests can observe
//! demand loading.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::types::{AccessRights, DirEntry, EntryKind, LookupResponse, UserKeyRecord, WatchEvent};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// When false the watch endpoint answers not-supported, which pushes
    /// clients onto their pull-refresh path.
    pub watch_supported: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { watch_supported: true }
    }
}

/// A directory-service failure; `kind` uses the shared taxonomy names.
#[derive(Debug, Clone)]
pub struct DirError {
    pub kind: &'static str,
    pub msg: String,
}

impl DirError {
    fn new(kind: &'static str, msg: impl Into<String>) -> Self {
        DirError { kind, msg: msg.into() }
    }
}

pub type DirResult<T> = Result<T, DirError>;

fn user_of(path: &str) -> &str {
    match path.find('/') {
        Some(i) => &path[..i],
        None => path,
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rfind('/').map(|i| &path[..i])
}

#[derive(Default)]
struct DirMap {
    entries: HashMap<String, DirEntry>,
    sequence: HashMap<String, i64>,
}

impl DirMap {
    fn next_sequence(&mut self, root: &str) -> i64 {
        let seq = self.sequence.entry(root.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// User roots spring into existence when first referenced; a remote
    /// tree always has its root.
    fn ensure_root(&mut self, path: &str) {
        let user = user_of(path).to_string();
        if !user.contains('@') || self.entries.contains_key(&user) {
            return;
        }
        let seq = self.next_sequence(&user);
        self.entries.insert(
            user.clone(),
            DirEntry {
                name: user.clone(),
                writer: user,
                kind: EntryKind::Dir,
                packing: crate::types::Packing::Plain,
                sequence: seq,
                mtime: now(),
                link: None,
                blocks: Vec::new(),
                packdata: String::new(),
                attr_mode: 0o700,
            },
        );
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct ServerState {
    pub config: ServerConfig,
    dir: Mutex<DirMap>,
    blocks: Mutex<HashMap<String, Bytes>>,
    fetches: Mutex<HashMap<String, u64>>,
    keys: Mutex<HashMap<String, UserKeyRecord>>,
    watchers: Mutex<HashMap<String, broadcast::Sender<WatchEvent>>>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        ServerState {
            config,
            dir: Mutex::new(DirMap::default()),
            blocks: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    // ---- directory ----

    /// Resolve `path`, traversing no links: the first link met on the way
    /// (or the path itself, if a link) is returned with follow-link status.
    pub fn lookup(&self, path: &str) -> DirResult<LookupResponse> {
        let mut dir = self.dir.lock();
        dir.ensure_root(path);

        // Walk every proper ancestor first.
        let mut idx = 0usize;
        while let Some(i) = path[idx..].find('/') {
            let prefix = &path[..idx + i];
            match dir.entries.get(prefix) {
                None => return Err(DirError::new("not-exist", prefix)),
                Some(e) if e.kind == EntryKind::Link => {
                    return Ok(LookupResponse { status: "follow-link".into(), entry: e.clone() })
                }
                Some(e) if e.kind != EntryKind::Dir => {
                    return Err(DirError::new("not-dir", prefix))
                }
                Some(_) => {}
            }
            idx += i + 1;
        }

        match dir.entries.get(path) {
            None => Err(DirError::new("not-exist", path)),
            Some(e) if e.kind == EntryKind::Link => {
                Ok(LookupResponse { status: "follow-link".into(), entry: e.clone() })
            }
            Some(e) => Ok(LookupResponse { status: "ok".into(), entry: e.clone() }),
        }
    }

    pub fn list(&self, path: &str) -> DirResult<Vec<DirEntry>> {
        let mut dir = self.dir.lock();
        dir.ensure_root(path);
        match dir.entries.get(path) {
            None => return Err(DirError::new("not-exist", path)),
            Some(e) if e.kind != EntryKind::Dir => return Err(DirError::new("not-dir", path)),
            Some(_) => {}
        }
        let prefix = format!("{}/", path);
        let mut out: Vec<DirEntry> = dir
            .entries
            .values()
            .filter(|e| {
                e.name.starts_with(&prefix) && !e.name[prefix.len()..].contains('/')
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn put(&self, path: &str, mut entry: DirEntry) -> DirResult<DirEntry> {
        let event = {
            let mut dir = self.dir.lock();
            dir.ensure_root(path);
            let parent = parent_of(path).ok_or_else(|| {
                DirError::new("permission", "user roots are implied, not written")
            })?;
            match dir.entries.get(parent) {
                None => return Err(DirError::new("not-exist", parent)),
                Some(e) if e.kind != EntryKind::Dir => {
                    return Err(DirError::new("not-dir", parent))
                }
                Some(_) => {}
            }
            if let Some(existing) = dir.entries.get(path) {
                if existing.kind == EntryKind::Dir {
                    // Directories are not versioned in place.
                    return Err(DirError::new(
                        if entry.kind == EntryKind::Dir { "exist" } else { "is-dir" },
                        path,
                    ));
                }
                if entry.kind == EntryKind::Dir {
                    return Err(DirError::new("not-dir", path));
                }
            }
            entry.name = path.to_string();
            entry.sequence = dir.next_sequence(user_of(path));
            if entry.mtime == 0 {
                entry.mtime = now();
            }
            dir.entries.insert(path.to_string(), entry.clone());
            entry
        };
        self.broadcast(WatchEvent { entry: event.clone(), delete: false, error: None });
        Ok(event)
    }

    pub fn delete(&self, path: &str) -> DirResult<DirEntry> {
        let event = {
            let mut dir = self.dir.lock();
            let entry = match dir.entries.get(path) {
                None => return Err(DirError::new("not-exist", path)),
                Some(e) => e.clone(),
            };
            if entry.kind == EntryKind::Dir {
                let prefix = format!("{}/", path);
                if dir.entries.keys().any(|k| k.starts_with(&prefix)) {
                    return Err(DirError::new("not-empty", path));
                }
            }
            dir.entries.remove(path);
            let mut entry = entry;
            entry.sequence = dir.next_sequence(user_of(path));
            entry
        };
        self.broadcast(WatchEvent { entry: event.clone(), delete: true, error: None });
        Ok(event)
    }

    /// Atomic rename. The caller supplies the entry to store at the new
    /// name (packdata is re-signed client-side); blocks and children move
    /// with it. Fails with `exist` if the destination is taken.
    pub fn rename(&self, from: &str, to: &str, mut entry: DirEntry) -> DirResult<DirEntry> {
        let (old_event, new_event) = {
            let mut dir = self.dir.lock();
            let old = match dir.entries.get(from) {
                None => return Err(DirError::new("not-exist", from)),
                Some(e) => e.clone(),
            };
            if dir.entries.contains_key(to) {
                return Err(DirError::new("exist", to));
            }
            let parent = parent_of(to).ok_or_else(|| DirError::new("permission", to))?;
            match dir.entries.get(parent) {
                None => return Err(DirError::new("not-exist", parent)),
                Some(e) if e.kind != EntryKind::Dir => {
                    return Err(DirError::new("not-dir", parent))
                }
                Some(_) => {}
            }

            dir.entries.remove(from);
            if old.kind == EntryKind::Dir {
                let prefix = format!("{}/", from);
                let moved: Vec<String> =
                    dir.entries.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
                for key in moved {
                    let mut child = dir.entries.remove(&key).expect("key just listed");
                    let new_key = format!("{}/{}", to, &key[prefix.len()..]);
                    child.name = new_key.clone();
                    dir.entries.insert(new_key, child);
                }
            }

            entry.name = to.to_string();
            entry.kind = old.kind;
            entry.sequence = dir.next_sequence(user_of(to));
            dir.entries.insert(to.to_string(), entry.clone());

            let mut old_event = old;
            old_event.sequence = entry.sequence;
            (old_event, entry)
        };
        self.broadcast(WatchEvent { entry: old_event, delete: true, error: None });
        self.broadcast(WatchEvent { entry: new_event.clone(), delete: false, error: None });
        Ok(new_event)
    }

    pub fn set_time(&self, path: &str, mtime: u64) -> DirResult<DirEntry> {
        let event = {
            let mut dir = self.dir.lock();
            let seq = dir.next_sequence(user_of(path));
            let entry = match dir.entries.get_mut(path) {
                None => return Err(DirError::new("not-exist", path)),
                Some(e) => e,
            };
            entry.mtime = mtime;
            entry.sequence = seq;
            entry.clone()
        };
        self.broadcast(WatchEvent { entry: event.clone(), delete: false, error: None });
        Ok(event)
    }

    pub fn access(&self, path: &str, user: &str) -> AccessRights {
        let owner = user_of(path) == user;
        AccessRights { read: owner, write: owner, create: owner, delete: owner, list: owner }
    }

    pub fn current_sequence(&self, root: &str) -> i64 {
        *self.dir.lock().sequence.get(root).unwrap_or(&0)
    }

    // ---- block store ----

    pub fn put_block(&self, data: Bytes) -> String {
        let reference = hex::encode(Sha256::digest(&data));
        self.blocks.lock().insert(reference.clone(), data);
        reference
    }

    pub fn get_block(&self, reference: &str) -> Option<Bytes> {
        let data = self.blocks.lock().get(reference).cloned()?;
        *self.fetches.lock().entry(reference.to_string()).or_insert(0) += 1;
        Some(data)
    }

    /// How many times `reference` has been fetched; test instrumentation.
    pub fn fetch_count(&self, reference: &str) -> u64 {
        *self.fetches.lock().get(reference).unwrap_or(&0)
    }

    /// Total block fetches served; test instrumentation.
    pub fn total_fetches(&self) -> u64 {
        self.fetches.lock().values().sum()
    }

    // ---- key registry ----

    pub fn put_key(&self, record: UserKeyRecord) {
        self.keys.lock().insert(record.user.clone(), record);
    }

    pub fn get_key(&self, user: &str) -> Option<UserKeyRecord> {
        self.keys.lock().get(user).cloned()
    }

    // ---- watch ----

    pub fn subscribe(&self, root: &str) -> broadcast::Receiver<WatchEvent> {
        self.watchers
            .lock()
            .entry(root.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    fn broadcast(&self, event: WatchEvent) {
        let root = user_of(&event.entry.name).to_string();
        if let Some(tx) = self.watchers.lock().get(&root) {
            // No receivers is fine.
            let _ = tx.send(event);
        }
    }
}

pub fn direntry_for_root(root: &str) -> DirEntry {
    DirEntry {
        name: root.to_string(),
        writer: root.to_string(),
        kind: EntryKind::Dir,
        packing: crate::types::Packing::Plain,
        sequence: 0,
        mtime: now(),
        link: None,
        blocks: Vec::new(),
        packdata: String::new(),
        attr_mode: 0o700,
    }
}
