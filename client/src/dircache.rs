//! Short-lived directory listing cache behind readdir.
//!
//! Listings go stale the moment anything in the directory changes, so
//! every local mutation and every watch event drops the affected entry.
//! The TTL only bounds staleness against foreign writers on servers
//! without change notification.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::proto::DirEntry;
use crate::rpath;

pub struct DirCache {
    ttl: Duration,
    inner: Mutex<HashMap<String, (Instant, Vec<DirEntry>)>>,
}

impl DirCache {
    pub fn new(ttl: Duration) -> Self {
        DirCache { ttl, inner: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, path: &str) -> Option<Vec<DirEntry>> {
        let mut inner = self.inner.lock();
        match inner.get(path) {
            Some((stored, entries)) if stored.elapsed() < self.ttl => Some(entries.clone()),
            Some(_) => {
                inner.remove(path);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, path: &str, entries: Vec<DirEntry>) {
        self.inner.lock().insert(path.to_string(), (Instant::now(), entries));
    }

    /// Drop a directory's listing.
    pub fn drop_dir(&self, path: &str) {
        self.inner.lock().remove(path);
    }

    /// Drop the listing of the directory containing `path`.
    pub fn drop_parent_of(&self, path: &str) {
        if let Some(parent) = rpath::parent(path) {
            self.inner.lock().remove(parent);
        }
    }
}
