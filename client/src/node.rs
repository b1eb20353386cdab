//! The in-memory node: one live handle to a name in the mounted tree.
//!
//! Nodes are shared between the request surface and the watcher, so all
//! mutable state sits behind the node's own lock. Lock order is always
//! filesystem lock, then node lock, then cache lock; two nodes at once
//! (rename only) are taken in path order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use fuser::{FileAttr, FileType};
use parking_lot::{Mutex, MutexGuard};

use crate::cache::CachedFile;
use crate::proto::{DirEntry, EntryKind};
use crate::rpath;

pub const BLKSIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The mount root; a local fiction, nothing remote backs it.
    Root,
    /// A user's tree root, e.g. `ann@example.org`.
    UserRoot,
    /// Everything below a user root.
    Other,
}

pub struct Node {
    pub ino: u64,
    state: Mutex<NodeState>,
}

pub struct NodeState {
    pub kind: NodeKind,
    /// Absolute remote path; empty for the mount root.
    pub path: String,
    /// Owning user.
    pub user: String,
    pub file_type: FileType,
    pub perm: u16,
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub ctime: SystemTime,
    pub link_target: Option<String>,
    /// Sequence of the last remote version seen.
    pub sequence: i64,
    /// Open handle ids attached to this node.
    pub handles: HashSet<u64>,
    /// Attached cache file; a node with handles always has one (or is a
    /// directory/link, which carry no content).
    pub cf: Option<CachedFile>,
    /// The remote entry is gone; all further operations answer not-exist.
    pub deleted: bool,
    /// Writeback silently skips the remote put.
    pub no_writeback: bool,
    /// The watcher covers this node; pull refresh stays away.
    pub do_not_refresh: bool,
    /// Next pull-refresh deadline.
    pub refresh_at: Instant,
}

impl Node {
    pub fn new(
        ino: u64,
        kind: NodeKind,
        path: &str,
        file_type: FileType,
        perm: u16,
        size: u64,
        mtime: SystemTime,
    ) -> Arc<Node> {
        let user = rpath::user_of(path).to_string();
        Arc::new(Node {
            ino,
            state: Mutex::new(NodeState {
                kind,
                path: path.to_string(),
                user,
                file_type,
                perm,
                size,
                mtime,
                atime: mtime,
                ctime: mtime,
                link_target: None,
                sequence: 0,
                handles: HashSet::new(),
                cf: None,
                deleted: false,
                no_writeback: false,
                do_not_refresh: false,
                refresh_at: Instant::now(),
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }
}

impl NodeState {
    /// POSIX-facing attributes. Size comes from the attached cache file
    /// when there is one; the local copy defines the truth while open.
    pub fn attr(&self, ino: u64, uid: u32, gid: u32) -> FileAttr {
        let size = match &self.cf {
            Some(cf) => cf.len().unwrap_or(self.size),
            None => self.size,
        };
        FileAttr {
            ino,
            size,
            blocks: (size + 511) / 512,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.mtime,
            kind: self.file_type,
            perm: self.perm,
            nlink: if self.file_type == FileType::Directory { 2 } else { 1 },
            uid,
            gid,
            rdev: 0,
            flags: 0,
            blksize: BLKSIZE,
        }
    }

    /// Fold a remote entry's metadata into the node: size, kind bits,
    /// link target, time, sequence.
    pub fn absorb_entry(&mut self, entry: &DirEntry) {
        self.size = lstat_size(entry);
        self.file_type = file_type_of(entry);
        self.perm = default_perm(entry);
        self.link_target = entry.link.clone();
        self.mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(entry.mtime);
        self.sequence = entry.sequence;
    }
}

pub fn file_type_of(entry: &DirEntry) -> FileType {
    match entry.kind {
        EntryKind::Dir => FileType::Directory,
        EntryKind::Link => FileType::Symlink,
        EntryKind::File => FileType::RegularFile,
    }
}

pub fn default_perm(entry: &DirEntry) -> u16 {
    match entry.kind {
        EntryKind::Dir => 0o700,
        EntryKind::Link => 0o777,
        EntryKind::File => 0o600,
    }
}

/// The size stat reports for an entry: the payload size for regular
/// files, the length of the host-relative link rendering for symlinks.
pub fn lstat_size(entry: &DirEntry) -> u64 {
    match (&entry.kind, &entry.link) {
        (EntryKind::Link, Some(target)) => rpath::link_size(&entry.name, target),
        _ => entry.size(),
    }
}
