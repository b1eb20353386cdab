//! The mounted filesystem: node graph, handle table and request surface.
//!
//! `RemoteFs` holds everything the request surface needs: the path→node
//! and inode→node maps, the enoent map of cached negative lookups, the
//! handle table, the watcher registry, the cache engine and the runtime
//! the remote calls run on. The `impl Filesystem` block at the bottom is a
//! thin dispatcher: every FUSE call is forwarded to the matching function
//! in a sub-module (`attr`, `read`, `write`, ...), which does the work and
//! returns a `Result`; errno conversion happens only here.
//!
//! Lock order: filesystem lock, then node lock, then cache lock. Nothing
//! may take the filesystem lock while holding a node lock.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::api_client::ApiClient;
use crate::cache::Cache;
use crate::config::Config;
use crate::dircache::DirCache;
use crate::error::{Error, Result};
use crate::keys::Factotum;
use crate::node::{Node, NodeKind};
use crate::rpath;
use crate::watcher::{self, WatchedRoot};

pub mod prelude;

pub mod attr;
pub mod create;
pub mod delete;
pub mod link;
pub mod read;
pub mod rename;
pub mod write;
pub mod xattr;

/// How long a negative lookup holds when the user's directory streams
/// change notifications; the notification will clear it earlier if the
/// name appears.
pub const ENOENT_LONG: Duration = Duration::from_secs(3600);
/// Negative-lookup lifetime without notification support.
pub const ENOENT_SHORT: Duration = Duration::from_secs(5);
/// Pull-refresh scheduling after an error and after a clean refresh.
pub const REFRESH_SHORT: Duration = Duration::from_secs(5);
pub const REFRESH_LONG: Duration = Duration::from_secs(60);
/// Root inode, fixed by the kernel transport.
pub const ROOT_INO: u64 = 1;

/// Kernel-side cache invalidation. The mount wires this to the FUSE
/// notifier; tests plug in a recorder. Calls arrive from a dedicated
/// thread that holds no filesystem or node locks.
pub trait Invalidator: Send + Sync {
    fn invalidate_attr(&self, ino: u64);
    fn invalidate_data(&self, ino: u64);
}

/// Default sink before a real notifier is attached.
pub struct NoopInvalidator;

impl Invalidator for NoopInvalidator {
    fn invalidate_attr(&self, _ino: u64) {}
    fn invalidate_data(&self, _ino: u64) {}
}

/// An open instance of a node.
pub struct Handle {
    pub node: Arc<Node>,
    pub flags: i32,
}

/// Everything guarded by the filesystem-wide lock.
pub struct FsMaps {
    /// path → node for all live nodes; at most one node per path.
    pub nodes: HashMap<String, Arc<Node>>,
    /// inode → node for everything the kernel may still reference.
    pub inodes: HashMap<u64, Arc<Node>>,
    /// Open handles by id.
    pub handles: HashMap<u64, Handle>,
    /// path → expiry of cached negative lookups.
    pub enoent: HashMap<String, Instant>,
    /// user → watch subscription state.
    pub watched: HashMap<String, WatchedRoot>,
}

pub struct RemoteFs {
    pub config: Config,
    pub runtime: tokio::runtime::Runtime,
    pub client: Arc<ApiClient>,
    pub cache: Arc<Cache>,
    pub dircache: DirCache,
    pub mountpoint: PathBuf,
    maps: Mutex<FsMaps>,
    next_ino: AtomicU64,
    next_fh: AtomicU64,
    invalidator: RwLock<Arc<dyn Invalidator>>,
    inval_tx: std::sync::mpsc::Sender<u64>,
    pub uid: u32,
    pub gid: u32,
}

impl RemoteFs {
    pub fn new(config: Config, mountpoint: &Path) -> Result<Arc<RemoteFs>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::io("init", "", e))?;

        let factotum = Arc::new(match &config.secrets {
            Some(path) => Factotum::load_or_create(path)?,
            None => Factotum::generate(),
        });
        let client = Arc::new(ApiClient::new(
            &config.server_url,
            &config.user,
            factotum,
            config.block_size,
        )?);
        let cache_root = config.cache_dir.join(&config.user).join("fscache");
        let cache = Arc::new(Cache::new(&cache_root, config.cache_size)?);

        let root = Node::new(
            ROOT_INO,
            NodeKind::Root,
            "",
            FileType::Directory,
            0o755,
            0,
            SystemTime::now(),
        );
        let mut nodes = HashMap::new();
        let mut inodes = HashMap::new();
        nodes.insert(String::new(), root.clone());
        inodes.insert(ROOT_INO, root);

        let (inval_tx, inval_rx) = std::sync::mpsc::channel::<u64>();
        let dircache = DirCache::new(Duration::from_secs(config.dircache_ttl_seconds));
        let fs = Arc::new(RemoteFs {
            config,
            runtime,
            client,
            cache,
            dircache,
            mountpoint: mountpoint.to_path_buf(),
            maps: Mutex::new(FsMaps {
                nodes,
                inodes,
                handles: HashMap::new(),
                enoent: HashMap::new(),
                watched: HashMap::new(),
            }),
            next_ino: AtomicU64::new(2),
            next_fh: AtomicU64::new(1),
            invalidator: RwLock::new(Arc::new(NoopInvalidator)),
            inval_tx,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        });

        // Invalidations re-enter the kernel, so they are emitted from
        // their own thread, never under a lock.
        let emitter = Arc::downgrade(&fs);
        std::thread::spawn(move || {
            while let Ok(ino) = inval_rx.recv() {
                let Some(fs) = emitter.upgrade() else { break };
                let inv = fs.invalidator.read().clone();
                inv.invalidate_attr(ino);
                inv.invalidate_data(ino);
            }
        });

        Ok(fs)
    }

    /// Register with the key server and pre-stat the owner's roots so the
    /// watcher is live before the first kernel request.
    pub fn startup(self: &Arc<Self>) {
        if let Err(e) = self.block_on(self.client.register_key()) {
            tracing::warn!(error = %e, "key registration failed");
        }
        let owner = self.config.user.clone();
        if let Err(e) = read::lookup_path(self, &owner) {
            tracing::warn!(user = %owner, error = %e, "owner root preload failed");
        }
        if let Some(snap) = rpath::snapshot_user(&owner) {
            if let Err(e) = read::lookup_path(self, &snap) {
                tracing::debug!(user = %snap, error = %e, "snapshot root not present");
            }
        }
    }

    pub fn set_invalidator(&self, inv: Arc<dyn Invalidator>) {
        *self.invalidator.write() = inv;
    }

    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    pub fn lock_maps(&self) -> MutexGuard<'_, FsMaps> {
        self.maps.lock()
    }

    pub fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    pub fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    pub fn node_by_ino(&self, ino: u64) -> Option<Arc<Node>> {
        self.maps.lock().inodes.get(&ino).cloned()
    }

    pub fn node_by_path(&self, path: &str) -> Option<Arc<Node>> {
        self.maps.lock().nodes.get(path).cloned()
    }

    pub fn handle(&self, fh: u64) -> Option<Arc<Node>> {
        self.maps.lock().handles.get(&fh).map(|h| h.node.clone())
    }

    /// Every applied mutation queues exactly one invalidation for the
    /// affected node.
    pub fn queue_invalidation(&self, ino: u64) {
        let _ = self.inval_tx.send(ino);
    }

    /// What we currently believe about watch support for `user`'s
    /// directory server. None until the watcher has found out.
    pub fn watch_supported(&self, user: &str) -> Option<bool> {
        self.maps.lock().watched.get(user).and_then(|w| w.supported)
    }

    fn enoent_expiry(&self, maps: &FsMaps, path: &str) -> Instant {
        let user = rpath::user_of(path);
        let long = matches!(
            maps.watched.get(user).and_then(|w| w.supported),
            Some(true)
        );
        Instant::now() + if long { ENOENT_LONG } else { ENOENT_SHORT }
    }

    /// Is `path` currently known not to exist?
    pub fn enoent_active(&self, path: &str) -> bool {
        let mut maps = self.maps.lock();
        match maps.enoent.get(path) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                maps.enoent.remove(path);
                false
            }
            None => false,
        }
    }

    /// The name exists: bind it in the path map, clear negative entries
    /// for it and its parent, and make sure its user is watched.
    ///
    /// Caller must not hold the node's lock.
    pub fn exists(self: &Arc<Self>, node: &Arc<Node>) {
        let path = {
            let mut st = node.lock();
            st.deleted = false;
            st.path.clone()
        };
        let mut maps = self.maps.lock();
        maps.enoent.remove(&path);
        if let Some(parent) = rpath::parent(&path) {
            maps.enoent.remove(parent);
        }
        maps.inodes.insert(node.ino, node.clone());
        let prev = maps.nodes.insert(path.clone(), node.clone());
        let is_new = match prev {
            Some(old) => {
                if !Arc::ptr_eq(&old, node) {
                    // The displaced node floats until the kernel forgets it.
                    watcher::detach_watch(self, &mut maps, rpath::user_of(&path));
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        if is_new {
            let user = rpath::user_of(&path).to_string();
            if user.contains('@') {
                watcher::attach_watch(self, &mut maps, &user);
            }
        }
    }

    /// The name does not exist: record the negative entry and drop any
    /// node mapped there.
    ///
    /// Caller must not hold any node lock.
    pub fn does_not_exist(self: &Arc<Self>, path: &str) {
        let mut maps = self.maps.lock();
        let expiry = self.enoent_expiry(&maps, path);
        maps.enoent.insert(path.to_string(), expiry);
        if let Some(node) = maps.nodes.remove(path) {
            watcher::detach_watch(self, &mut maps, rpath::user_of(path));
            drop(maps);
            node.lock().deleted = true;
        }
    }

    /// Unbind `path` without recording a negative entry (the next open
    /// should re-fetch, e.g. after a watch event for a clean cached node).
    pub fn unmap(self: &Arc<Self>, path: &str, node: &Arc<Node>) {
        let mut maps = self.maps.lock();
        if let Some(current) = maps.nodes.get(path) {
            if Arc::ptr_eq(current, node) {
                maps.nodes.remove(path);
                watcher::detach_watch(self, &mut maps, rpath::user_of(path));
            }
        }
    }

    /// Kernel dropped its reference: remove the bindings. The node object
    /// survives only while a handle still holds it.
    pub fn forget_node(self: &Arc<Self>, ino: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut maps = self.maps.lock();
        let Some(node) = maps.inodes.remove(&ino) else { return };
        let path = node.lock().path.clone();
        if let Some(current) = maps.nodes.get(&path) {
            if Arc::ptr_eq(current, &node) {
                maps.nodes.remove(&path);
                watcher::detach_watch(self, &mut maps, rpath::user_of(&path));
            }
        }
    }

    /// Acquire two nodes' locks in path order; same node yields one guard.
    pub fn lock_pair<'a>(
        a: &'a Arc<Node>,
        a_path: &str,
        b: &'a Arc<Node>,
        b_path: &str,
    ) -> (MutexGuard<'a, crate::node::NodeState>, Option<MutexGuard<'a, crate::node::NodeState>>) {
        if Arc::ptr_eq(a, b) || a_path == b_path {
            (a.lock(), None)
        } else if a_path < b_path {
            let ga = a.lock();
            let gb = b.lock();
            (ga, Some(gb))
        } else {
            let gb = b.lock();
            let ga = a.lock();
            (ga, Some(gb))
        }
    }
}

/// The fuser-facing wrapper; every callback dispatches into an op module
/// and converts the error kind to an errno.
pub struct FsDispatch(pub Arc<RemoteFs>);

fn reply_err(e: &Error) -> i32 {
    tracing::debug!(op = e.op, path = %e.path, kind = e.kind.as_str(), detail = %e.detail, "request failed");
    e.errno()
}

fn name_str(name: &OsStr) -> Option<&str> {
    name.to_str()
}

impl Filesystem for FsDispatch {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        tracing::info!(mountpoint = %self.0.mountpoint.display(), "filesystem ready");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("filesystem shutting down");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name_str(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match read::lookup(&self.0, parent, name) {
            Ok(attr) => reply.entry(&self.0.config.kernel_ttl(), &attr, 0),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        self.0.forget_node(ino);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match attr::getattr(&self.0, ino) {
            Ok(attr) => reply.attr(&self.0.config.kernel_ttl(), &attr),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mtime = mtime.map(|t| match t {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => SystemTime::now(),
        });
        match attr::setattr(&self.0, ino, size, mtime, fh) {
            Ok(attr) => reply.attr(&self.0.config.kernel_ttl(), &attr),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match link::readlink(&self.0, ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match create::mknod(&self.0, parent, name, mode) {
            Ok(attr) => reply.entry(&self.0.config.kernel_ttl(), &attr, 0),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match create::mkdir(&self.0, parent, name) {
            Ok(attr) => reply.entry(&self.0.config.kernel_ttl(), &attr, 0),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name_str(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match delete::unlink(&self.0, parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name_str(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match delete::rmdir(&self.0, parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(name) = name_str(link_name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match link::symlink(&self.0, parent, name, target) {
            Ok(attr) => reply.entry(&self.0.config.kernel_ttl(), &attr, 0),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name_str(name), name_str(newname)) else {
            reply.error(libc::ENOENT);
            return;
        };
        match rename::rename(&self.0, parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // Hard links have no remote representation.
        reply.error(libc::ENOSYS);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match read::open(&self.0, ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match read::read(&self.0, ino, fh, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match write::write(&self.0, ino, fh, offset.max(0) as u64, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match write::flush(&self.0, ino, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match write::release(&self.0, ino, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match write::flush(&self.0, ino, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match read::readdir(&self.0, ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(reply_err(&e));
                return;
            }
        };
        for (i, (child_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        // The remote side has no quota worth reporting; fabricate room.
        reply.statfs(1 << 32, 1 << 31, 1 << 31, 1 << 20, 1 << 20, crate::node::BLKSIZE, 255, crate::node::BLKSIZE);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        xattr::setxattr(reply);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        xattr::getxattr(reply);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        xattr::listxattr(size, reply);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        xattr::removexattr(reply);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match attr::access(&self.0, ino) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name_str(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match create::create(&self.0, parent, name, mode, flags) {
            Ok((attr, fh)) => reply.created(&self.0.config.kernel_ttl(), &attr, 0, fh, 0),
            Err(e) => reply.error(reply_err(&e)),
        }
    }
}
