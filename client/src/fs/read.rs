use super::prelude::*;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Resolve `name` under the directory `parent`. Host attribute shadow
/// names (`._*`) are short-circuited; negative results are remembered in
/// the enoent map with an expiry that depends on watch support.
pub fn lookup(fs: &Arc<RemoteFs>, parent: u64, name: &str) -> Result<FileAttr> {
    if name.starts_with("._") {
        // Shadow metadata files the host keeps probing for; never remote.
        return Err(Error::new("lookup", name, Kind::NotExist));
    }
    let pnode = fs
        .node_by_ino(parent)
        .ok_or_else(|| Error::new("lookup", name, Kind::NotExist))?;
    let parent_path = pnode.lock().path.clone();

    if parent == ROOT_INO && !name.contains('@') {
        // Only user roots live at the top of the tree.
        return Err(Error::new("lookup", name, Kind::NotExist));
    }
    let path = rpath::join(&parent_path, name);
    lookup_path(fs, &path)
}

/// The path-level half of lookup, also used by the mount preload.
pub fn lookup_path(fs: &Arc<RemoteFs>, path: &str) -> Result<FileAttr> {
    if fs.enoent_active(path) {
        return Err(Error::new("lookup", path, Kind::NotExist));
    }

    if let Some(node) = fs.node_by_path(path) {
        {
            let st = node.lock();
            if st.deleted {
                return Err(Error::new("lookup", path, Kind::NotExist));
            }
        }
        watcher::refresh(fs, &node)?;
        return Ok(node.lock().attr(node.ino, fs.uid, fs.gid));
    }

    match fs.block_on(fs.client.lookup(path)) {
        Ok(LookupOutcome::Entry(entry)) => Ok(node_from_entry(fs, path, &entry)),
        Ok(LookupOutcome::FollowLink(entry)) if entry.name == path => {
            // The looked-up name is itself a link; hand it to the kernel
            // as one and let it resolve.
            Ok(node_from_entry(fs, path, &entry))
        }
        Ok(LookupOutcome::FollowLink(_)) => {
            fs.does_not_exist(path);
            Err(Error::new("lookup", path, Kind::NotExist))
        }
        Err(e) if e.kind == Kind::Private => {
            // Fake a directory so a deeper path can keep resolving; the
            // access policy will speak up at the leaves.
            let ino = fs.alloc_ino();
            let kind = root_kind(path);
            let node = Node::new(ino, kind, path, FileType::Directory, 0o700, 0, SystemTime::now());
            fs.exists(&node);
            let attr = node.lock().attr(ino, fs.uid, fs.gid);
            Ok(attr)
        }
        Err(e) => {
            fs.does_not_exist(path);
            Err(e)
        }
    }
}

fn root_kind(path: &str) -> NodeKind {
    if rpath::is_user_root(path) {
        NodeKind::UserRoot
    } else {
        NodeKind::Other
    }
}

fn node_from_entry(fs: &Arc<RemoteFs>, path: &str, entry: &DirEntry) -> FileAttr {
    let ino = fs.alloc_ino();
    let node = Node::new(
        ino,
        root_kind(path),
        path,
        node::file_type_of(entry),
        node::default_perm(entry),
        0,
        SystemTime::now(),
    );
    node.lock().absorb_entry(entry);
    fs.exists(&node);
    let attr = node.lock().attr(ino, fs.uid, fs.gid);
    attr
}

/// Open an inode. The first open of a node fetches its content into the
/// cache while holding the node lock, which is deliberate: a second open
/// of the same file serializes behind the fetch instead of duplicating it.
pub fn open(fs: &Arc<RemoteFs>, ino: u64, flags: i32) -> Result<u64> {
    let node = fs
        .node_by_ino(ino)
        .ok_or_else(|| Error::new("open", "", Kind::NotExist))?;
    watcher::refresh(fs, &node)?;

    let write_intent = flags & libc::O_ACCMODE != libc::O_RDONLY;
    let mut st = node.lock();
    if st.deleted {
        return Err(Error::new("open", &st.path, Kind::NotExist));
    }

    if st.file_type == FileType::Directory {
        if write_intent {
            return Err(Error::new("open", &st.path, Kind::IsDir));
        }
        let fh = fs.alloc_fh();
        st.handles.insert(fh);
        drop(st);
        fs.lock_maps().handles.insert(fh, Handle { node, flags });
        return Ok(fh);
    }

    if write_intent {
        let rights = fs.block_on(fs.client.which_access(&st.path))?;
        if !rights.write {
            return Err(Error::new("open", &st.path, Kind::Permission));
        }
    }

    if st.cf.is_none() {
        let entry = match fs.block_on(fs.client.lookup(&st.path))? {
            LookupOutcome::Entry(e) => e,
            LookupOutcome::FollowLink(e) if e.name == st.path => e,
            LookupOutcome::FollowLink(_) => {
                return Err(Error::new("open", &st.path, Kind::NotExist))
            }
        };
        let cf = fs.block_on(fs.cache.open(&fs.client, &entry))?;
        st.size = cf.len()?;
        st.sequence = entry.sequence;
        st.cf = Some(cf);
        // A stale prior version may still sit in the kernel's page cache.
        fs.queue_invalidation(ino);
    }

    if flags & libc::O_TRUNC != 0 {
        if let Some(cf) = st.cf.as_mut() {
            fs.block_on(fs.cache.truncate(&fs.client, cf, 0))?;
            st.size = 0;
            st.mtime = SystemTime::now();
        }
    }

    let fh = fs.alloc_fh();
    st.handles.insert(fh);
    drop(st);
    fs.lock_maps().handles.insert(fh, Handle { node, flags });
    Ok(fh)
}

/// Read `size` bytes at `offset`, demand-loading any blocks the range
/// touches. Short reads past end are EOF.
pub fn read(fs: &Arc<RemoteFs>, ino: u64, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
    let node = fs
        .handle(fh)
        .or_else(|| fs.node_by_ino(ino))
        .ok_or_else(|| Error::new("read", "", Kind::NotExist))?;
    let mut st = node.lock();
    if st.deleted {
        return Err(Error::new("read", &st.path, Kind::NotExist));
    }
    if st.file_type == FileType::Directory {
        return Err(Error::new("read", &st.path, Kind::IsDir));
    }
    let path = st.path.clone();
    let cf = st
        .cf
        .as_mut()
        .ok_or_else(|| Error::new("read", &path, Kind::Io).with_detail("no cache file"))?;
    let mut buf = vec![0u8; size];
    let n = fs.block_on(fs.cache.read(&fs.client, cf, &mut buf, offset))?;
    buf.truncate(n);
    Ok(buf)
}

/// Directory listing. The mount root lists the user roots it has seen;
/// everything else lists through the remote with a short-TTL cache.
pub fn readdir(fs: &Arc<RemoteFs>, ino: u64) -> Result<Vec<(u64, FileType, String)>> {
    let node = fs
        .node_by_ino(ino)
        .ok_or_else(|| Error::new("readdir", "", Kind::NotExist))?;
    let (path, file_type, deleted) = {
        let st = node.lock();
        (st.path.clone(), st.file_type, st.deleted)
    };
    if deleted {
        return Err(Error::new("readdir", &path, Kind::NotExist));
    }
    if file_type != FileType::Directory {
        return Err(Error::new("readdir", &path, Kind::NotDir));
    }

    let mut out = vec![(ino, FileType::Directory, ".".to_string())];
    let parent_ino = rpath::parent(&path)
        .and_then(|p| fs.node_by_path(p))
        .map_or(ROOT_INO, |n| n.ino);
    out.push((parent_ino, FileType::Directory, "..".to_string()));

    if ino == ROOT_INO {
        // The root is a local fiction: user trees appear as they are
        // looked up, nothing is listed remotely.
        let maps = fs.lock_maps();
        let mut roots: Vec<(u64, FileType, String)> = maps
            .nodes
            .iter()
            .filter(|(_, n)| n.lock().kind == NodeKind::UserRoot)
            .map(|(p, n)| (n.ino, FileType::Directory, p.clone()))
            .collect();
        drop(maps);
        roots.sort_by(|a, b| a.2.cmp(&b.2));
        out.extend(roots);
        return Ok(out);
    }

    let listing = match fs.dircache.get(&path) {
        Some(entries) => entries,
        None => {
            let entries = fs.block_on(fs.client.list(&path))?;
            fs.dircache.put(&path, entries.clone());
            entries
        }
    };
    for entry in listing {
        let name = rpath::base(&entry.name).to_string();
        let child_ino = fs
            .node_by_path(&entry.name)
            .map_or_else(|| placeholder_ino(&entry.name), |n| n.ino);
        out.push((child_ino, node::file_type_of(&entry), name));
    }
    Ok(out)
}

/// Readdir needs an inode number for names nothing has looked up yet; a
/// stable hash with the high bit set stays clear of allocated inodes.
fn placeholder_ino(path: &str) -> u64 {
    let mut h = DefaultHasher::new();
    path.hash(&mut h);
    h.finish() | (1 << 63)
}
