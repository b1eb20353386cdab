use super::prelude::*;

fn parent_path_of(fs: &Arc<RemoteFs>, parent: u64, op: &'static str) -> Result<String> {
    if parent == ROOT_INO {
        // User roots are implied; nothing is created at the top level.
        return Err(Error::new(op, "", Kind::Permission)
            .with_detail("the root holds only user trees"));
    }
    let pnode = fs
        .node_by_ino(parent)
        .ok_or_else(|| Error::new(op, "", Kind::NotExist))?;
    let st = pnode.lock();
    if st.deleted {
        return Err(Error::new(op, &st.path, Kind::NotExist));
    }
    Ok(st.path.clone())
}

/// Create a file: a fresh dirty cache file attached to a fresh node, with
/// an open handle. Nothing goes remote until writeback.
pub fn create(
    fs: &Arc<RemoteFs>,
    parent: u64,
    name: &str,
    mode: u32,
    flags: i32,
) -> Result<(FileAttr, u64)> {
    let parent_path = parent_path_of(fs, parent, "create")?;
    let path = rpath::join(&parent_path, name);

    let rights = fs.block_on(fs.client.which_access(&path))?;
    if !rights.create {
        return Err(Error::new("create", &path, Kind::Permission));
    }

    let ino = fs.alloc_ino();
    let node = Node::new(
        ino,
        NodeKind::Other,
        &path,
        FileType::RegularFile,
        (mode & 0o7777) as u16,
        0,
        SystemTime::now(),
    );
    let cf = fs.cache.create()?;
    let fh = fs.alloc_fh();
    {
        let mut st = node.lock();
        st.cf = Some(cf);
        st.handles.insert(fh);
    }
    fs.exists(&node);
    fs.lock_maps().handles.insert(fh, Handle { node: node.clone(), flags });
    fs.dircache.drop_dir(&parent_path);

    let attr = node.lock().attr(ino, fs.uid, fs.gid);
    Ok((attr, fh))
}

/// Make a directory remotely, then map it.
pub fn mkdir(fs: &Arc<RemoteFs>, parent: u64, name: &str) -> Result<FileAttr> {
    let parent_path = parent_path_of(fs, parent, "mkdir")?;
    let path = rpath::join(&parent_path, name);

    let rights = fs.block_on(fs.client.which_access(&path))?;
    if !rights.create {
        return Err(Error::new("mkdir", &path, Kind::Permission));
    }

    let entry = fs.block_on(fs.client.make_directory(&path))?;
    let ino = fs.alloc_ino();
    let node = Node::new(
        ino,
        NodeKind::Other,
        &path,
        FileType::Directory,
        0o700,
        0,
        SystemTime::now(),
    );
    node.lock().absorb_entry(&entry);
    fs.exists(&node);
    fs.dircache.drop_dir(&parent_path);
    let attr = node.lock().attr(ino, fs.uid, fs.gid);
    Ok(attr)
}

/// Mknod is create-without-handle: the empty file goes remote at once so
/// the entry exists even though nothing will flush it later.
pub fn mknod(fs: &Arc<RemoteFs>, parent: u64, name: &str, mode: u32) -> Result<FileAttr> {
    let parent_path = parent_path_of(fs, parent, "mknod")?;
    let path = rpath::join(&parent_path, name);

    let rights = fs.block_on(fs.client.which_access(&path))?;
    if !rights.create {
        return Err(Error::new("mknod", &path, Kind::Permission));
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let entry = fs.block_on(fs.client.put(&path, &[], now))?;
    let ino = fs.alloc_ino();
    let node = Node::new(
        ino,
        NodeKind::Other,
        &path,
        FileType::RegularFile,
        (mode & 0o7777) as u16,
        0,
        SystemTime::now(),
    );
    node.lock().absorb_entry(&entry);
    fs.exists(&node);
    fs.dircache.drop_dir(&parent_path);
    let attr = node.lock().attr(ino, fs.uid, fs.gid);
    Ok(attr)
}
