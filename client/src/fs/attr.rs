use super::prelude::*;

/// Attributes for an inode. Deleted nodes answer not-exist; everything
/// else gets a pull refresh first (a no-op while the watcher covers the
/// node) so attributes from servers without notification stay honest.
pub fn getattr(fs: &Arc<RemoteFs>, ino: u64) -> Result<FileAttr> {
    let node = fs
        .node_by_ino(ino)
        .ok_or_else(|| Error::new("getattr", "", Kind::NotExist))?;
    if ino != ROOT_INO {
        {
            let st = node.lock();
            if st.deleted {
                return Err(Error::new("getattr", &st.path, Kind::NotExist));
            }
        }
        watcher::refresh(fs, &node)?;
    }
    let attr = node.lock().attr(ino, fs.uid, fs.gid);
    Ok(attr)
}

/// Access check. Rights are delegated to the remote access policy, so the
/// only local answers are "gone" and "fine"; the refresh keeps the node
/// honest on pull-mode servers.
pub fn access(fs: &Arc<RemoteFs>, ino: u64) -> Result<()> {
    let node = fs
        .node_by_ino(ino)
        .ok_or_else(|| Error::new("access", "", Kind::NotExist))?;
    if ino == ROOT_INO {
        return Ok(());
    }
    {
        let st = node.lock();
        if st.deleted {
            return Err(Error::new("access", &st.path, Kind::NotExist));
        }
    }
    watcher::refresh(fs, &node)?;
    Ok(())
}

/// Attribute changes. Size changes run through the cache engine; mtime
/// changes flush first and then set the time remotely; mode changes are
/// accepted and ignored.
pub fn setattr(
    fs: &Arc<RemoteFs>,
    ino: u64,
    size: Option<u64>,
    mtime: Option<SystemTime>,
    _fh: Option<u64>,
) -> Result<FileAttr> {
    let node = fs
        .node_by_ino(ino)
        .ok_or_else(|| Error::new("setattr", "", Kind::NotExist))?;
    {
        let st = node.lock();
        if st.deleted {
            return Err(Error::new("setattr", &st.path, Kind::NotExist));
        }
    }

    if let Some(new_size) = size {
        truncate_node(fs, &node, new_size)?;
    }

    if let Some(t) = mtime {
        // Flush pending bytes so the remote entry exists before set-time.
        super::write::writeback_node(fs, &node)?;
        let path = node.lock().path.clone();
        let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let entry = fs.block_on(fs.client.set_time(&path, secs))?;
        let mut st = node.lock();
        st.mtime = t;
        st.sequence = entry.sequence;
    }

    let attr = node.lock().attr(ino, fs.uid, fs.gid);
    Ok(attr)
}

/// The three truncate shapes: through an attached cache file when the
/// node is open; "create empty" for a closed node going to zero; and
/// open-truncate-release for a closed node going to a non-zero size.
fn truncate_node(fs: &Arc<RemoteFs>, node: &Arc<Node>, size: u64) -> Result<()> {
    {
        let mut st = node.lock();
        if st.file_type == FileType::Directory {
            return Err(Error::new("truncate", &st.path, Kind::IsDir));
        }
        if let Some(cf) = st.cf.as_mut() {
            fs.block_on(fs.cache.truncate(&fs.client, cf, size))?;
            st.size = size;
            st.mtime = SystemTime::now();
            return Ok(());
        }
        if size == 0 {
            let cf = fs.cache.create()?;
            st.cf = Some(cf);
            st.size = 0;
            st.mtime = SystemTime::now();
        }
    }

    if size == 0 {
        super::write::writeback_node(fs, node)?;
        let mut st = node.lock();
        if st.handles.is_empty() {
            if let Some(cf) = st.cf.take() {
                fs.cache.close(cf);
            }
        }
        return Ok(());
    }

    // Closed and non-zero: materialize, cut, push, close.
    let path = node.lock().path.clone();
    let entry = match fs.block_on(fs.client.lookup(&path))? {
        LookupOutcome::Entry(e) => e,
        LookupOutcome::FollowLink(e) => e,
    };
    let cf = fs.block_on(fs.cache.open(&fs.client, &entry))?;
    {
        let mut st = node.lock();
        st.cf = Some(cf);
        if let Some(cf) = st.cf.as_mut() {
            fs.block_on(fs.cache.truncate(&fs.client, cf, size))?;
        }
        st.size = size;
        st.mtime = SystemTime::now();
        st.sequence = entry.sequence;
    }
    super::write::writeback_node(fs, node)?;
    let mut st = node.lock();
    if st.handles.is_empty() {
        if let Some(cf) = st.cf.take() {
            fs.cache.close(cf);
        }
    }
    Ok(())
}
