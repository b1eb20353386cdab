use super::prelude::*;

fn node_for(fs: &Arc<RemoteFs>, ino: u64, fh: u64, op: &'static str) -> Result<Arc<Node>> {
    fs.handle(fh)
        .or_else(|| fs.node_by_ino(ino))
        .ok_or_else(|| Error::new(op, "", Kind::NotExist))
}

/// Write `data` at `offset` through the cache engine; grows the declared
/// size and bumps mtime. In write-through mode every write is pushed
/// remotely before returning.
pub fn write(fs: &Arc<RemoteFs>, ino: u64, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
    let node = node_for(fs, ino, fh, "write")?;
    {
        let mut st = node.lock();
        if st.deleted {
            return Err(Error::new("write", &st.path, Kind::NotExist));
        }
        let path = st.path.clone();
        let cf = st
            .cf
            .as_mut()
            .ok_or_else(|| Error::new("write", &path, Kind::Io).with_detail("no cache file"))?;
        let n = fs.block_on(fs.cache.write(&fs.client, cf, data, offset))?;
        let end = offset + n as u64;
        if end > st.size {
            st.size = end;
        }
        st.mtime = SystemTime::now();
    }
    if fs.config.write_through {
        writeback_node(fs, &node)?;
    }
    Ok(data.len() as u32)
}

/// Push a node's dirty content to the remote. Failures on `._` attribute
/// shadow files do not surface; their cache file is pinned so the bytes
/// survive in-process. That is a host-integration compatibility hack, not
/// a policy.
pub fn writeback_node(fs: &Arc<RemoteFs>, node: &Arc<Node>) -> Result<()> {
    let mut st = node.lock();
    let path = st.path.clone();
    let no_writeback = st.no_writeback;
    let mtime = st
        .mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let Some(cf) = st.cf.as_mut() else { return Ok(()) };

    match fs.block_on(fs.cache.writeback(&fs.client, &path, cf, no_writeback, mtime)) {
        Ok(Some(entry)) => {
            st.sequence = entry.sequence;
            st.mtime = UNIX_EPOCH + Duration::from_secs(entry.mtime);
            drop(st);
            fs.dircache.drop_parent_of(&path);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            if rpath::base(&path).starts_with("._") {
                fs.cache.pin(cf.fname());
                tracing::debug!(path = %path, error = %e, "pinned shadow file after failed writeback");
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

/// Flush: push dirty bytes now; the handle stays open.
pub fn flush(fs: &Arc<RemoteFs>, ino: u64, fh: u64) -> Result<()> {
    let node = node_for(fs, ino, fh, "flush")?;
    writeback_node(fs, &node)
}

/// Release: final writeback, free the handle, and on last close move the
/// backing file into the closed-file LRU.
pub fn release(fs: &Arc<RemoteFs>, ino: u64, fh: u64) -> Result<()> {
    let node = {
        let mut maps = fs.lock_maps();
        maps.handles.remove(&fh).map(|h| h.node)
    }
    .or_else(|| fs.node_by_ino(ino));
    let Some(node) = node else { return Ok(()) };

    let result = writeback_node(fs, &node);

    let mut st = node.lock();
    st.handles.remove(&fh);
    if st.handles.is_empty() {
        if let Some(cf) = st.cf.take() {
            fs.cache.close(cf);
        }
    }
    result
}
