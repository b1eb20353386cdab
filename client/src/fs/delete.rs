use super::prelude::*;

/// Shared removal path. The entry is looked up first so a kind mismatch
/// (rmdir of a file, unlink of a directory) is rejected before the remote
/// delete runs.
fn remove(fs: &Arc<RemoteFs>, parent: u64, name: &str, want_dir: bool, op: &'static str) -> Result<()> {
    let pnode = fs
        .node_by_ino(parent)
        .ok_or_else(|| Error::new(op, "", Kind::NotExist))?;
    let parent_path = pnode.lock().path.clone();
    let path = rpath::join(&parent_path, name);

    let entry = match fs.block_on(fs.client.lookup(&path))? {
        LookupOutcome::Entry(e) => e,
        LookupOutcome::FollowLink(e) => e,
    };
    let is_dir = entry.kind == EntryKind::Dir;
    if want_dir && !is_dir {
        return Err(Error::new(op, &path, Kind::NotDir));
    }
    if !want_dir && is_dir {
        return Err(Error::new(op, &path, Kind::IsDir));
    }

    fs.block_on(fs.client.delete(&path))?;

    // Anything we still hold for the name must neither write back nor
    // answer again.
    if let Some(node) = fs.node_by_path(&path) {
        node.lock().no_writeback = true;
    }
    fs.does_not_exist(&path);
    fs.dircache.drop_dir(&parent_path);
    if is_dir {
        fs.dircache.drop_dir(&path);
    }
    Ok(())
}

pub fn unlink(fs: &Arc<RemoteFs>, parent: u64, name: &str) -> Result<()> {
    remove(fs, parent, name, false, "unlink")
}

pub fn rmdir(fs: &Arc<RemoteFs>, parent: u64, name: &str) -> Result<()> {
    remove(fs, parent, name, true, "rmdir")
}
