use super::prelude::*;

/// Rename `parent/name` to `newparent/newname`.
///
/// The two directory nodes are locked in path order for the duration of
/// the remote call so concurrent renames through either directory
/// serialize. If the destination exists remotely, it is deleted and the
/// rename retried once. Locally the source node is rewired to the new
/// name and any prior destination node floats with writeback disabled.
pub fn rename(
    fs: &Arc<RemoteFs>,
    parent: u64,
    name: &str,
    newparent: u64,
    newname: &str,
) -> Result<()> {
    if parent == ROOT_INO || newparent == ROOT_INO {
        return Err(Error::new("rename", name, Kind::Permission)
            .with_detail("user roots cannot be renamed"));
    }
    let pnode = fs
        .node_by_ino(parent)
        .ok_or_else(|| Error::new("rename", name, Kind::NotExist))?;
    let npnode = fs
        .node_by_ino(newparent)
        .ok_or_else(|| Error::new("rename", newname, Kind::NotExist))?;
    let parent_path = pnode.lock().path.clone();
    let newparent_path = npnode.lock().path.clone();
    let old = rpath::join(&parent_path, name);
    let new = rpath::join(&newparent_path, newname);
    if old == new {
        return Ok(());
    }

    let entry = {
        let _guards = RemoteFs::lock_pair(&pnode, &parent_path, &npnode, &newparent_path);
        match fs.block_on(fs.client.rename(&old, &new)) {
            Ok(entry) => entry,
            Err(e) if e.kind == Kind::Exist => {
                // The destination is taken: replace it and retry once.
                fs.block_on(fs.client.delete(&new))?;
                fs.block_on(fs.client.rename(&old, &new))?
            }
            Err(e) => return Err(e),
        }
    };

    {
        let mut maps = fs.lock_maps();
        if let Some(dest) = maps.nodes.remove(&new) {
            watcher::detach_watch(fs, &mut maps, rpath::user_of(&new));
            let mut dst = dest.lock();
            dst.no_writeback = true;
            dst.deleted = true;
        }
        if let Some(node) = maps.nodes.remove(&old) {
            {
                let mut st = node.lock();
                st.path = new.clone();
                st.sequence = entry.sequence;
            }
            maps.nodes.insert(new.clone(), node);
            let old_user = rpath::user_of(&old);
            let new_user = rpath::user_of(&new);
            if old_user != new_user {
                watcher::detach_watch(fs, &mut maps, old_user);
                let new_user = new_user.to_string();
                watcher::attach_watch(fs, &mut maps, &new_user);
            }
        }
        maps.enoent.remove(&new);
    }

    fs.dircache.drop_dir(&parent_path);
    fs.dircache.drop_dir(&newparent_path);
    Ok(())
}
