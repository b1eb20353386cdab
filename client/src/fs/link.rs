use super::prelude::*;

use std::path::Path;

/// Create a symlink. The caller-supplied target is resolved against the
/// mount point; anything that escapes the mount is rejected. What is
/// stored remotely is the remote name of the target, and what readlink
/// reports is the host-relative rendering of that name.
pub fn symlink(fs: &Arc<RemoteFs>, parent: u64, name: &str, target: &Path) -> Result<FileAttr> {
    if parent == ROOT_INO {
        return Err(Error::new("symlink", name, Kind::Permission)
            .with_detail("the root holds only user trees"));
    }
    let pnode = fs
        .node_by_ino(parent)
        .ok_or_else(|| Error::new("symlink", name, Kind::NotExist))?;
    let parent_path = pnode.lock().path.clone();
    let link_path = rpath::join(&parent_path, name);

    let target = target
        .to_str()
        .ok_or_else(|| Error::new("symlink", name, Kind::Invalid).with_detail("non-utf8 target"))?;
    let remote_target = rpath::resolve_link_target(&fs.mountpoint, &parent_path, target)?;

    let rights = fs.block_on(fs.client.which_access(&link_path))?;
    if !rights.create {
        return Err(Error::new("symlink", &link_path, Kind::Permission));
    }

    let entry = fs.block_on(fs.client.put_link(&remote_target, &link_path))?;
    let ino = fs.alloc_ino();
    let node = Node::new(
        ino,
        NodeKind::Other,
        &link_path,
        FileType::Symlink,
        0o777,
        0,
        SystemTime::now(),
    );
    node.lock().absorb_entry(&entry);
    fs.exists(&node);
    fs.dircache.drop_dir(&parent_path);
    let attr = node.lock().attr(ino, fs.uid, fs.gid);
    Ok(attr)
}

/// The host-relative rendering of the link's stored target: `..` up to
/// the common ancestor, then down.
pub fn readlink(fs: &Arc<RemoteFs>, ino: u64) -> Result<String> {
    let node = fs
        .node_by_ino(ino)
        .ok_or_else(|| Error::new("readlink", "", Kind::NotExist))?;
    let st = node.lock();
    if st.deleted {
        return Err(Error::new("readlink", &st.path, Kind::NotExist));
    }
    let target = st
        .link_target
        .as_ref()
        .ok_or_else(|| Error::new("readlink", &st.path, Kind::Invalid).with_detail("not a link"))?;
    Ok(rpath::relative_link(&st.path, target))
}
