//! Remote-name helpers.
//!
//! Remote paths look like `user@example.org/dir/file`. The first component
//! is the owning user; a path with no slash is that user's root. These
//! helpers keep the string surgery in one place.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Kind, Result};

/// The user that owns `path` (everything before the first slash).
pub fn user_of(path: &str) -> &str {
    match path.find('/') {
        Some(i) => &path[..i],
        None => path,
    }
}

/// True if `path` names a user root (no path elements below the user).
pub fn is_user_root(path: &str) -> bool {
    !path.contains('/')
}

/// Last path element.
pub fn base(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Containing directory, or None for a user root.
pub fn parent(path: &str) -> Option<&str> {
    path.rfind('/').map(|i| &path[..i])
}

/// Join a directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Collapse repeated and trailing slashes. Remote names never contain
/// `.`/`..` elements; those are resolved on the host side before a name
/// reaches us.
pub fn clean(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for elem in path.split('/').filter(|e| !e.is_empty() && *e != ".") {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(elem);
    }
    out
}

/// The conventional snapshot user for `user`, e.g. `ann@example.org` →
/// `ann+snapshot@example.org`. None when the name already carries a suffix.
pub fn snapshot_user(user: &str) -> Option<String> {
    let at = user.find('@')?;
    let (name, domain) = user.split_at(at);
    if name.contains('+') {
        return None;
    }
    Some(format!("{}+snapshot{}", name, domain))
}

/// Render `target` relative to the directory containing `link`, walking up
/// with `..` to the common ancestor and down again. This is what readlink
/// returns and what defines a link's reported size.
pub fn relative_link(link: &str, target: &str) -> String {
    let from: Vec<&str> = match parent(link) {
        Some(p) => p.split('/').collect(),
        None => Vec::new(),
    };
    let to: Vec<&str> = target.split('/').collect();

    let mut common = 0;
    while common < from.len() && common < to.len() && from[common] == to[common] {
        common += 1;
    }

    let mut out: Vec<&str> = Vec::new();
    for _ in common..from.len() {
        out.push("..");
    }
    out.extend(&to[common..]);
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

/// Size a symlink reports through stat: the length of its host-relative
/// rendering.
pub fn link_size(link: &str, target: &str) -> u64 {
    relative_link(link, target).len() as u64
}

/// Resolve a caller-supplied symlink target against the mount point and
/// return the remote name it denotes. `link_parent` is the remote directory
/// the link is being created in. Targets that resolve outside the mount are
/// rejected.
pub fn resolve_link_target(mount: &Path, link_parent: &str, target: &str) -> Result<String> {
    let mut abs = PathBuf::from(mount);
    let t = Path::new(target);
    if t.is_absolute() {
        abs = t.to_path_buf();
    } else {
        abs.push(link_parent);
        abs.push(t);
    }

    // Lexical normalization; the target need not exist yet.
    let mut norm = PathBuf::new();
    for comp in abs.components() {
        match comp {
            Component::ParentDir => {
                if !norm.pop() {
                    return Err(Error::new("symlink", target, Kind::Invalid)
                        .with_detail("target escapes the mount point"));
                }
            }
            Component::CurDir => {}
            c => norm.push(c.as_os_str()),
        }
    }

    let rel = norm.strip_prefix(mount).map_err(|_| {
        Error::new("symlink", target, Kind::Invalid).with_detail("target escapes the mount point")
    })?;
    let remote = rel.to_string_lossy().replace('\\', "/");
    if remote.is_empty() {
        return Err(Error::new("symlink", target, Kind::Invalid)
            .with_detail("target is the mount point itself"));
    }
    Ok(clean(&remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_and_root_parsing() {
        assert_eq!(user_of("ann@example.org/a/b"), "ann@example.org");
        assert_eq!(user_of("ann@example.org"), "ann@example.org");
        assert!(is_user_root("ann@example.org"));
        assert!(!is_user_root("ann@example.org/a"));
        assert_eq!(base("u@x/a/b"), "b");
        assert_eq!(parent("u@x/a/b"), Some("u@x/a"));
        assert_eq!(parent("u@x"), None);
    }

    #[test]
    fn clean_collapses_slashes() {
        assert_eq!(clean("u@x//a///b/"), "u@x/a/b");
        assert_eq!(clean("u@x/./a"), "u@x/a");
    }

    #[test]
    fn snapshot_user_naming() {
        assert_eq!(
            snapshot_user("ann@example.org").as_deref(),
            Some("ann+snapshot@example.org")
        );
        assert_eq!(snapshot_user("ann+snapshot@example.org"), None);
        assert_eq!(snapshot_user("no-domain"), None);
    }

    #[test]
    fn relative_link_walks_up_and_down() {
        assert_eq!(
            relative_link("u@x/t3/dir/sub/updown", "u@x/t3/dir/real1"),
            "../real1"
        );
        assert_eq!(relative_link("u@x/a/l", "u@x/a/t"), "t");
        assert_eq!(relative_link("u@x/l", "u@x/a/b/t"), "a/b/t");
        assert_eq!(relative_link("u@x/a/b/l", "u@x"), "../..");
    }

    #[test]
    fn link_target_containment() {
        let mount = Path::new("/mnt/vault");
        let got =
            resolve_link_target(mount, "u@x/t3/dir/sub", "../../../../u@x/t3/dir/real1").unwrap();
        assert_eq!(got, "u@x/t3/dir/real1");

        let got = resolve_link_target(mount, "u@x/d", "file").unwrap();
        assert_eq!(got, "u@x/d/file");

        let got = resolve_link_target(mount, "u@x/d", "/mnt/vault/u@x/other").unwrap();
        assert_eq!(got, "u@x/other");

        assert!(resolve_link_target(mount, "u@x", "../../etc/passwd").is_err());
        assert!(resolve_link_target(mount, "u@x/d", "/etc/passwd").is_err());
    }
}
