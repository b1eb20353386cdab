//! The error taxonomy used throughout the client.
//!
//! Every failure that crosses a module boundary is an [`Error`] carrying a
//! [`Kind`], the operation that failed and the remote path involved. The
//! FUSE dispatcher converts the kind to an errno just before replying; no
//! other layer deals in errno values.

use thiserror::Error;

/// The domain error kinds. The remote server reports the same kinds in its
/// JSON error bodies, using the kebab-case names from [`Kind::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Permission,
    Exist,
    NotExist,
    IsDir,
    NotDir,
    NotEmpty,
    Invalid,
    CannotDecrypt,
    Private,
    FollowLink,
    Io,
    NotSupported,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Permission => "permission",
            Kind::Exist => "exist",
            Kind::NotExist => "not-exist",
            Kind::IsDir => "is-dir",
            Kind::NotDir => "not-dir",
            Kind::NotEmpty => "not-empty",
            Kind::Invalid => "invalid",
            Kind::CannotDecrypt => "cannot-decrypt",
            Kind::Private => "private",
            Kind::FollowLink => "follow-link",
            Kind::Io => "io",
            Kind::NotSupported => "not-supported",
        }
    }

    pub fn from_str(s: &str) -> Option<Kind> {
        Some(match s {
            "permission" => Kind::Permission,
            "exist" => Kind::Exist,
            "not-exist" => Kind::NotExist,
            "is-dir" => Kind::IsDir,
            "not-dir" => Kind::NotDir,
            "not-empty" => Kind::NotEmpty,
            "invalid" => Kind::Invalid,
            "cannot-decrypt" => Kind::CannotDecrypt,
            "private" => Kind::Private,
            "follow-link" => Kind::FollowLink,
            "io" => Kind::Io,
            "not-supported" => Kind::NotSupported,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Error)]
#[error("{op} {path}: {}{}", self.kind.as_str(), if self.detail.is_empty() { String::new() } else { format!(": {}", self.detail) })]
pub struct Error {
    /// Name of the operation that failed, e.g. "open" or "writeback".
    pub op: &'static str,
    /// The remote path involved, empty when not applicable.
    pub path: String,
    pub kind: Kind,
    /// Free-form context, often the message of the underlying failure.
    pub detail: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(op: &'static str, path: impl Into<String>, kind: Kind) -> Self {
        Error { op, path: path.into(), kind, detail: String::new() }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn io(op: &'static str, path: impl Into<String>, err: std::io::Error) -> Self {
        Error::new(op, path, Kind::Io).with_detail(err.to_string())
    }

    /// True for transport failures worth retrying (connection refused,
    /// reset, timeout). The HTTP layer tags these with an "unreachable"
    /// prefix when it builds the error.
    pub fn is_unreachable(&self) -> bool {
        self.kind == Kind::Io && self.detail.starts_with("unreachable")
    }

    /// Fill in the path when the error was built below the layer that
    /// knew it.
    pub fn with_path_if_empty(mut self, path: &str) -> Self {
        if self.path.is_empty() {
            self.path = path.to_string();
        }
        self
    }

    /// Translate the kind to the errno surfaced through the kernel
    /// transport.
    pub fn errno(&self) -> i32 {
        match self.kind {
            Kind::Permission => libc::EACCES,
            Kind::CannotDecrypt => libc::EPERM,
            Kind::Exist => libc::EEXIST,
            Kind::NotExist => libc::ENOENT,
            Kind::IsDir => libc::EISDIR,
            Kind::NotDir => libc::ENOTDIR,
            Kind::NotEmpty => libc::ENOTEMPTY,
            Kind::NotSupported => libc::ENOSYS,
            Kind::Private => libc::EACCES,
            Kind::Invalid | Kind::FollowLink | Kind::Io => libc::EIO,
        }
    }
}

/// Classify a message that originated outside the taxonomy (a foreign
/// server, an OS error string) by matching a short list of idioms.
pub fn classify(msg: &str) -> Kind {
    let m = msg.to_ascii_lowercase();
    if m.contains("sequence number") {
        // Stale-sequence writes surface as EEXIST so callers retry.
        Kind::Exist
    } else if m.contains("not found") || m.contains("no such") {
        Kind::NotExist
    } else if m.contains("not a directory") {
        Kind::NotDir
    } else if m.contains("permission") {
        Kind::Permission
    } else if m.contains("not empty") {
        Kind::NotEmpty
    } else {
        Kind::Io
    }
}
