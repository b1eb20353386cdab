//! Extended attributes are not part of the remote model; these stubs exist
//! so host integrations stop probing. Reads answer "no such attribute",
//! writes pretend to succeed, the list is empty.

use fuser::{ReplyEmpty, ReplyXattr};

pub fn getxattr(reply: ReplyXattr) {
    #[cfg(target_os = "macos")]
    reply.error(libc::ENOATTR);
    #[cfg(not(target_os = "macos"))]
    reply.error(libc::ENODATA);
}

pub fn setxattr(reply: ReplyEmpty) {
    reply.ok();
}

pub fn listxattr(size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(0);
    } else {
        reply.data(&[]);
    }
}

pub fn removexattr(reply: ReplyEmpty) {
    reply.ok();
}
