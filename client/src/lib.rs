//! Mountable client for a remote, content-addressed, end-to-end-encrypted
//! name space.
//!
//! The crate is a library so the integration tests can exercise the whole
//! request surface in-process; `main.rs` is a thin CLI wrapper that mounts
//! the filesystem through FUSE.

pub mod api_client;
pub mod cache;
pub mod config;
pub mod cryptfile;
pub mod dircache;
pub mod error;
pub mod fs;
pub mod keys;
pub mod node;
pub mod packer;
pub mod proto;
pub mod rpath;
pub mod watcher;
