//! Shared imports for the `fs` op modules. One place to manage what every
//! operation file needs instead of repeating the list in each.

pub use std::sync::Arc;
pub use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub use fuser::{FileAttr, FileType};

pub use crate::api_client::LookupOutcome;
pub use crate::error::{Error, Kind, Result};
pub use crate::node::{self, Node, NodeKind};
pub use crate::proto::{DirEntry, EntryKind};
pub use crate::rpath;
pub use crate::watcher;

pub use super::{Handle, RemoteFs, ROOT_INO};
