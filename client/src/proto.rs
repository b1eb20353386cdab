//! Wire types shared with the remote side.
//!
//! These structs are serialized directly to and from the server's JSON
//! bodies, the same way the API client has always talked to the server.

use serde::{Deserialize, Serialize};

/// How a file's payload is represented in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Packing {
    /// End-to-end encrypted: CTR blocks, signed entry, wrapped keys.
    Ee,
    /// Cleartext blocks, mutable on the remote side. Always re-fetched.
    Plain,
}

/// Packing identifier byte, used in the key-derivation info string.
pub fn packing_byte(p: Packing) -> u8 {
    match p {
        Packing::Plain => 1,
        Packing::Ee => 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Link,
}

/// One stored block of a file: `reference` addresses the ciphertext in the
/// store, `checksum` is hex SHA-256 over that ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub offset: u64,
    pub size: u64,
    pub reference: String,
    pub checksum: String,
}

/// The remote metadata record for a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Full remote name, `user@domain/elem/...`.
    pub name: String,
    pub writer: String,
    pub kind: EntryKind,
    pub packing: Packing,
    /// Monotone-per-tree version token assigned by the directory server.
    pub sequence: i64,
    /// Unix seconds.
    pub mtime: u64,
    /// Link target, links only.
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub blocks: Vec<BlockRef>,
    /// Hex-encoded packdata produced by the packer.
    #[serde(default)]
    pub packdata: String,
    /// Advisory mode bits; carried but not enforced.
    #[serde(default)]
    pub attr_mode: u32,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_link(&self) -> bool {
        self.kind == EntryKind::Link
    }

    /// Payload size as the sum of block sizes.
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }
}

/// One message on the watch feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub entry: DirEntry,
    #[serde(default)]
    pub delete: bool,
    /// Set when the server aborts the stream; "invalid" means the requested
    /// sequence is unusable and the watcher must restart from "new".
    #[serde(default)]
    pub error: Option<String>,
}

/// Rights the calling user holds on a path.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccessRights {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
    pub list: bool,
}

/// Public-key registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyRecord {
    pub user: String,
    /// Hex uncompressed P-256 point.
    pub key: String,
    /// Previous key after a rotation, if any.
    #[serde(default)]
    pub previous: Option<String>,
}

/// Response to a block store put.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPut {
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTimeRequest {
    pub mtime: u64,
}

/// Error body the server answers with on failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    #[serde(default)]
    pub msg: String,
}

/// Lookup response wrapper: `status` is "ok" or "follow-link"; on
/// follow-link the entry is the link met during resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub status: String,
    pub entry: DirEntry,
}
