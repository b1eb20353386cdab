//! Wire types for the directory and store API. These mirror the client's
//! DTOs field for field; both sides serialize through serde so the JSON is
//! the contract.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Packing {
    Ee,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub offset: u64,
    pub size: u64,
    pub reference: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub writer: String,
    pub kind: EntryKind,
    pub packing: Packing,
    pub sequence: i64,
    pub mtime: u64,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub blocks: Vec<BlockRef>,
    #[serde(default)]
    pub packdata: String,
    #[serde(default)]
    pub attr_mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub entry: DirEntry,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccessRights {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub delete: bool,
    pub list: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKeyRecord {
    pub user: String,
    pub key: String,
    #[serde(default)]
    pub previous: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPut {
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetTimeRequest {
    pub mtime: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: String,
    #[serde(default)]
    pub msg: String,
}

/// Lookup response: `status` is "ok" or "follow-link"; on follow-link the
/// entry is the link itself, not the requested name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub status: String,
    pub entry: DirEntry,
}
