//! The client library for the remote side: directory RPCs, the
//! content-addressed block store, the user-key registry and the watch
//! feed.
//!
//! All functions are async and use one shared `reqwest` client; the
//! filesystem calls them through `block_on` on its own runtime. `put` is
//! where packing happens: blocks are encrypted and stored before the entry
//! is written, so the directory server only ever sees ciphertext.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use p256::PublicKey;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{classify, Error, Kind, Result};
use crate::keys::Factotum;
use crate::packer::Packer;
use crate::proto::{
    AccessRights, ApiError, BlockPut, DirEntry, EntryKind, LookupResponse, Packing,
    SetTimeRequest, UserKeyRecord, WatchEvent,
};
use crate::rpath;

/// Outcome of a lookup: either the entry itself or a link met on the way.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    Entry(DirEntry),
    FollowLink(DirEntry),
}

pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    user: String,
    packer: Arc<Packer>,
    block_size: usize,
}

impl ApiClient {
    pub fn new(server: &str, user: &str, factotum: Arc<Factotum>, block_size: usize) -> Result<Self> {
        let base = Url::parse(server)
            .map_err(|e| Error::new("config", server, Kind::Invalid).with_detail(e.to_string()))?;
        Ok(ApiClient {
            http: reqwest::Client::new(),
            base,
            user: user.to_string(),
            packer: Arc::new(Packer::new(factotum)),
            block_size,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn packer(&self) -> &Packer {
        &self.packer
    }

    fn url(&self, segments: &str) -> String {
        format!("{}{}", self.base.as_str().trim_end_matches('/'), segments)
    }

    fn transport_error(op: &'static str, path: &str, e: reqwest::Error) -> Error {
        if e.is_connect() || e.is_timeout() {
            Error::new(op, path, Kind::Io).with_detail(format!("unreachable: {}", e))
        } else {
            Error::new(op, path, Kind::Io).with_detail(e.to_string())
        }
    }

    /// Turn a non-success response into a taxonomy error.
    async fn api_error(op: &'static str, path: &str, resp: reqwest::Response) -> Error {
        let status = resp.status();
        match resp.json::<ApiError>().await {
            Ok(body) => {
                let kind = Kind::from_str(&body.kind).unwrap_or_else(|| classify(&body.msg));
                Error::new(op, path, kind).with_detail(body.msg)
            }
            Err(_) => Error::new(op, path, Kind::Io).with_detail(format!("http status {}", status)),
        }
    }

    // ---- directory ----

    pub async fn lookup(&self, path: &str) -> Result<LookupOutcome> {
        let resp = self
            .http
            .get(self.url(&format!("/dir/{}", path)))
            .send()
            .await
            .map_err(|e| Self::transport_error("lookup", path, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("lookup", path, resp).await);
        }
        let body: LookupResponse = resp
            .json()
            .await
            .map_err(|e| Error::new("lookup", path, Kind::Io).with_detail(e.to_string()))?;
        if body.status == "follow-link" {
            Ok(LookupOutcome::FollowLink(body.entry))
        } else {
            Ok(LookupOutcome::Entry(body.entry))
        }
    }

    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let resp = self
            .http
            .get(self.url(&format!("/list/{}", path)))
            .send()
            .await
            .map_err(|e| Self::transport_error("list", path, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("list", path, resp).await);
        }
        resp.json()
            .await
            .map_err(|e| Error::new("list", path, Kind::Io).with_detail(e.to_string()))
    }

    /// Pack `data`, store its blocks, and write the entry. Returns the
    /// stored entry carrying the server-assigned sequence.
    pub async fn put(&self, path: &str, data: &[u8], mtime: u64) -> Result<DirEntry> {
        let mut entry = DirEntry {
            name: path.to_string(),
            writer: self.user.clone(),
            kind: EntryKind::File,
            packing: Packing::Ee,
            sequence: 0,
            mtime,
            link: None,
            blocks: Vec::new(),
            packdata: String::new(),
            attr_mode: 0o644,
        };

        let readers = self.reader_keys(path).await?;
        let mut packer = self.packer.pack(&mut entry);
        for chunk in data.chunks(self.block_size.max(1)) {
            let ciphertext = packer.pack(chunk);
            let reference = self.put_block(&ciphertext).await?;
            packer.set_location(reference);
        }
        packer.close(&readers)?;

        self.put_entry(path, &entry).await
    }

    /// The writer's own key plus the key of the path's owner, when the
    /// registry knows it and the owner is someone else.
    async fn reader_keys(&self, path: &str) -> Result<Vec<PublicKey>> {
        let mut readers = vec![self.packer.factotum().public().clone()];
        let owner = rpath::user_of(path);
        if owner != self.user {
            if let Ok((key, _)) = self.user_key(owner).await {
                readers.push(key);
            }
        }
        Ok(readers)
    }

    async fn put_entry(&self, path: &str, entry: &DirEntry) -> Result<DirEntry> {
        let resp = self
            .http
            .put(self.url(&format!("/dir/{}", path)))
            .json(entry)
            .send()
            .await
            .map_err(|e| Self::transport_error("put", path, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("put", path, resp).await);
        }
        resp.json()
            .await
            .map_err(|e| Error::new("put", path, Kind::Io).with_detail(e.to_string()))
    }

    pub async fn make_directory(&self, path: &str) -> Result<DirEntry> {
        let entry = DirEntry {
            name: path.to_string(),
            writer: self.user.clone(),
            kind: EntryKind::Dir,
            packing: Packing::Plain,
            sequence: 0,
            mtime: 0,
            link: None,
            blocks: Vec::new(),
            packdata: String::new(),
            attr_mode: 0o755,
        };
        self.put_entry(path, &entry).await
    }

    /// Write a link entry pointing at `target`.
    pub async fn put_link(&self, target: &str, link_path: &str) -> Result<DirEntry> {
        let entry = DirEntry {
            name: link_path.to_string(),
            writer: self.user.clone(),
            kind: EntryKind::Link,
            packing: Packing::Plain,
            sequence: 0,
            mtime: 0,
            link: Some(target.to_string()),
            blocks: Vec::new(),
            packdata: String::new(),
            attr_mode: 0o777,
        };
        self.put_entry(link_path, &entry).await
    }

    /// Rename `old` to `new`. Packed entries are re-signed for the new
    /// name first; the server then moves the entry atomically.
    pub async fn rename(&self, old: &str, new: &str) -> Result<DirEntry> {
        let mut entry = match self.lookup(old).await? {
            LookupOutcome::Entry(e) => e,
            LookupOutcome::FollowLink(e) => e,
        };
        if entry.kind == EntryKind::File && !entry.packdata.is_empty() {
            self.packer.name(&mut entry, new)?;
        } else {
            entry.name = new.to_string();
        }

        let resp = self
            .http
            .post(self.url(&format!("/rename?from={}&to={}", old, new)))
            .json(&entry)
            .send()
            .await
            .map_err(|e| Self::transport_error("rename", old, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("rename", old, resp).await);
        }
        resp.json()
            .await
            .map_err(|e| Error::new("rename", old, Kind::Io).with_detail(e.to_string()))
    }

    pub async fn delete(&self, path: &str) -> Result<DirEntry> {
        let resp = self
            .http
            .delete(self.url(&format!("/dir/{}", path)))
            .send()
            .await
            .map_err(|e| Self::transport_error("delete", path, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("delete", path, resp).await);
        }
        resp.json()
            .await
            .map_err(|e| Error::new("delete", path, Kind::Io).with_detail(e.to_string()))
    }

    pub async fn set_time(&self, path: &str, mtime: u64) -> Result<DirEntry> {
        let resp = self
            .http
            .post(self.url(&format!("/settime/{}", path)))
            .json(&SetTimeRequest { mtime })
            .send()
            .await
            .map_err(|e| Self::transport_error("settime", path, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("settime", path, resp).await);
        }
        resp.json()
            .await
            .map_err(|e| Error::new("settime", path, Kind::Io).with_detail(e.to_string()))
    }

    pub async fn which_access(&self, path: &str) -> Result<AccessRights> {
        let resp = self
            .http
            .get(self.url(&format!("/access/{}?user={}", path, self.user)))
            .send()
            .await
            .map_err(|e| Self::transport_error("access", path, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("access", path, resp).await);
        }
        resp.json()
            .await
            .map_err(|e| Error::new("access", path, Kind::Io).with_detail(e.to_string()))
    }

    // ---- block store ----

    pub async fn get_block(&self, reference: &str) -> Result<Bytes> {
        let resp = self
            .http
            .get(self.url(&format!("/block/{}", reference)))
            .send()
            .await
            .map_err(|e| Self::transport_error("get-block", reference, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("get-block", reference, resp).await);
        }
        resp.bytes()
            .await
            .map_err(|e| Error::new("get-block", reference, Kind::Io).with_detail(e.to_string()))
    }

    pub async fn put_block(&self, data: &[u8]) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/block"))
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| Self::transport_error("put-block", "", e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("put-block", "", resp).await);
        }
        let body: BlockPut = resp
            .json()
            .await
            .map_err(|e| Error::new("put-block", "", Kind::Io).with_detail(e.to_string()))?;
        Ok(body.reference)
    }

    // ---- key registry ----

    pub async fn user_key(&self, user: &str) -> Result<(PublicKey, Option<PublicKey>)> {
        let resp = self
            .http
            .get(self.url(&format!("/key/{}", user)))
            .send()
            .await
            .map_err(|e| Self::transport_error("user-key", user, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("user-key", user, resp).await);
        }
        let rec: UserKeyRecord = resp
            .json()
            .await
            .map_err(|e| Error::new("user-key", user, Kind::Io).with_detail(e.to_string()))?;
        let current = parse_public(user, &rec.key)?;
        let previous = match rec.previous.as_deref() {
            Some(p) => Some(parse_public(user, p)?),
            None => None,
        };
        Ok((current, previous))
    }

    /// Publish our public key so readers can verify the entries we write.
    /// Called once at mount.
    pub async fn register_key(&self) -> Result<()> {
        let rec = UserKeyRecord {
            user: self.user.clone(),
            key: self.packer.factotum().public_hex(),
            previous: None,
        };
        let resp = self
            .http
            .put(self.url(&format!("/key/{}", self.user)))
            .json(&rec)
            .send()
            .await
            .map_err(|e| Self::transport_error("register-key", &self.user, e))?;
        if !resp.status().is_success() {
            return Err(Self::api_error("register-key", &self.user, resp).await);
        }
        Ok(())
    }

    // ---- watch ----

    /// Open the change feed for `root` starting at `sequence` ("new" or a
    /// numeric token). Servers without watch answer `Kind::NotSupported`.
    pub async fn watch(&self, root: &str, sequence: &str) -> Result<WatchStream> {
        let mut ws_url = self.base.clone();
        let scheme = if ws_url.scheme() == "https" { "wss" } else { "ws" };
        ws_url
            .set_scheme(scheme)
            .map_err(|_| Error::new("watch", root, Kind::Invalid).with_detail("bad server url"))?;
        let url = format!(
            "{}/watch/{}?sequence={}",
            ws_url.as_str().trim_end_matches('/'),
            root,
            sequence
        );

        match connect_async(url).await {
            Ok((ws, _)) => Ok(WatchStream { ws }),
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => {
                let kind = if resp.status() == 404 { Kind::NotSupported } else { Kind::Io };
                Err(Error::new("watch", root, kind)
                    .with_detail(format!("http status {}", resp.status())))
            }
            Err(e) => {
                Err(Error::new("watch", root, Kind::Io).with_detail(format!("unreachable: {}", e)))
            }
        }
    }
}

/// An open watch feed. [`WatchStream::close`] drains politely so the
/// server side is not left mid-write.
pub struct WatchStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WatchStream {
    /// Next event, or None when the stream ends (server gone, socket
    /// closed).
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => match serde_json::from_str::<WatchEvent>(&text) {
                    Ok(ev) => return Some(ev),
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable watch event, skipping");
                        continue;
                    }
                },
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Close and drain any queued deliveries.
    pub async fn close(mut self) {
        let _ = self.ws.send(Message::Close(None)).await;
        while let Some(msg) = self.ws.next().await {
            if msg.is_err() {
                break;
            }
        }
    }
}

fn parse_public(user: &str, hex_key: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| Error::new("user-key", user, Kind::Invalid).with_detail("bad key hex"))?;
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|e| Error::new("user-key", user, Kind::Invalid).with_detail(e.to_string()))
}
