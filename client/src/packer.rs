//! The block packer: converts between cleartext byte streams and encrypted,
//! checksummed store blocks, and between directory-entry packdata and
//! signed, wrapped key material.
//!
//! Packing is streaming: a fresh 32-byte file key drives an AES-256-CTR
//! keystream with an all-zero IV (the key is single-use, never shared
//! between files), each submitted chunk becomes one ciphertext block with a
//! SHA-256 checksum, and on close the file key is wrapped for every reader
//! with ECDH → HKDF-SHA-256 → AES-256-GCM and the entry is signed with the
//! writer's P-256 key. Unpacking reverses each step and fails closed.

use aes::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use p256::ecdsa::Signature;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey, Scalar, SecretKey};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::{Error, Kind, Result};
use crate::keys::{key_hash_of, verify, Factotum};
use crate::proto::{packing_byte, BlockRef, DirEntry, Packing};
use crate::rpath;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

const CURVE_NAME: &str = "p256";
const FILE_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// One AES-GCM-enclosed copy of the file key for a single recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// SHA-256 of the recipient's uncompressed public point.
    pub key_hash: Vec<u8>,
    /// Encrypted file key, GCM tag included.
    pub encrypted: Vec<u8>,
    pub nonce: Vec<u8>,
    /// Ephemeral public point, affine coordinates, minimal big-endian.
    pub eph_x: Vec<u8>,
    pub eph_y: Vec<u8>,
}

/// Parsed packdata: two signatures (the secondary is zero except right
/// after a writer key rotation), the wrap list, and the hash over the
/// entry's block checksums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packdata {
    pub sig_r: Vec<u8>,
    pub sig_s: Vec<u8>,
    pub sig2_r: Vec<u8>,
    pub sig2_s: Vec<u8>,
    pub wraps: Vec<WrappedKey>,
    pub block_sum: Vec<u8>,
}

impl Packdata {
    pub fn sig2_is_zero(&self) -> bool {
        self.sig2_r.iter().all(|&b| b == 0) && self.sig2_s.iter().all(|&b| b == 0)
    }
}

// ---- varint-prefixed wire encoding ----

fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn get_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let b = *buf
            .get(*pos)
            .ok_or_else(|| Error::new("packdata", "", Kind::Invalid).with_detail("short varint"))?;
        *pos += 1;
        if shift >= 63 && b > 1 {
            return Err(Error::new("packdata", "", Kind::Invalid).with_detail("varint overflow"));
        }
        v |= u64::from(b & 0x7f) << shift;
        if b < 0x80 {
            return Ok(v);
        }
        shift += 7;
    }
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    put_uvarint(out, field.len() as u64);
    out.extend_from_slice(field);
}

fn get_field(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = get_uvarint(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::new("packdata", "", Kind::Invalid).with_detail("short field"))?;
    let out = buf[*pos..end].to_vec();
    *pos = end;
    Ok(out)
}

/// Marshal packdata in the fixed field order:
/// `sig.R, sig.S, sig2.R, sig2.S, wrap-count, wraps..., blockSum`.
pub fn encode_packdata(pd: &Packdata) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    put_field(&mut out, &pd.sig_r);
    put_field(&mut out, &pd.sig_s);
    put_field(&mut out, &pd.sig2_r);
    put_field(&mut out, &pd.sig2_s);
    put_uvarint(&mut out, pd.wraps.len() as u64);
    for w in &pd.wraps {
        put_field(&mut out, &w.key_hash);
        put_field(&mut out, &w.encrypted);
        put_field(&mut out, &w.nonce);
        put_field(&mut out, &w.eph_x);
        put_field(&mut out, &w.eph_y);
    }
    put_field(&mut out, &pd.block_sum);
    out
}

pub fn decode_packdata(buf: &[u8]) -> Result<Packdata> {
    let mut pos = 0usize;
    let sig_r = get_field(buf, &mut pos)?;
    let sig_s = get_field(buf, &mut pos)?;
    let sig2_r = get_field(buf, &mut pos)?;
    let sig2_s = get_field(buf, &mut pos)?;
    let count = get_uvarint(buf, &mut pos)? as usize;
    if count > 1024 {
        return Err(Error::new("packdata", "", Kind::Invalid).with_detail("wrap count"));
    }
    let mut wraps = Vec::with_capacity(count);
    for _ in 0..count {
        let key_hash = get_field(buf, &mut pos)?;
        let encrypted = get_field(buf, &mut pos)?;
        let nonce = get_field(buf, &mut pos)?;
        let eph_x = get_field(buf, &mut pos)?;
        let eph_y = get_field(buf, &mut pos)?;
        // The curve is inferred from the ephemeral Y length; only P-256
        // (≤ 265 bits) is spoken here.
        if eph_y.len() > 33 {
            return Err(Error::new("packdata", "", Kind::Invalid)
                .with_detail("unsupported ephemeral curve"));
        }
        wraps.push(WrappedKey { key_hash, encrypted, nonce, eph_x, eph_y });
    }
    let block_sum = get_field(buf, &mut pos)?;
    if pos != buf.len() {
        return Err(Error::new("packdata", "", Kind::Invalid).with_detail("trailing bytes"));
    }
    Ok(Packdata { sig_r, sig_s, sig2_r, sig2_s, wraps, block_sum })
}

// ---- helpers ----

fn strip_zeros(b: &[u8]) -> Vec<u8> {
    let start = b.iter().position(|&x| x != 0).unwrap_or(b.len());
    b[start..].to_vec()
}

fn pad32(b: &[u8]) -> Result<[u8; 32]> {
    if b.len() > 32 {
        return Err(Error::new("packdata", "", Kind::Invalid).with_detail("oversized scalar"));
    }
    let mut out = [0u8; 32];
    out[32 - b.len()..].copy_from_slice(b);
    Ok(out)
}

fn sig_to_wire(sig: &Signature) -> (Vec<u8>, Vec<u8>) {
    let (r, s) = sig.split_bytes();
    (strip_zeros(&r), strip_zeros(&s))
}

fn sig_from_wire(r: &[u8], s: &[u8]) -> Result<Signature> {
    let r = FieldBytes::from(pad32(r)?);
    let s = FieldBytes::from(pad32(s)?);
    Signature::from_scalars(r, s)
        .map_err(|e| Error::new("packdata", "", Kind::Invalid).with_detail(e.to_string()))
}

/// SHA-256 over the concatenated per-block checksums; stored in packdata so
/// block-list tampering is detectable before any fetch.
pub fn checksum_of_blocks(blocks: &[BlockRef]) -> Result<Vec<u8>> {
    let mut h = Sha256::new();
    for b in blocks {
        let sum = hex::decode(&b.checksum)
            .map_err(|_| Error::new("packdata", "", Kind::Invalid).with_detail("bad checksum"))?;
        h.update(&sum);
    }
    Ok(h.finalize().to_vec())
}

/// The byte string the writer signs: curve, clean path, mtime, file key,
/// block-checksums hash, NUL-separated so fields cannot bleed together.
fn sig_message(name: &str, mtime: u64, dkey: &[u8], block_sum: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(64 + name.len());
    msg.extend_from_slice(CURVE_NAME.as_bytes());
    msg.push(0);
    msg.extend_from_slice(rpath::clean(name).as_bytes());
    msg.push(0);
    msg.extend_from_slice(&mtime.to_be_bytes());
    msg.extend_from_slice(dkey);
    msg.extend_from_slice(block_sum);
    msg
}

fn derive_wrap_key(shared: &[u8], packing: u8, key_hash: &[u8], nonce: &[u8]) -> [u8; 32] {
    let info = format!("{:02x}:{}:{}", packing, hex::encode(key_hash), hex::encode(nonce));
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 32];
    // 32 bytes is always a valid HKDF-SHA256 output length.
    hk.expand(info.as_bytes(), &mut okm).expect("hkdf length");
    okm
}

/// Wrap `dkey` for `recipient`: ephemeral ECDH, HKDF, AES-256-GCM seal.
pub fn aes_wrap(recipient: &PublicKey, dkey: &[u8], packing: Packing) -> Result<WrappedKey> {
    let eph = SecretKey::random(&mut OsRng);
    let eph_point = eph.public_key().to_encoded_point(false);
    let scalar: Scalar = *eph.to_nonzero_scalar();
    let shared = (recipient.to_projective() * scalar).to_affine().to_encoded_point(false);

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let key_hash = key_hash_of(recipient).to_vec();
    let aes_key = derive_wrap_key(shared.as_bytes(), packing_byte(packing), &key_hash, &nonce);

    let cipher = Aes256Gcm::new_from_slice(&aes_key).expect("aes key length");
    let encrypted = cipher
        .encrypt(Nonce::from_slice(&nonce), dkey)
        .map_err(|_| Error::new("wrap", "", Kind::Io).with_detail("gcm seal"))?;

    Ok(WrappedKey {
        key_hash,
        encrypted,
        nonce: nonce.to_vec(),
        eph_x: strip_zeros(&eph_point.x().expect("affine x")[..]),
        eph_y: strip_zeros(&eph_point.y().expect("affine y")[..]),
    })
}

/// Unwrap a file key with the factotum's matching private key. Returns
/// `cannot-decrypt` on any mismatch, never a partial key.
pub fn aes_unwrap(wrap: &WrappedKey, factotum: &Factotum, packing: Packing) -> Result<Zeroizing<[u8; 32]>> {
    if wrap.nonce.len() != NONCE_LEN {
        return Err(Error::new("unwrap", "", Kind::CannotDecrypt).with_detail("nonce length"));
    }
    let x = FieldBytes::from(pad32(&wrap.eph_x)?);
    let y = FieldBytes::from(pad32(&wrap.eph_y)?);
    let point = EncodedPoint::from_affine_coordinates(&x, &y, false);
    let eph: Option<PublicKey> = PublicKey::from_encoded_point(&point).into();
    let eph = eph.ok_or_else(|| {
        Error::new("unwrap", "", Kind::CannotDecrypt).with_detail("bad ephemeral point")
    })?;

    let shared = factotum.shared_secret(&wrap.key_hash, &eph)?;
    let aes_key = derive_wrap_key(&shared, packing_byte(packing), &wrap.key_hash, &wrap.nonce);
    let cipher = Aes256Gcm::new_from_slice(&aes_key).expect("aes key length");
    let clear = cipher
        .decrypt(Nonce::from_slice(&wrap.nonce), wrap.encrypted.as_slice())
        .map_err(|_| Error::new("unwrap", "", Kind::CannotDecrypt).with_detail("wrap mac"))?;
    if clear.len() != FILE_KEY_LEN {
        return Err(Error::new("unwrap", "", Kind::CannotDecrypt).with_detail("file key length"));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&clear);
    Ok(key)
}

/// The packer capability bundle. One per mounted user; all operations share
/// the factotum.
pub struct Packer {
    factotum: Arc<Factotum>,
}

impl Packer {
    pub fn new(factotum: Arc<Factotum>) -> Self {
        Packer { factotum }
    }

    pub fn factotum(&self) -> &Factotum {
        &self.factotum
    }

    /// Begin packing `entry`. Blocks are then submitted in order through
    /// the returned packer and the entry is finalized by `close`.
    pub fn pack<'a>(&'a self, entry: &'a mut DirEntry) -> BlockPacker<'a> {
        let mut dkey = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *dkey);
        let key: &[u8; 32] = &dkey;
        let cipher = Aes256Ctr::new(key.into(), (&[0u8; 16]).into());
        entry.blocks.clear();
        BlockPacker { factotum: self.factotum.as_ref(), entry, cipher, dkey, offset: 0 }
    }

    /// Validate `entry`'s packdata against this reader and return an
    /// unpacker for its blocks. `writer_key` is the writer's current
    /// public key; `writer_prev` the pre-rotation key if the registry
    /// knows one. Blocks may then be fetched and unpacked in any order.
    pub fn unpack(
        &self,
        entry: &DirEntry,
        writer_key: &PublicKey,
        writer_prev: Option<&PublicKey>,
    ) -> Result<EntryUnpacker> {
        let name = entry.name.clone();
        let raw = hex::decode(&entry.packdata).map_err(|_| {
            Error::new("unpack", &name, Kind::Invalid).with_detail("bad packdata hex")
        })?;
        let pd = decode_packdata(&raw).map_err(|e| e.with_path_if_empty(&name))?;

        let block_sum = checksum_of_blocks(&entry.blocks)?;
        if block_sum != pd.block_sum {
            return Err(Error::new("unpack", &name, Kind::Invalid)
                .with_detail("block checksums do not match packdata"));
        }

        let wrap = self
            .find_wrap(&pd.wraps)
            .ok_or_else(|| {
                Error::new("unpack", &name, Kind::CannotDecrypt).with_detail("no wrapped key")
            })?;
        let dkey =
            aes_unwrap(wrap, &self.factotum, entry.packing).map_err(|e| e.with_path_if_empty(&name))?;

        let msg = sig_message(&entry.name, entry.mtime, dkey.as_ref(), &pd.block_sum);
        let sig = sig_from_wire(&pd.sig_r, &pd.sig_s)?;
        let mut ok = verify(writer_key, &msg, &sig);
        if !ok && !pd.sig2_is_zero() {
            // The writer may have rotated keys since signing; the secondary
            // signature verifies against the previous key.
            let sig2 = sig_from_wire(&pd.sig2_r, &pd.sig2_s)?;
            let key = writer_prev.unwrap_or(writer_key);
            ok = verify(key, &msg, &sig2);
        }
        if !ok {
            return Err(Error::new("unpack", &name, Kind::Invalid).with_detail("verify"));
        }

        Ok(EntryUnpacker { entry: entry.clone(), dkey })
    }

    fn find_wrap<'w>(&self, wraps: &'w [WrappedKey]) -> Option<&'w WrappedKey> {
        wraps.iter().find(|w| self.factotum.owns_hash(&w.key_hash))
    }

    /// Re-wrap the file keys of `entries` for a new reader set. Entries
    /// whose wrap list does not include the caller are skipped. Signatures
    /// and checksums are untouched.
    pub fn share(&self, entries: &mut [DirEntry], readers: &[PublicKey]) -> Result<usize> {
        let mut changed = 0;
        for entry in entries.iter_mut() {
            let raw = match hex::decode(&entry.packdata) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let mut pd = match decode_packdata(&raw) {
                Ok(pd) => pd,
                Err(_) => continue,
            };
            let Some(wrap) = self.find_wrap(&pd.wraps) else { continue };
            let dkey = aes_unwrap(wrap, &self.factotum, entry.packing)?;

            let mut wraps = Vec::with_capacity(readers.len());
            for r in readers {
                let hash = key_hash_of(r).to_vec();
                match pd.wraps.iter().find(|w| w.key_hash == *hash) {
                    Some(existing) => wraps.push(existing.clone()),
                    None => wraps.push(aes_wrap(r, dkey.as_ref(), entry.packing)?),
                }
            }
            pd.wraps = wraps;
            entry.packdata = hex::encode(encode_packdata(&pd));
            changed += 1;
        }
        Ok(changed)
    }

    /// Re-sign `entry` for a new name. When the containing directory
    /// changes, all wraps except the caller's are dropped: the new
    /// directory may have different readers.
    pub fn name(&self, entry: &mut DirEntry, new_name: &str) -> Result<()> {
        let raw = hex::decode(&entry.packdata).map_err(|_| {
            Error::new("name", &entry.name, Kind::Invalid).with_detail("bad packdata hex")
        })?;
        let mut pd = decode_packdata(&raw)?;
        let wrap = self.find_wrap(&pd.wraps).ok_or_else(|| {
            Error::new("name", &entry.name, Kind::CannotDecrypt).with_detail("no wrapped key")
        })?;
        let dkey = aes_unwrap(wrap, &self.factotum, entry.packing)?;

        // The caller must hold a valid signature before renaming.
        let msg = sig_message(&entry.name, entry.mtime, dkey.as_ref(), &pd.block_sum);
        let sig = sig_from_wire(&pd.sig_r, &pd.sig_s)?;
        let mut ok = verify(self.factotum.public(), &msg, &sig);
        if !ok && !pd.sig2_is_zero() {
            let sig2 = sig_from_wire(&pd.sig2_r, &pd.sig2_s)?;
            ok = verify(self.factotum.public(), &msg, &sig2);
        }
        if !ok {
            return Err(Error::new("name", &entry.name, Kind::Invalid).with_detail("verify"));
        }

        if rpath::parent(&entry.name) != rpath::parent(new_name) {
            let own = self.factotum.key_hash().to_vec();
            pd.wraps.retain(|w| w.key_hash == own);
        }

        let new_msg = sig_message(new_name, entry.mtime, dkey.as_ref(), &pd.block_sum);
        let new_sig = self.factotum.sign(&new_msg);
        let (r, s) = sig_to_wire(&new_sig);
        pd.sig_r = r;
        pd.sig_s = s;
        pd.sig2_r = Vec::new();
        pd.sig2_s = Vec::new();

        entry.name = new_name.to_string();
        entry.packdata = hex::encode(encode_packdata(&pd));
        Ok(())
    }
}

/// Streaming pack of one file.
pub struct BlockPacker<'a> {
    factotum: &'a Factotum,
    entry: &'a mut DirEntry,
    cipher: Aes256Ctr,
    dkey: Zeroizing<[u8; 32]>,
    offset: u64,
}

impl<'a> BlockPacker<'a> {
    /// Encrypt one cleartext chunk; appends the block descriptor (with an
    /// empty location, see [`set_location`]) and returns the ciphertext.
    pub fn pack(&mut self, cleartext: &[u8]) -> Vec<u8> {
        let mut ct = cleartext.to_vec();
        self.cipher.apply_keystream(&mut ct);
        let checksum = hex::encode(Sha256::digest(&ct));
        self.entry.blocks.push(BlockRef {
            offset: self.offset,
            size: cleartext.len() as u64,
            reference: String::new(),
            checksum,
        });
        self.offset += cleartext.len() as u64;
        ct
    }

    /// Record the store reference of the most recently packed block once
    /// its store put has completed.
    pub fn set_location(&mut self, reference: String) {
        if let Some(b) = self.entry.blocks.last_mut() {
            b.reference = reference;
        }
    }

    /// Wrap the file key for every reader, sign, and marshal packdata into
    /// the entry. The file key is zeroed when the packer drops.
    pub fn close(self, readers: &[PublicKey]) -> Result<()> {
        let block_sum = checksum_of_blocks(&self.entry.blocks)?;

        let mut wraps: Vec<WrappedKey> = Vec::new();
        for r in readers {
            let hash = key_hash_of(r).to_vec();
            if wraps.iter().any(|w| w.key_hash == hash) {
                continue;
            }
            wraps.push(aes_wrap(r, &*self.dkey, self.entry.packing)?);
        }

        let msg = sig_message(&self.entry.name, self.entry.mtime, self.dkey.as_ref(), &block_sum);
        let sig = self.factotum.sign(&msg);
        let (sig_r, sig_s) = sig_to_wire(&sig);
        let pd = Packdata {
            sig_r,
            sig_s,
            sig2_r: Vec::new(),
            sig2_s: Vec::new(),
            wraps,
            block_sum,
        };
        self.entry.packdata = hex::encode(encode_packdata(&pd));
        Ok(())
    }
}

/// A validated entry plus its unwrapped file key. Blocks are checked and
/// decrypted independently, which is what demand loading needs.
#[derive(Debug)]
pub struct EntryUnpacker {
    entry: DirEntry,
    dkey: Zeroizing<[u8; 32]>,
}

impl EntryUnpacker {
    pub fn blocks(&self) -> &[BlockRef] {
        &self.entry.blocks
    }

    /// Validate and decrypt one fetched block. The keystream position is
    /// derived from the block's cleartext offset, so blocks may be
    /// unpacked in any order.
    pub fn unpack(&self, block: &BlockRef, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let sum = hex::encode(Sha256::digest(ciphertext));
        if sum != block.checksum {
            return Err(Error::new("unpack", &self.entry.name, Kind::Invalid)
                .with_detail("block checksum mismatch"));
        }
        let key: &[u8; 32] = &self.dkey;
        let mut cipher = Aes256Ctr::new(key.into(), (&[0u8; 16]).into());
        cipher.seek(block.offset);
        let mut out = ciphertext.to_vec();
        cipher.apply_keystream(&mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::EntryKind;

    fn entry(name: &str) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            writer: crate::rpath::user_of(name).to_string(),
            kind: EntryKind::File,
            packing: Packing::Ee,
            sequence: 0,
            mtime: 1_720_000_000,
            link: None,
            blocks: Vec::new(),
            packdata: String::new(),
            attr_mode: 0o644,
        }
    }

    /// Pack `data` in `chunk`-sized blocks, returning the ciphertext
    /// blocks as a stand-in for the store.
    fn pack_all(p: &Packer, e: &mut DirEntry, data: &[u8], chunk: usize, readers: &[PublicKey]) -> Vec<Vec<u8>> {
        let mut store = Vec::new();
        let mut bp = p.pack(e);
        for c in data.chunks(chunk.max(1)) {
            let ct = bp.pack(c);
            let reference = hex::encode(Sha256::digest(&ct));
            bp.set_location(reference);
            store.push(ct);
        }
        bp.close(readers).unwrap();
        store
    }

    fn unpack_all(p: &Packer, e: &DirEntry, store: &[Vec<u8>], writer: &PublicKey) -> Result<Vec<u8>> {
        let bu = p.unpack(e, writer, None)?;
        let mut out = Vec::new();
        for (i, b) in bu.blocks().iter().enumerate() {
            assert_eq!(b.offset, out.len() as u64);
            out.extend(bu.unpack(b, &store[i])?);
        }
        Ok(out)
    }

    #[test]
    fn uvarint_round_trip() {
        let mut buf = Vec::new();
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            buf.clear();
            put_uvarint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(get_uvarint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn pack_unpack_round_trip() {
        let f = Arc::new(Factotum::generate());
        let p = Packer::new(f.clone());
        let mut e = entry("ann@example.org/dir/file");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let store = pack_all(&p, &mut e, &data, 4096, &[f.public().clone()]);
        assert_eq!(e.size(), data.len() as u64);
        let got = unpack_all(&p, &e, &store, f.public()).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn reader_in_wrap_list_can_unpack() {
        let writer = Arc::new(Factotum::generate());
        let reader = Arc::new(Factotum::generate());
        let p = Packer::new(writer.clone());
        let mut e = entry("ann@example.org/f");
        let data = b"shared with one reader".to_vec();
        let store = pack_all(&p, &mut e, &data, 8, &[writer.public().clone(), reader.public().clone()]);

        let rp = Packer::new(reader);
        let got = unpack_all(&rp, &e, &store, writer.public()).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn outsider_gets_no_wrapped_key() {
        let writer = Arc::new(Factotum::generate());
        let outsider = Arc::new(Factotum::generate());
        let p = Packer::new(writer.clone());
        let mut e = entry("ann@example.org/f");
        let _ = pack_all(&p, &mut e, b"secret", 16, &[writer.public().clone()]);

        let op = Packer::new(outsider);
        let err = op.unpack(&e, writer.public(), None).unwrap_err();
        assert_eq!(err.kind, Kind::CannotDecrypt);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let f = Arc::new(Factotum::generate());
        let p = Packer::new(f.clone());
        let mut e = entry("ann@example.org/f");
        let mut store = pack_all(&p, &mut e, b"some tamperable data", 8, &[f.public().clone()]);
        store[1][0] ^= 1;

        let bu = p.unpack(&e, f.public(), None).unwrap();
        let blocks = bu.blocks().to_vec();
        bu.unpack(&blocks[0], &store[0]).unwrap();
        let err = bu.unpack(&blocks[1], &store[1]).unwrap_err();
        assert_eq!(err.kind, Kind::Invalid);
    }

    #[test]
    fn tampered_block_checksum_fails_before_any_fetch() {
        let f = Arc::new(Factotum::generate());
        let p = Packer::new(f.clone());
        let mut e = entry("ann@example.org/f");
        let _ = pack_all(&p, &mut e, b"0123456789", 4, &[f.public().clone()]);
        e.blocks[0].checksum = hex::encode(Sha256::digest(b"evil"));
        let err = p.unpack(&e, f.public(), None).unwrap_err();
        assert_eq!(err.kind, Kind::Invalid);
    }

    #[test]
    fn tampered_signature_fails_verify() {
        let f = Arc::new(Factotum::generate());
        let p = Packer::new(f.clone());
        let mut e = entry("ann@example.org/f");
        let _ = pack_all(&p, &mut e, b"signed data", 16, &[f.public().clone()]);

        let mut pd = decode_packdata(&hex::decode(&e.packdata).unwrap()).unwrap();
        // Flip a bit deep in R; keep it a valid scalar.
        let mut r = pad32(&pd.sig_r).unwrap();
        r[31] ^= 1;
        pd.sig_r = strip_zeros(&r);
        e.packdata = hex::encode(encode_packdata(&pd));

        let err = p.unpack(&e, f.public(), None).unwrap_err();
        assert_eq!(err.kind, Kind::Invalid);
        assert!(err.detail.contains("verify"));
    }

    #[test]
    fn tampered_wrap_cannot_decrypt() {
        let f = Arc::new(Factotum::generate());
        let p = Packer::new(f.clone());
        let mut e = entry("ann@example.org/f");
        let _ = pack_all(&p, &mut e, b"wrapped", 16, &[f.public().clone()]);

        let mut pd = decode_packdata(&hex::decode(&e.packdata).unwrap()).unwrap();
        let last = pd.wraps[0].encrypted.len() - 1;
        pd.wraps[0].encrypted[last] ^= 0xff;
        e.packdata = hex::encode(encode_packdata(&pd));

        let err = p.unpack(&e, f.public(), None).unwrap_err();
        assert_eq!(err.kind, Kind::CannotDecrypt);
    }

    #[test]
    fn wrong_writer_key_fails_verify() {
        let f = Arc::new(Factotum::generate());
        let other = Factotum::generate();
        let p = Packer::new(f.clone());
        let mut e = entry("ann@example.org/f");
        let _ = pack_all(&p, &mut e, b"data", 16, &[f.public().clone()]);
        let err = p.unpack(&e, other.public(), None).unwrap_err();
        assert_eq!(err.kind, Kind::Invalid);
    }

    #[test]
    fn share_adds_and_keeps_readers() {
        let writer = Arc::new(Factotum::generate());
        let reader = Arc::new(Factotum::generate());
        let p = Packer::new(writer.clone());
        let mut e = entry("ann@example.org/f");
        let store = pack_all(&p, &mut e, b"now shared", 16, &[writer.public().clone()]);

        // Before sharing the reader is locked out.
        let rp = Packer::new(reader.clone());
        assert!(rp.unpack(&e, writer.public(), None).is_err());

        let mut entries = [e];
        let n = p
            .share(&mut entries, &[writer.public().clone(), reader.public().clone()])
            .unwrap();
        assert_eq!(n, 1);
        let got = unpack_all(&rp, &entries[0], &store, writer.public()).unwrap();
        assert_eq!(got, b"now shared".to_vec());
        // The writer's own wrap was reused, not replaced.
        let got = unpack_all(&p, &entries[0], &store, writer.public()).unwrap();
        assert_eq!(got, b"now shared".to_vec());
    }

    #[test]
    fn name_resigns_and_drops_foreign_wraps_across_directories() {
        let writer = Arc::new(Factotum::generate());
        let reader = Arc::new(Factotum::generate());
        let p = Packer::new(writer.clone());
        let mut e = entry("ann@example.org/a/f");
        let store = pack_all(&p, &mut e, b"renamed", 16, &[writer.public().clone(), reader.public().clone()]);

        p.name(&mut e, "ann@example.org/b/f").unwrap();
        assert_eq!(e.name, "ann@example.org/b/f");

        // Still readable by the writer under the new name...
        let got = unpack_all(&p, &e, &store, writer.public()).unwrap();
        assert_eq!(got, b"renamed".to_vec());
        // ...but the foreign wrap is gone.
        let rp = Packer::new(reader);
        assert!(rp.unpack(&e, writer.public(), None).is_err());
    }

    #[test]
    fn name_within_directory_keeps_wraps() {
        let writer = Arc::new(Factotum::generate());
        let reader = Arc::new(Factotum::generate());
        let p = Packer::new(writer.clone());
        let mut e = entry("ann@example.org/a/f");
        let store = pack_all(&p, &mut e, b"same dir", 16, &[writer.public().clone(), reader.public().clone()]);

        p.name(&mut e, "ann@example.org/a/g").unwrap();
        let rp = Packer::new(reader);
        let got = unpack_all(&rp, &e, &store, writer.public()).unwrap();
        assert_eq!(got, b"same dir".to_vec());
    }

    #[test]
    fn packdata_codec_round_trip() {
        let pd = Packdata {
            sig_r: vec![1, 2, 3],
            sig_s: vec![4, 5],
            sig2_r: Vec::new(),
            sig2_s: Vec::new(),
            wraps: vec![WrappedKey {
                key_hash: vec![9; 32],
                encrypted: vec![7; 48],
                nonce: vec![3; 12],
                eph_x: vec![1; 32],
                eph_y: vec![2; 31],
            }],
            block_sum: vec![8; 32],
        };
        let enc = encode_packdata(&pd);
        assert_eq!(decode_packdata(&enc).unwrap(), pd);
    }

    #[test]
    fn packdata_rejects_unsupported_curves_and_junk() {
        let pd = Packdata {
            sig_r: vec![1],
            sig_s: vec![2],
            sig2_r: Vec::new(),
            sig2_s: Vec::new(),
            wraps: vec![WrappedKey {
                key_hash: vec![9; 32],
                encrypted: vec![7; 48],
                nonce: vec![3; 12],
                eph_x: vec![1; 48],
                eph_y: vec![2; 48], // P-384-sized Y
            }],
            block_sum: vec![8; 32],
        };
        let enc = encode_packdata(&pd);
        assert!(decode_packdata(&enc).is_err());
        assert!(decode_packdata(&[0x85]).is_err());
        assert!(decode_packdata(&[]).is_err());
    }
}
