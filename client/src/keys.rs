//! The factotum: holder of the user's P-256 key material.
//!
//! All private-key operations the packer needs go through here: ECDSA
//! signing, and the scalar multiplication used to unwrap per-file keys.
//! After a key rotation the previous key is kept so old wraps stay
//! readable; the wrap to use is selected by the recipient key hash.

use std::fs;
use std::io::Write;
use std::path::Path;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, Scalar, SecretKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Kind, Result};

/// SHA-256 over the uncompressed point bytes; identifies a public key in
/// wrap lists and on the key registry.
pub fn key_hash_of(public: &PublicKey) -> [u8; 32] {
    let bytes = public.to_encoded_point(false);
    Sha256::digest(bytes.as_bytes()).into()
}

/// Verify `sig` over `msg` with `public`.
pub fn verify(public: &PublicKey, msg: &[u8], sig: &Signature) -> bool {
    VerifyingKey::from(public).verify(msg, sig).is_ok()
}

pub struct Factotum {
    secret: SecretKey,
    signer: SigningKey,
    public: PublicKey,
    key_hash: [u8; 32],
    previous: Option<(SecretKey, [u8; 32])>,
}

impl Factotum {
    pub fn from_secret(secret: SecretKey, previous: Option<SecretKey>) -> Self {
        let public = secret.public_key();
        let key_hash = key_hash_of(&public);
        let signer = SigningKey::from(&secret);
        let previous = previous.map(|p| {
            let h = key_hash_of(&p.public_key());
            (p, h)
        });
        Factotum { secret, signer, public, key_hash, previous }
    }

    pub fn generate() -> Self {
        Factotum::from_secret(SecretKey::random(&mut OsRng), None)
    }

    /// Parse from hex-encoded 32-byte scalars, current key first.
    pub fn from_hex(current: &str, previous: Option<&str>) -> Result<Self> {
        let cur = secret_from_hex(current)?;
        let prev = previous.map(secret_from_hex).transpose()?;
        Ok(Factotum::from_secret(cur, prev))
    }

    /// Read the secret file at `path` (one or two hex lines), or generate a
    /// fresh key and write it there.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = fs::read_to_string(path)
                .map_err(|e| Error::io("keyload", path.to_string_lossy(), e))?;
            let mut lines = text.lines().filter(|l| !l.trim().is_empty());
            let cur = lines.next().ok_or_else(|| {
                Error::new("keyload", path.to_string_lossy(), Kind::Invalid)
                    .with_detail("empty secret file")
            })?;
            let prev = lines.next();
            return Factotum::from_hex(cur.trim(), prev.map(str::trim));
        }

        let f = Factotum::generate();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::io("keygen", dir.to_string_lossy(), e))?;
        }
        let mut out = fs::File::create(path)
            .map_err(|e| Error::io("keygen", path.to_string_lossy(), e))?;
        writeln!(out, "{}", hex::encode(f.secret.to_bytes()))
            .map_err(|e| Error::io("keygen", path.to_string_lossy(), e))?;
        Ok(f)
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Hex uncompressed point, the registry representation.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.to_encoded_point(false).as_bytes())
    }

    pub fn key_hash(&self) -> &[u8; 32] {
        &self.key_hash
    }

    /// Whether `hash` names this factotum's current or previous key.
    pub fn owns_hash(&self, hash: &[u8]) -> bool {
        hash == self.key_hash.as_slice()
            || matches!(&self.previous, Some((_, h)) if hash == h.as_slice())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signer.sign(msg)
    }

    /// Compute `r·V` for the stored private key identified by `key_hash`
    /// and marshal it as uncompressed point bytes. This is the only place a
    /// private scalar touches foreign data.
    pub fn shared_secret(&self, key_hash: &[u8], ephemeral: &PublicKey) -> Result<Vec<u8>> {
        let secret = if key_hash == self.key_hash.as_slice() {
            &self.secret
        } else {
            match &self.previous {
                Some((prev, h)) if key_hash == h.as_slice() => prev,
                _ => {
                    return Err(Error::new("unwrap", "", Kind::CannotDecrypt)
                        .with_detail("no private key for recipient hash"))
                }
            }
        };
        let scalar: Scalar = *secret.to_nonzero_scalar();
        let shared = (ephemeral.to_projective() * scalar).to_affine();
        Ok(shared.to_encoded_point(false).as_bytes().to_vec())
    }
}

fn secret_from_hex(s: &str) -> Result<SecretKey> {
    let bytes = hex::decode(s)
        .map_err(|e| Error::new("keyload", "", Kind::Invalid).with_detail(e.to_string()))?;
    SecretKey::from_slice(&bytes)
        .map_err(|e| Error::new("keyload", "", Kind::Invalid).with_detail(e.to_string()))
}
