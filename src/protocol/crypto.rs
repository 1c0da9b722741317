//! Transport encryption and per-host identity derivation
//!
//! The broker and every client derive the same AES-256 key and endpoint name
//! independently from host identity plus fixed salts, so the two processes
//! need no prior coordination. The key never leaves the host.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;

use super::IV_SIZE;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_SALT: &[u8] = b"74d83579f8gzpbhu9n";
const ENDPOINT_SALT: &[u8] = b"74d83579f8gzpbhu9n/endpoint";

/// 32-byte AES-256 transport key.
#[derive(Clone)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Derive the per-host transport key from host identity and the key salt.
    pub fn derive() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(host_identity());
        hasher.update(KEY_SALT);
        Self(hasher.finalize().into())
    }

    /// Wrap raw key material (used by tests and key rotation tooling).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Hostname plus machine id; the machine id is skipped when unreadable so
/// the derivation still works in minimal containers.
fn host_identity() -> Vec<u8> {
    let mut identity = Vec::new();
    identity.extend_from_slice(gethostname::gethostname().to_string_lossy().as_bytes());
    if let Ok(machine_id) = std::fs::read_to_string("/etc/machine-id") {
        identity.extend_from_slice(machine_id.trim().as_bytes());
    }
    identity
}

/// Stable per-host endpoint name, hex-encoded.
///
/// Names the Unix-socket the broker listens on; both sides compute it
/// independently.
pub fn endpoint_name() -> String {
    let mut hasher = Sha256::new();
    hasher.update(host_identity());
    hasher.update(ENDPOINT_SALT);
    hex::encode(hasher.finalize())
}

/// Encrypt plaintext under a fresh random IV; returns `iv || ciphertext`.
pub fn encrypt(plain: &[u8], key: &SecretKey) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), (&iv).into())
        .encrypt_padded_vec_mut::<Pkcs7>(plain);

    let mut body = Vec::with_capacity(IV_SIZE + ciphertext.len());
    body.extend_from_slice(&iv);
    body.extend_from_slice(&ciphertext);
    body
}

/// Decrypt `ciphertext` under `iv`; `None` on length or padding errors.
pub fn decrypt(ciphertext: &[u8], iv: &[u8], key: &SecretKey) -> Option<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), iv).ok()?;
    cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok()
}

/// SHA-256 of a file's contents, hex-encoded.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
