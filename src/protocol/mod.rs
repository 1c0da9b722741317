//! Protocol definitions for client-broker communication
//!
//! One frame on the wire is `length (u32, big-endian) || iv[16] || ciphertext`,
//! where `length` covers `iv || ciphertext` and the ciphertext is the
//! AES-256-CBC encryption of a compact JSON object.

pub mod crypto;
mod message;

pub use message::{Command, OperationKind, Response, COMMAND_NAMES};

use anyhow::{anyhow, Result};
use crypto::SecretKey;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Hard cap on a single frame body to prevent memory exhaustion (100 MiB).
pub const MAX_FRAME_SIZE: u32 = 100 * 1024 * 1024;

/// AES block size; every frame body starts with one block of IV.
pub const IV_SIZE: usize = 16;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame length is zero")]
    EmptyFrame,

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("Encrypted data is too short to contain an IV")]
    TruncatedCiphertext,

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

/// Outcome of one extraction attempt against a receive buffer.
///
/// Only `Fatal` tears the connection down; everything recoverable (bad
/// ciphertext, bad JSON) is reported per-frame by [`open`].
#[derive(Debug)]
pub enum Decoded {
    /// A complete frame body (`iv || ciphertext`), length prefix stripped.
    Frame(Vec<u8>),
    /// Not enough buffered bytes yet.
    NeedMore,
    /// The peer violated framing; disconnect and drop the buffer.
    Fatal(ProtocolError),
}

/// Per-connection receive buffer with framed extraction.
///
/// Bytes are appended as they arrive; [`FrameDecoder::next_frame`] is then
/// polled until it reports `NeedMore`. A frame never spans extraction calls:
/// exactly `4 + length` bytes are consumed per returned frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of currently buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to extract the next complete frame body.
    pub fn next_frame(&mut self) -> Decoded {
        if self.buffer.len() < 4 {
            return Decoded::NeedMore;
        }

        let length = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);

        if length == 0 {
            self.buffer.clear();
            return Decoded::Fatal(ProtocolError::EmptyFrame);
        }
        if length > MAX_FRAME_SIZE {
            self.buffer.clear();
            return Decoded::Fatal(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = 4 + length as usize;
        if self.buffer.len() < total {
            return Decoded::NeedMore;
        }

        let rest = self.buffer.split_off(total);
        let mut frame = std::mem::replace(&mut self.buffer, rest);
        frame.drain(..4);
        Decoded::Frame(frame)
    }
}

/// Serialize a message to compact JSON bytes.
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Deserialize a message from JSON bytes.
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| anyhow!(ProtocolError::MalformedMessage(e.to_string())))
}

/// Prefix an encrypted frame body with its 4-byte big-endian length.
pub fn frame_body(body: &[u8]) -> Vec<u8> {
    let len = body.len() as u32;
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(body);
    framed
}

/// Serialize, encrypt under a fresh random IV, and frame in one operation.
pub fn seal<T: Serialize>(msg: &T, key: &SecretKey) -> Result<Vec<u8>> {
    let plain = serialize(msg)?;
    let body = crypto::encrypt(&plain, key);
    Ok(frame_body(&body))
}

/// Split a frame body into IV and ciphertext and decrypt it.
pub fn open_bytes(body: &[u8], key: &SecretKey) -> Result<Vec<u8>, ProtocolError> {
    if body.len() < IV_SIZE {
        return Err(ProtocolError::TruncatedCiphertext);
    }
    let (iv, ciphertext) = body.split_at(IV_SIZE);
    crypto::decrypt(ciphertext, iv, key).ok_or(ProtocolError::DecryptFailed)
}

/// Decrypt a frame body and parse the plaintext as a typed message.
pub fn open<T: DeserializeOwned>(body: &[u8], key: &SecretKey) -> Result<T, ProtocolError> {
    let plain = open_bytes(body, key)?;
    serde_json::from_slice(&plain).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
}

/// Decrypt a frame body and parse the plaintext as a raw JSON value.
///
/// The dispatcher validates the `command` field itself to produce the
/// protocol's specific error wording, so it receives the untyped value.
pub fn open_value(body: &[u8], key: &SecretKey) -> Result<serde_json::Value, ProtocolError> {
    open(body, key)
}
